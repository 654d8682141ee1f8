//! Chat Registry - in-memory username to connection routing
//!
//! This crate tracks which usernames are currently connected and routes text
//! to them, either to a single recipient or to everyone. It has no HTTP or
//! WebSocket dependencies: a connection is represented by a [`ConnectionHandle`],
//! a cloneable sender into the connection's outbound queue. Whoever owns the
//! receiving end of that queue owns the connection.
//!
//! # Example
//!
//! ```no_run
//! use chat_registry::{ConnectionHandle, Registry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Registry::new();
//!
//!     let (alice, _alice_rx) = ConnectionHandle::channel(16);
//!     let (bob, mut bob_rx) = ConnectionHandle::channel(16);
//!     registry.register("alice", alice).await;
//!     registry.register("bob", bob).await;
//!
//!     // Directed
//!     assert!(registry.route_to("bob", "(private) alice: hi").await);
//!     println!("bob got {:?}", bob_rx.recv().await);
//!
//!     // Broadcast to a snapshot of everyone registered right now
//!     let delivered = registry.broadcast("alice: hello all").await;
//!     println!("broadcast reached {} connections", delivered);
//! }
//! ```

mod error;
mod handle;
mod registry;

pub use error::SendError;
pub use handle::{ConnectionHandle, ConnectionId};
pub use registry::Registry;
