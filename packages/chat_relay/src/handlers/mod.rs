pub mod health;

// Re-export all handlers for easy route registration
pub use crate::ws::websocket_handler;
pub use health::{health_handler, health_live_handler, metrics_handler};
