//! Session Loop
//!
//! One loop per connection, run as its own task:
//! - CONNECTING: allocate the outbound queue and register the username
//! - ACTIVE: decode each inbound frame and route it through the registry
//! - CLOSING: entered on close frame, end of stream, transport error or a caught panic
//! - CLOSED: deregister, then announce the departure to everyone still connected
//!
//! The loop is transport-neutral. It reads [`Inbound`] events from any
//! `Stream` and writes plain text to any `Sink<String>`; the WebSocket
//! adapter lives in `ws`.

use chat_registry::{ConnectionHandle, ConnectionId, Registry, SendError};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use std::any::Any;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::protocol::{
    RoutingIntent, broadcast_text, confirmation_text, departure_text, private_text,
};

/// How long cleanup waits for the writer to flush before giving up on it
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-neutral inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame from the client
    Text(String),
    /// The client asked to close the connection
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session left the ACTIVE state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame
    ClientClosed,
    /// Inbound stream ended without a close frame
    StreamEnded,
    /// Receiving from, or writing to, the connection failed
    Transport(String),
    /// A panic was caught while decoding or routing
    Fault(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("receive failed: {0}")]
    Receive(String),

    #[error("own connection unwritable: {0}")]
    Send(#[from] SendError),
}

/// Shared routing core: the registry plus everything a session needs to use it.
pub struct Relay {
    registry: Arc<Registry>,
    metrics: Arc<ServerMetrics>,
    config: SessionConfig,
}

impl Relay {
    pub fn new(registry: Arc<Registry>, metrics: Arc<ServerMetrics>, config: SessionConfig) -> Self {
        Self {
            registry,
            metrics,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Metrics snapshot including texts the registry dropped on full queues
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.registry.dropped())
    }

    /// Run one connection from registration to cleanup.
    ///
    /// Never panics and never returns early: whatever ends the ACTIVE phase,
    /// the username is deregistered and the departure is broadcast exactly once.
    pub async fn run_session<R, E, W>(&self, username: String, inbound: R, outbound: W) -> CloseReason
    where
        R: Stream<Item = Result<Inbound, E>> + Send,
        E: Display,
        W: Sink<String> + Send + 'static,
        W::Error: Display,
    {
        let mut state = SessionState::Connecting;

        let (handle, rx) = ConnectionHandle::channel(self.config.outbound_buffer.max(1));
        let conn_id = handle.id();
        let writer = tokio::spawn(write_outbound(rx, outbound, conn_id));

        if let Some(replaced) = self.registry.register(username.clone(), handle.clone()).await {
            info!(%username, %conn_id, %replaced, "username taken over by new connection");
        }
        self.metrics.connection_opened();
        let total = self.registry.count().await;
        info!(%username, %conn_id, total, "client connected");
        state = transition(&username, state, SessionState::Active);

        let routed = AssertUnwindSafe(self.route_frames(&username, &handle, inbound))
            .catch_unwind()
            .await;
        let reason = match routed {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => CloseReason::Transport(e.to_string()),
            Err(panic) => CloseReason::Fault(panic_message(panic.as_ref())),
        };
        state = transition(&username, state, SessionState::Closing);

        match &reason {
            CloseReason::ClientClosed | CloseReason::StreamEnded => {
                info!(%username, %conn_id, ?reason, "client disconnected");
            }
            CloseReason::Transport(e) => {
                // Peers vanishing without a close frame end up here too
                self.metrics.transport_error();
                info!(%username, %conn_id, error = %e, "client connection failed");
            }
            CloseReason::Fault(e) => {
                self.metrics.session_fault();
                error!(%username, %conn_id, error = %e, "session fault");
            }
        }

        self.cleanup(&username, handle, writer).await;
        transition(&username, state, SessionState::Closed);
        reason
    }

    async fn route_frames<R, E>(
        &self,
        username: &str,
        handle: &ConnectionHandle,
        inbound: R,
    ) -> Result<CloseReason, SessionError>
    where
        R: Stream<Item = Result<Inbound, E>>,
        E: Display,
    {
        futures::pin_mut!(inbound);
        while let Some(event) = inbound.next().await {
            let text = match event.map_err(|e| SessionError::Receive(e.to_string()))? {
                Inbound::Close => return Ok(CloseReason::ClientClosed),
                Inbound::Text(text) => text,
            };
            self.metrics.frame_received();
            self.dispatch(username, handle, &text).await?;
        }
        Ok(CloseReason::StreamEnded)
    }

    /// Route a single raw frame sent by `sender`.
    ///
    /// `own` is the sender's connection; it is only used for the private
    /// message echo. Fails only when the sender's own connection is closed.
    pub async fn dispatch(
        &self,
        sender: &str,
        own: &ConnectionHandle,
        raw: &str,
    ) -> Result<(), SessionError> {
        let (intent, fallback) = RoutingIntent::decode_or_broadcast(raw);
        if fallback {
            self.metrics.decode_fallback();
            debug!(%sender, "frame is not a routing object, broadcasting raw text");
        }

        match intent {
            RoutingIntent::Directed { recipient, body } => {
                let delivered = self
                    .registry
                    .route_to(&recipient, private_text(sender, &body))
                    .await;
                self.metrics.directed_routed(delivered);
                info!(%sender, %recipient, delivered, len = body.len(), "private message");

                if delivered || !self.config.confirm_on_delivery_only {
                    match own.send(confirmation_text(&recipient, &body)) {
                        Ok(()) => {}
                        Err(SendError::Full(_)) => {
                            warn!(%sender, %recipient, "own queue full, dropped confirmation");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            RoutingIntent::Broadcast { body } => {
                let delivered = self.broadcast(&broadcast_text(sender, &body)).await;
                info!(%sender, delivered, len = body.len(), "broadcast message");
            }
        }
        Ok(())
    }

    async fn broadcast(&self, text: &str) -> usize {
        let delivered = self.registry.broadcast(text).await;
        self.metrics.broadcast_sent(delivered);
        delivered
    }

    async fn cleanup(&self, username: &str, handle: ConnectionHandle, mut writer: JoinHandle<()>) {
        let conn_id = handle.id();
        self.registry.deregister(username, conn_id).await;
        drop(handle);

        self.broadcast(&departure_text(username)).await;
        self.metrics.connection_closed();

        // The writer ends once every clone of our handle is gone, after
        // flushing whatever was still queued. A transport that stopped
        // accepting writes would hold it forever.
        match tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%username, %conn_id, error = %e, "outbound writer task failed"),
            Err(_) => {
                warn!(%username, %conn_id, "outbound writer stalled, aborting");
                writer.abort();
            }
        }

        let total = self.registry.count().await;
        info!(%username, %conn_id, total, "client cleanup complete");
    }
}

fn transition(username: &str, from: SessionState, to: SessionState) -> SessionState {
    debug!(%username, ?from, ?to, "session state");
    to
}

/// Drain a connection's queue into its transport, one frame at a time.
async fn write_outbound<W>(mut rx: mpsc::Receiver<String>, outbound: W, conn_id: ConnectionId)
where
    W: Sink<String>,
    W::Error: Display,
{
    futures::pin_mut!(outbound);
    while let Some(text) = rx.recv().await {
        if let Err(e) = outbound.send(text).await {
            debug!(%conn_id, error = %e, "outbound write failed");
            return;
        }
    }
    if let Err(e) = outbound.close().await {
        debug!(%conn_id, error = %e, "outbound close failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    const WAIT: Duration = Duration::from_secs(2);

    struct TestClient {
        tx: fmpsc::UnboundedSender<Result<Inbound, String>>,
        rx: fmpsc::UnboundedReceiver<String>,
        task: JoinHandle<CloseReason>,
    }

    impl TestClient {
        fn send(&self, text: &str) {
            self.tx
                .unbounded_send(Ok(Inbound::Text(text.to_string())))
                .unwrap();
        }

        async fn recv(&mut self) -> String {
            tokio::time::timeout(WAIT, self.rx.next())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound stream ended")
        }

        async fn close(self) -> (CloseReason, fmpsc::UnboundedReceiver<String>) {
            self.tx.unbounded_send(Ok(Inbound::Close)).unwrap();
            let reason = tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap();
            (reason, self.rx)
        }
    }

    fn relay(config: SessionConfig) -> Arc<Relay> {
        Arc::new(Relay::new(
            Arc::new(Registry::new()),
            Arc::new(ServerMetrics::new()),
            config,
        ))
    }

    async fn wait_registered(relay: &Relay, username: &str) {
        tokio::time::timeout(WAIT, async {
            while relay.registry().lookup(username).await.is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("username never registered");
    }

    async fn connect(relay: &Arc<Relay>, username: &str) -> TestClient {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let task = {
            let relay = relay.clone();
            let username = username.to_string();
            tokio::spawn(async move { relay.run_session(username, in_rx, out_tx).await })
        };
        wait_registered(relay, username).await;
        TestClient {
            tx: in_tx,
            rx: out_rx,
            task,
        }
    }

    /// A transport that never accepts a write
    struct StalledSink;

    impl futures::Sink<String> for StalledSink {
        type Error = Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: String) -> Result<(), Infallible> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_directed_delivery() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;

        alice.send(r#"{"to": "bob", "message": "hi"}"#);

        assert_eq!(bob.recv().await, "(private) alice: hi");
        assert_eq!(alice.recv().await, "(to bob) You: hi");
    }

    #[tokio::test]
    async fn test_directed_to_absent_recipient_still_confirms() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;

        alice.send(r#"{"to": "carol", "message": "x"}"#);

        assert_eq!(alice.recv().await, "(to carol) You: x");
        assert_eq!(relay.snapshot().messages.route_misses, 1);
    }

    #[tokio::test]
    async fn test_confirmation_can_require_delivery() {
        let relay = relay(SessionConfig {
            confirm_on_delivery_only: true,
            ..Default::default()
        });
        let mut alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;

        alice.send(r#"{"to": "carol", "message": "lost"}"#);
        alice.send(r#"{"to": "bob", "message": "found"}"#);

        assert_eq!(bob.recv().await, "(private) alice: found");
        // No echo for the message to carol
        assert_eq!(alice.recv().await, "(to bob) You: found");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_sender_and_others() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;

        alice.send(r#"{"message": "hello everyone"}"#);

        assert_eq!(bob.recv().await, "alice: hello everyone");
        assert_eq!(alice.recv().await, "alice: hello everyone");
    }

    #[tokio::test]
    async fn test_malformed_frame_falls_back_to_broadcast() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;

        alice.send("not json");

        assert_eq!(bob.recv().await, "alice: not json");
        assert_eq!(alice.recv().await, "alice: not json");
        assert_eq!(relay.snapshot().messages.decode_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_frames_from_one_sender_keep_order() {
        let relay = relay(SessionConfig::default());
        let alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;

        for i in 0..50 {
            alice.send(&format!(r#"{{"message": "{i}"}}"#));
        }
        for i in 0..50 {
            assert_eq!(bob.recv().await, format!("alice: {i}"));
        }
    }

    #[tokio::test]
    async fn test_close_cleans_up_and_announces_once() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;
        let bob = connect(&relay, "bob").await;
        assert_eq!(relay.registry().count().await, 2);

        let (reason, mut bob_rx) = bob.close().await;
        assert_eq!(reason, CloseReason::ClientClosed);
        assert_eq!(relay.registry().count().await, 1);
        assert_eq!(alice.recv().await, "bob left the chat");

        // Later broadcasts skip bob, and no second departure notice arrives
        alice.send("anyone?");
        assert_eq!(alice.recv().await, "alice: anyone?");
        assert_eq!(bob_rx.next().await, None);
        assert_eq!(relay.snapshot().connections.active, 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_cleans_up() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;
        let bob = connect(&relay, "bob").await;

        drop(bob.tx);
        let reason = tokio::time::timeout(WAIT, bob.task).await.unwrap().unwrap();

        assert_eq!(reason, CloseReason::StreamEnded);
        assert_eq!(alice.recv().await, "bob left the chat");
        assert!(relay.registry().lookup("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_cleans_up() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;
        let bob = connect(&relay, "bob").await;

        bob.tx.unbounded_send(Err("connection reset".into())).unwrap();
        let reason = tokio::time::timeout(WAIT, bob.task).await.unwrap().unwrap();

        assert!(matches!(reason, CloseReason::Transport(ref e) if e.contains("connection reset")));
        assert_eq!(alice.recv().await, "bob left the chat");
        assert_eq!(relay.registry().count().await, 1);
        let snapshot = relay.snapshot();
        assert_eq!(snapshot.errors.transport, 1);
        assert_eq!(snapshot.errors.faults, 0);
    }

    #[tokio::test]
    async fn test_panic_before_first_message_still_cleans_up() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;

        let exploding = futures::stream::poll_fn(|_| -> Poll<Option<Result<Inbound, String>>> {
            panic!("transport exploded")
        });
        let (out_tx, _out_rx) = fmpsc::unbounded::<String>();
        let reason = relay
            .run_session("mallory".to_string(), exploding, out_tx)
            .await;

        assert_eq!(reason, CloseReason::Fault("transport exploded".into()));
        assert_eq!(relay.snapshot().errors.faults, 1);
        assert!(relay.registry().lookup("mallory").await.is_none());
        assert_eq!(relay.registry().count().await, 1);
        assert_eq!(alice.recv().await, "mallory left the chat");
    }

    #[tokio::test]
    async fn test_replaced_connection_does_not_evict_successor() {
        let relay = relay(SessionConfig::default());
        let mut bob = connect(&relay, "bob").await;
        let first = connect(&relay, "alice").await;
        let first_id = relay.registry().lookup("alice").await.unwrap().id();

        let mut second = connect(&relay, "alice").await;
        // Wait for the takeover to land
        tokio::time::timeout(WAIT, async {
            while relay.registry().lookup("alice").await.map(|h| h.id()) == Some(first_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (reason, _) = first.close().await;
        assert_eq!(reason, CloseReason::ClientClosed);
        assert_eq!(bob.recv().await, "alice left the chat");

        // The newer alice is still registered, so she hears the old one leave
        assert_eq!(second.recv().await, "alice left the chat");
        bob.send(r#"{"to": "alice", "message": "still there?"}"#);
        assert_eq!(second.recv().await, "(private) bob: still there?");
        assert_eq!(relay.registry().count().await, 2);
    }

    #[tokio::test]
    async fn test_stalled_recipient_does_not_block_others() {
        let relay = relay(SessionConfig {
            outbound_buffer: 8,
            ..Default::default()
        });
        let mut alice = connect(&relay, "alice").await;
        let mut carol = connect(&relay, "carol").await;

        let (_bob_tx, bob_rx) = fmpsc::unbounded::<Result<Inbound, String>>();
        let bob = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.run_session("bob".to_string(), bob_rx, StalledSink).await })
        };
        wait_registered(&relay, "bob").await;

        // Far more than bob's queue holds
        for i in 0..32 {
            alice.send(&format!(r#"{{"message": "m{i}"}}"#));
            assert_eq!(carol.recv().await, format!("alice: m{i}"));
            assert_eq!(alice.recv().await, format!("alice: m{i}"));
        }

        alice.send(r#"{"to": "carol", "message": "dm"}"#);
        assert_eq!(carol.recv().await, "(private) alice: dm");
        assert_eq!(alice.recv().await, "(to carol) You: dm");
        assert!(relay.snapshot().messages.dropped > 0);

        let (reason, _) = alice.close().await;
        assert_eq!(reason, CloseReason::ClientClosed);
        assert_eq!(carol.recv().await, "alice left the chat");
        assert!(relay.registry().lookup("alice").await.is_none());
        assert_eq!(relay.registry().count().await, 2);

        bob.abort();
    }

    #[tokio::test]
    async fn test_message_to_self() {
        let relay = relay(SessionConfig::default());
        let mut alice = connect(&relay, "alice").await;

        alice.send(r#"{"to": "alice", "message": "note"}"#);

        assert_eq!(alice.recv().await, "(private) alice: note");
        assert_eq!(alice.recv().await, "(to alice) You: note");
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
