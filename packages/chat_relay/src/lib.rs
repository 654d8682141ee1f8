//! Chat Relay
//!
//! WebSocket chat server: clients connect to `/ws/{username}` and send
//! `{"to": "...", "message": "..."}` frames. Messages with a recipient are
//! delivered privately, everything else is broadcast.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod smoke;
pub mod views;
pub mod ws;

use axum::{Router, routing::get};
use chat_registry::Registry;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::metrics::ServerMetrics;
use crate::session::Relay;

/// Shared state handed to every route
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            relay: Arc::new(Relay::new(
                Arc::new(Registry::new()),
                Arc::new(ServerMetrics::new()),
                session,
            )),
        }
    }
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(views::index_page))
        .route("/ws/{username}", get(handlers::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
