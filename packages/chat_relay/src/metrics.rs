//! Relay metrics for observability
//!
//! Counters are diagnostic only; routing never depends on them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open sessions
    pub active_connections: AtomicU64,
    /// Sessions opened since start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Text frames received from clients
    pub frames_received: AtomicU64,
    /// Frames that were not valid JSON and were broadcast verbatim
    pub decode_fallbacks: AtomicU64,
    /// Directed messages handled
    pub directed: AtomicU64,
    /// Directed messages whose recipient was absent or unreachable
    pub route_misses: AtomicU64,
    /// Broadcasts fanned out (including departure notices)
    pub broadcasts: AtomicU64,
    /// Individual broadcast sends accepted by a recipient's queue
    pub broadcast_deliveries: AtomicU64,

    // Error metrics
    /// Sessions that ended because the connection failed, including peers
    /// that went away without a close frame
    pub transport_errors: AtomicU64,
    /// Sessions that ended on a caught panic
    pub session_faults: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_fallback(&self) {
        self.decode_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn directed_routed(&self, delivered: bool) {
        self.directed.fetch_add(1, Ordering::Relaxed);
        if !delivered {
            self.route_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn broadcast_sent(&self, delivered: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.broadcast_deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_fault(&self) {
        self.session_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics.
    ///
    /// `dropped` is owned by the registry and passed in by the caller.
    pub fn snapshot(&self, dropped: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                decode_fallbacks: self.decode_fallbacks.load(Ordering::Relaxed),
                directed: self.directed.load(Ordering::Relaxed),
                route_misses: self.route_misses.load(Ordering::Relaxed),
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
                broadcast_deliveries: self.broadcast_deliveries.load(Ordering::Relaxed),
                dropped,
            },
            errors: ErrorMetrics {
                transport: self.transport_errors.load(Ordering::Relaxed),
                faults: self.session_faults.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub decode_fallbacks: u64,
    pub directed: u64,
    pub route_misses: u64,
    pub broadcasts: u64,
    pub broadcast_deliveries: u64,
    /// Texts dropped because the recipient's queue was full
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub transport: u64,
    pub faults: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: usize,
    pub users: Vec<String>,
    pub uptime_secs: u64,
}
