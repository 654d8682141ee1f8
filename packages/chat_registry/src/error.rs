/// Errors returned when writing to a connection handle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection's outbound queue has been dropped by its owner
    #[error("connection {0} is closed")]
    Closed(crate::ConnectionId),

    /// The connection is not draining its outbound queue; the text was dropped
    #[error("connection {0} outbound queue is full")]
    Full(crate::ConnectionId),
}
