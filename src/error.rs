use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum DuetError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Outbound message serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// The client failed the human-verification check.
    #[error("verification failed")]
    VerificationFailed,
    /// The client never completed verification within the allowed time.
    #[error("verification timed out")]
    VerificationTimeout,
}
