use thiserror::Error;

/// Push channel failures. These never reach cache consumers: the transport
/// logs them and reconnects.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid push URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection refused: {0}")]
    Refused(String),
}
