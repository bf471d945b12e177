//! Error types for the Platewatch client

/// Main error type for Platewatch client operations
#[derive(Debug, thiserror::Error)]
pub enum PlatewatchError {
    /// A command was issued in a state that cannot accept it
    /// (e.g. starting a stream with no active connection).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Malformed or undecodable protocol frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Upload or result retrieval failure against the REST API
    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// Implement From conversions for common error types

impl From<std::io::Error> for PlatewatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PlatewatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PlatewatchError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<reqwest::Error> for PlatewatchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Api(err.to_string())
    }
}

/// Result type alias for Platewatch client operations
pub type Result<T> = std::result::Result<T, PlatewatchError>;
