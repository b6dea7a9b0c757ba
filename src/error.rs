//! Error types for cloud-tunnel

use thiserror::Error;

/// Main error type for cloud-tunnel
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upstream not allowed: {0}")]
    Routing(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for cloud-tunnel
pub type Result<T> = std::result::Result<T, Error>;
