//! Error types for the streaming server

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("No usable network address found")]
    NoAddress,

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,
}

/// Peer protocol violations; each closes the offending peer only
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown command: {0}")]
    UnknownCommand(u32),

    #[error("Duplicate play request on the same connection")]
    DuplicateStartPlay,

    #[error("Format message too large: {0} bytes")]
    FormatTooLarge(usize),

    #[error("Listener limit reached")]
    ServerFull,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
