use thiserror::Error;

/// Error kinds surfaced by the pool, the timeout manager, and configuration
/// validation. Session-internal failures (bad request line, handler panics,
/// timed-out requests) never escape the session's drive loop — they are
/// mapped to HTTP responses instead, per the propagation policy.
#[derive(Debug, Error)]
pub enum HttpCoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("shutdown in progress")]
    Shutdown,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, HttpCoreError>;
