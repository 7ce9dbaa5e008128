//! Error types for data-mover operations.

/// Errors that can occur on the data-mover paths.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("stream open error: {0}")]
    StreamOpen(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record too large: {0} bytes (max {1})")]
    RecordTooLarge(usize, usize),

    #[error("no route to node {0}")]
    NoRoute(String),

    #[error("no receive handler registered for job {0}")]
    NoHandler(String),

    #[error("receiver rejected record: {0}")]
    Rejected(String),

    #[error("data mover already closed")]
    AlreadyClosed,
}
