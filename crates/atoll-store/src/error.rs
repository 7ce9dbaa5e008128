//! Error types for blob-store operations.

/// Errors that can occur during blob-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    #[error("bad attribute sidecar for {name}: {source}")]
    BadAttrs {
        name: String,
        source: postcard::Error,
    },

    #[error("mountpath index {0} out of range")]
    BadMountpath(usize),
}
