//! Error types for the metadata cache.

/// Errors that can occur while reading or writing cached metadata.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("encode error: {0}")]
    Encode(postcard::Error),

    #[error("decode error for {key}: {source}")]
    Decode {
        key: &'static str,
        source: postcard::Error,
    },
}
