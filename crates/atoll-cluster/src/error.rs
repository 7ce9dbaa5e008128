//! Error types for cluster operations.

/// Errors that can occur in cluster-map, metadata, and control-plane paths.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} version regression: have v{current}, got v{offered}")]
    VersionRegression {
        kind: &'static str,
        current: u64,
        offered: u64,
    },

    #[error("this node is not the primary (primary is {0})")]
    NotPrimary(String),

    #[error("cluster map has no reachable primary")]
    NoPrimary,

    #[error("bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("peer {url} answered {status}: {body}")]
    PeerStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("join failed; tried {0:?}")]
    JoinFailed(Vec<String>),

    #[error("listing page echoed job {got} instead of {want}")]
    ListUuidMismatch { want: String, got: String },

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Template(#[from] atoll_types::template::TemplateError),
}
