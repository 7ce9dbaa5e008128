//! Error types for the transform-copy engine.

/// Errors that can occur while running a transform-copy job.
#[derive(Debug, thiserror::Error)]
pub enum XcopyError {
    #[error("job {0} is unknown or already finished")]
    UnknownJob(String),

    #[error("job {0} already pending")]
    DuplicateJob(String),

    #[error("this target is not active in cluster map v{0}")]
    NotActive(u64),

    #[error("unknown etl transform {0:?}")]
    UnknownEtl(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Template(#[from] atoll_types::template::TemplateError),

    #[error("store error: {0}")]
    Store(#[from] atoll_store::StoreError),

    #[error("transport error: {0}")]
    Net(#[from] atoll_net::NetError),

    #[error("{0}")]
    Placement(#[from] atoll_placement::PlacementError),

    #[error("quiesce timeout: {missing} done signal(s) still outstanding")]
    QuiesceTimeout { missing: i32 },

    #[error("job aborted: {0}")]
    Aborted(String),

    #[error("etl transform failed on {obj}: {reason}")]
    EtlFailed { obj: String, reason: String },
}
