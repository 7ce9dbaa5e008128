//! S3-compatible error types and XML error responses.

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;

use crate::xml;

/// Errors returned by the S3 surface (gateway and target data path).
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    /// Malformed S3 request shape (bad arity, bad query, bad XML body).
    #[error("invalid s3 request: {message}")]
    InvalidRequest { message: String },

    /// Object-name policy violation.
    #[error("{0}")]
    BadName(#[from] atoll_types::NameError),

    #[error("no such bucket: {bucket}")]
    NoSuchBucket { bucket: String },

    #[error("bucket name {bucket} is ambiguous across providers")]
    AmbiguousBucket { bucket: String },

    #[error("no such key: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    #[error("no such upload: {upload_id}")]
    NoSuchUpload { upload_id: String },

    #[error("bucket {bucket} already exists")]
    BucketAlreadyExists { bucket: String },

    #[error("access denied")]
    AccessDenied,

    /// Bucket subresource we deliberately do not implement.
    #[error("not implemented: {what}")]
    NotImplemented { what: String },

    /// Redirected request older than the acceptance window.
    #[error("request is too old (uts {uts})")]
    StaleRequest { uts: u64 },

    #[error("{0}")]
    Placement(#[from] atoll_placement::PlacementError),

    #[error("cluster error: {0}")]
    Cluster(#[from] atoll_cluster::ClusterError),

    #[error("store error: {0}")]
    Store(#[from] atoll_store::StoreError),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl S3Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::BadName(_) => StatusCode::BAD_REQUEST,
            Self::NoSuchBucket { .. } => StatusCode::NOT_FOUND,
            Self::AmbiguousBucket { .. } => StatusCode::BAD_REQUEST,
            Self::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            Self::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            Self::BucketAlreadyExists { .. } => StatusCode::CONFLICT,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::StaleRequest { .. } => StatusCode::BAD_REQUEST,
            // No active targets: the cluster cannot serve data right now.
            Self::Placement(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(atoll_store::StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Cluster(_) | Self::Store(_) | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn s3_code(&self) -> &str {
        match self {
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::BadName(_) => "InvalidArgument",
            Self::NoSuchBucket { .. } => "NoSuchBucket",
            Self::AmbiguousBucket { .. } => "InvalidBucketName",
            Self::NoSuchKey { .. } => "NoSuchKey",
            Self::NoSuchUpload { .. } => "NoSuchUpload",
            Self::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            Self::AccessDenied => "AccessDenied",
            Self::NotImplemented { .. } => "NotImplemented",
            Self::StaleRequest { .. } => "RequestTimeTooSkewed",
            Self::Placement(_) => "ServiceUnavailable",
            Self::Store(atoll_store::StoreError::NotFound(_)) => "NoSuchKey",
            Self::Cluster(_) | Self::Store(_) | Self::Internal { .. } => "InternalError",
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        // 501 on a known-unsupported subresource carries no body.
        if status == StatusCode::NOT_IMPLEMENTED {
            return Response::builder()
                .status(status)
                .body(Body::empty())
                .expect("static response");
        }
        let body = xml::error_xml(self.s3_code(), &self.to_string());
        Response::builder()
            .status(status)
            .header("content-type", "application/xml")
            .body(Body::from(body))
            .expect("static response")
    }
}
