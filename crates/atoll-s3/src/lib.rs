//! S3-compatible HTTP surface for Atoll.
//!
//! Two halves share this crate:
//!
//! - [`S3Gateway`] — the proxy side. Parses S3 verbs, validates against
//!   the bucket metadata, asks the rendezvous router for the owning
//!   target, and either redirects the client (HTTP 307, method and body
//!   preserved) or fans out (multi-object delete, multipart listing,
//!   paged object listing). Mutating bucket operations are forwarded to
//!   the primary proxy and the response relayed verbatim.
//! - [`target::TargetServer`] — the data path the redirects land on:
//!   object GET/PUT/HEAD/DELETE plus multipart state, served from the
//!   local blob store.
//!
//! The surface mounts under `/s3` by default, or at the URL root when
//! the cluster carries the corresponding feature flag.

mod error;
mod handlers;
mod redirect;
pub mod target;
mod xml;


use std::sync::Arc;

use atoll_cluster::{BmdOwner, CpClient, SmapOwner};
use atoll_types::clock::MonoClock;
use atoll_types::{features, NodeId};
use axum::routing::get;
use axum::Router;

pub use error::S3Error;

/// `Server` header advertised on gateway responses.
pub const SERVER_NAME: &str = "atoll-gateway";

/// Synthetic region reported in `x-amz-bucket-region`.
pub const REGION: &str = "atoll";

/// Query parameter carrying the monotonic redirect timestamp.
pub const QPARAM_UTS: &str = "uts";

/// Query parameter carrying the network-role hint (`data` | `control`).
pub const QPARAM_NET: &str = "net";

/// Shared state of the proxy-side gateway.
pub struct GatewayInner {
    pub node_id: NodeId,
    pub smap: Arc<SmapOwner>,
    pub bmd: Arc<BmdOwner>,
    pub cp: CpClient,
    pub clock: MonoClock,
    /// Cluster-default feature bits; buckets may override.
    pub cluster_features: u64,
    /// HEAD on objects reverse-proxies by default because S3 clients do
    /// not follow redirects on HEAD; this knob flips it back to 307.
    pub head_via_redirect: bool,
}

/// Cloneable handle used as the axum state.
#[derive(Clone)]
pub struct GatewayState(pub Arc<GatewayInner>);

impl std::ops::Deref for GatewayState {
    type Target = GatewayInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The proxy-side S3 gateway service.
pub struct S3Gateway {
    router: Router,
}

impl S3Gateway {
    pub fn new(state: GatewayState) -> Self {
        let prefix = if state.cluster_features & features::S3_API_VIA_ROOT != 0 {
            ""
        } else {
            "/s3"
        };
        Self {
            router: Self::build_router(state, prefix),
        }
    }

    fn build_router(state: GatewayState, prefix: &str) -> Router {
        let mut router = Router::new();
        if prefix.is_empty() {
            router = router.route("/", get(handlers::list_buckets));
        } else {
            router = router
                .route(prefix, get(handlers::list_buckets))
                .route(&format!("{prefix}/"), get(handlers::list_buckets));
        }
        router
            .route(
                &format!("{prefix}/{{bucket}}"),
                get(handlers::bucket_get)
                    .put(handlers::bucket_put)
                    .delete(handlers::bucket_delete)
                    .head(handlers::bucket_head)
                    .post(handlers::bucket_post),
            )
            .route(
                &format!("{prefix}/{{bucket}}/{{*key}}"),
                get(handlers::object_get)
                    .put(handlers::object_put)
                    .delete(handlers::object_delete)
                    .head(handlers::object_head)
                    .post(handlers::object_post),
            )
            .with_state(state)
    }

    /// The inner router (tests drive it with `tower::ServiceExt`).
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve on the given TCP address.
    pub async fn serve(self, addr: &str) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "s3 gateway listening");
        axum::serve(listener, self.router).await
    }
}
