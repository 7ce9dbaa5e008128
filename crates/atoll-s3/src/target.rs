//! Target-side object data path.
//!
//! Redirected object requests land here: GET/PUT/DELETE/HEAD plus the
//! multipart verbs, served straight from the local blob store. The
//! proxy routed by hash, so every object addressed to this server is
//! owned here, with the one exception of server-side copy, where this
//! target owns the *source* and pushes the destination to its owner.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use atoll_cluster::{BmdOwner, CpClient, SmapOwner};
use atoll_placement::hrw_target;
use atoll_types::clock::wall_nanos;
use atoll_types::{validate_obj_name, Bck, ChecksumType, Cksum, NodeId, ObjAttrs};
use atoll_store::{ObjectStore, Owt};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::S3Error;
use crate::{xml, QPARAM_UTS, REGION, SERVER_NAME};

type Params = BTreeMap<String, String>;
type S3Result = Result<Response<Body>, S3Error>;

/// Standard headers stored as object attributes and returned as-is.
const PASSTHROUGH_HEADERS: &[&str] = &[
    "content-type",
    "content-md5",
    "cache-control",
    "content-encoding",
    "x-amz-checksum-sha256",
];

/// In-flight multipart upload state. Target-local by design: the proxy
/// routes every multipart verb of an upload to the same owner.
pub struct MultipartUpload {
    pub bucket: String,
    pub key: String,
    pub parts: BTreeMap<u16, Vec<u8>>,
    pub custom: BTreeMap<String, String>,
}

/// Shared state of the target data path.
pub struct TargetInner {
    pub node_id: NodeId,
    pub store: Arc<dyn ObjectStore>,
    pub smap: Arc<SmapOwner>,
    pub bmd: Arc<BmdOwner>,
    pub cp: CpClient,
    pub cluster_features: u64,
    pub uploads: RwLock<HashMap<String, MultipartUpload>>,
    /// Redirected requests older than this are rejected.
    pub max_request_age: Duration,
}

#[derive(Clone)]
pub struct TargetState(pub Arc<TargetInner>);

impl std::ops::Deref for TargetState {
    type Target = TargetInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The target-side S3 data-path service.
pub struct TargetServer {
    router: Router,
}

impl TargetServer {
    pub fn new(state: TargetState) -> Self {
        let prefix = if state.cluster_features & atoll_types::features::S3_API_VIA_ROOT != 0 {
            ""
        } else {
            "/s3"
        };
        let router = Router::new()
            .route(&format!("{prefix}/{{bucket}}"), get(bucket_get))
            .route(
                &format!("{prefix}/{{bucket}}/{{*key}}"),
                get(object_get)
                    .put(object_put)
                    .delete(object_delete)
                    .head(object_head)
                    .post(object_post),
            )
            .with_state(state);
        Self { router }
    }

    pub fn into_router(self) -> Router {
        self.router
    }

    pub async fn serve(self, addr: &str) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "target data path listening");
        axum::serve(listener, self.router).await
    }
}

/// Reject redirected requests that are older than the acceptance window.
fn check_request_age(state: &TargetState, params: &Params) -> Result<(), S3Error> {
    if let Some(uts) = params.get(QPARAM_UTS).and_then(|v| v.parse::<u64>().ok()) {
        let age = wall_nanos().saturating_sub(uts);
        if age > state.max_request_age.as_nanos() as u64 {
            return Err(S3Error::StaleRequest { uts });
        }
    }
    Ok(())
}

fn resolve_bck(state: &TargetState, bucket: &str) -> Result<Bck, S3Error> {
    let bmd = state.bmd.get();
    bmd.init_by_name(bucket, None)
        .map(|e| e.bck.clone())
        .map_err(|_| S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        })
}

fn checksum_type(state: &TargetState, bck: &Bck) -> ChecksumType {
    state
        .bmd
        .get()
        .get(bck)
        .map(|e| e.props.checksum.ty)
        .unwrap_or_default()
}

// -----------------------------------------------------------------------
// GET /{bucket}?uploads — local multipart uploads
// -----------------------------------------------------------------------

async fn bucket_get(
    State(state): State<TargetState>,
    Path(bucket): Path<String>,
    Query(params): Query<Params>,
) -> S3Result {
    check_request_age(&state, &params)?;
    if !params.contains_key("uploads") {
        return Err(S3Error::invalid("targets only answer ?uploads on buckets"));
    }
    resolve_bck(&state, &bucket)?;

    let uploads = state.uploads.read().await;
    let entries: Vec<xml::UploadXml> = uploads
        .iter()
        .filter(|(_, u)| u.bucket == bucket)
        .map(|(id, u)| xml::UploadXml {
            key: u.key.clone(),
            upload_id: id.clone(),
        })
        .collect();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/xml")
        .header("server", SERVER_NAME)
        .body(Body::from(xml::list_multipart_uploads(&bucket, entries)))
        .expect("static response"))
}

// -----------------------------------------------------------------------
// GET /{bucket}/{*key} — GetObject (with Range)
// -----------------------------------------------------------------------

async fn object_get(
    State(state): State<TargetState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> S3Result {
    check_request_age(&state, &params)?;
    let bck = resolve_bck(&state, &bucket)?;
    validate_obj_name(&key)?;

    let obj = state
        .store
        .get(&bck, &key)
        .await?
        .ok_or_else(|| S3Error::NoSuchKey {
            bucket: bucket.clone(),
            key: key.clone(),
        })?;

    let total = obj.data.len() as u64;
    let range = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(|r| parse_range(r, total));

    let mut builder = Response::builder().header("server", SERVER_NAME);
    if let Some(cksum) = &obj.attrs.checksum {
        builder = builder.header("etag", format!("\"{}\"", cksum.value));
    }
    for (name, value) in &obj.attrs.custom {
        if PASSTHROUGH_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name.as_str(), value);
        } else {
            builder = builder.header(format!("x-amz-meta-{name}"), value);
        }
    }

    let body = match range {
        Some((start, end)) => {
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header("content-range", format!("bytes {start}-{end}/{total}"))
                .header("content-length", (end - start + 1).to_string());
            obj.data.slice(start as usize..=end as usize)
        }
        None => {
            builder = builder
                .status(StatusCode::OK)
                .header("content-length", total.to_string());
            obj.data
        }
    };
    Ok(builder.body(Body::from(body)).expect("static response"))
}

/// Parse `bytes=a-b`, `bytes=a-`, or `bytes=-suffix` against `total`.
/// Returns an inclusive `(start, end)` or `None` for unusable ranges.
fn parse_range(spec: &str, total: u64) -> Option<(u64, u64)> {
    let spec = spec.strip_prefix("bytes=")?;
    if total == 0 {
        return None;
    }
    let (lo, hi) = spec.split_once('-')?;
    match (lo.is_empty(), hi.is_empty()) {
        (false, false) => {
            let start: u64 = lo.parse().ok()?;
            let end: u64 = hi.parse().ok()?;
            (start <= end && start < total).then(|| (start, end.min(total - 1)))
        }
        (false, true) => {
            let start: u64 = lo.parse().ok()?;
            (start < total).then(|| (start, total - 1))
        }
        (true, false) => {
            let suffix: u64 = hi.parse().ok()?;
            let suffix = suffix.min(total);
            (suffix > 0).then(|| (total - suffix, total - 1))
        }
        (true, true) => None,
    }
}

// -----------------------------------------------------------------------
// PUT /{bucket}/{*key} — PutObject | UploadPart | local CopyObject
// -----------------------------------------------------------------------

async fn object_put(
    State(state): State<TargetState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> S3Result {
    check_request_age(&state, &params)?;
    let bck = resolve_bck(&state, &bucket)?;
    validate_obj_name(&key)?;

    if let (Some(upload_id), Some(part_number)) = (params.get("uploadId"), params.get("partNumber"))
    {
        return upload_part(&state, &bucket, &key, upload_id, part_number, body).await;
    }

    if let Some(src) = headers.get("x-amz-copy-source").and_then(|v| v.to_str().ok()) {
        return copy_from_local(&state, &bck, &key, src).await;
    }

    let mut custom = BTreeMap::new();
    for &header in PASSTHROUGH_HEADERS {
        if let Some(v) = headers.get(header).and_then(|v| v.to_str().ok()) {
            custom.insert(header.to_string(), v.to_string());
        }
    }
    for (name, value) in &headers {
        if let Some(meta_key) = name.as_str().strip_prefix("x-amz-meta-") {
            if let Ok(v) = value.to_str() {
                custom.insert(meta_key.to_string(), v.to_string());
            }
        }
    }

    let checksum = Cksum::compute(checksum_type(&state, &bck), &body);
    let attrs = ObjAttrs {
        size: body.len() as i64,
        atime_ns: wall_nanos() as i64,
        checksum: checksum.clone(),
        custom,
    };
    state.store.put(&bck, &key, body, attrs, Owt::Put).await?;
    info!(obj = %bck.cname(&key), "put object");

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("server", SERVER_NAME);
    if let Some(cksum) = checksum {
        builder = builder.header("etag", format!("\"{}\"", cksum.value));
    }
    Ok(builder.body(Body::empty()).expect("static response"))
}

/// Server-side copy. This target owns the source (the proxy routed by
/// it); the destination goes to wherever it hashes.
async fn copy_from_local(state: &TargetState, dst_bck: &Bck, dst_key: &str, src: &str) -> S3Result {
    let src = src.trim_matches('/');
    let (src_bucket, src_key) = src
        .split_once('/')
        .ok_or_else(|| S3Error::invalid(format!("invalid x-amz-copy-source: {src:?}")))?;
    let src_bck = resolve_bck(state, src_bucket)?;
    let src_key = src_key.trim_matches('/');

    let obj = state
        .store
        .get(&src_bck, src_key)
        .await?
        .ok_or_else(|| S3Error::NoSuchKey {
            bucket: src_bucket.to_string(),
            key: src_key.to_string(),
        })?;

    let smap = state.smap.get();
    let owner = hrw_target(&dst_bck.make_uname(dst_key), &smap)?;
    let etag = obj
        .attrs
        .checksum
        .as_ref()
        .map(|c| c.value.clone())
        .unwrap_or_default();

    if owner.id == state.node_id {
        let mut attrs = obj.attrs.clone();
        attrs.atime_ns = wall_nanos() as i64;
        state
            .store
            .put(dst_bck, dst_key, obj.data, attrs, Owt::Put)
            .await?;
    } else {
        // Push through the owner's public data path.
        let prefix = if state.cluster_features & atoll_types::features::S3_API_VIA_ROOT != 0 {
            ""
        } else {
            "/s3"
        };
        let url = format!(
            "{}{prefix}/{}/{dst_key}?{QPARAM_UTS}={}",
            owner.pub_url(),
            dst_bck.name,
            wall_nanos()
        );
        let resp = state.cp.put_raw(&url, obj.data).await?;
        if !resp.status().is_success() {
            return Err(S3Error::Internal {
                message: format!("copy relay answered {}", resp.status()),
            });
        }
    }

    debug!(src = %src_bck.cname(src_key), dst = %dst_bck.cname(dst_key), "copied object");
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/xml")
        .header("server", SERVER_NAME)
        .body(Body::from(xml::copy_object_result(&etag)))
        .expect("static response"))
}

// -----------------------------------------------------------------------
// HEAD /{bucket}/{*key}
// -----------------------------------------------------------------------

async fn object_head(
    State(state): State<TargetState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<Params>,
) -> S3Result {
    check_request_age(&state, &params)?;
    // Distinct codes: missing bucket vs missing object.
    let bck = resolve_bck(&state, &bucket)?;
    validate_obj_name(&key)?;

    let attrs = state
        .store
        .head(&bck, &key)
        .await?
        .ok_or_else(|| S3Error::NoSuchKey {
            bucket: bucket.clone(),
            key: key.clone(),
        })?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("server", SERVER_NAME)
        .header("x-amz-bucket-region", REGION)
        .header("content-length", attrs.size.max(0).to_string());
    if let Some(cksum) = &attrs.checksum {
        builder = builder.header("etag", format!("\"{}\"", cksum.value));
    }
    for (name, value) in &attrs.custom {
        if PASSTHROUGH_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name.as_str(), value);
        } else {
            builder = builder.header(format!("x-amz-meta-{name}"), value);
        }
    }
    Ok(builder.body(Body::empty()).expect("static response"))
}

// -----------------------------------------------------------------------
// DELETE /{bucket}/{*key} — DeleteObject | AbortMultipartUpload
// -----------------------------------------------------------------------

async fn object_delete(
    State(state): State<TargetState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<Params>,
) -> S3Result {
    check_request_age(&state, &params)?;
    let bck = resolve_bck(&state, &bucket)?;
    validate_obj_name(&key)?;

    if let Some(upload_id) = params.get("uploadId") {
        // Aborting a non-existent upload is 204, like deleting a
        // non-existent key.
        state.uploads.write().await.remove(upload_id);
        return Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("static response"));
    }

    let existed = state.store.delete(&bck, &key).await?;
    debug!(obj = %bck.cname(&key), existed, "delete object");
    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("server", SERVER_NAME)
        .body(Body::empty())
        .expect("static response"))
}

// -----------------------------------------------------------------------
// POST /{bucket}/{*key} — Initiate | CompleteMultipartUpload
// -----------------------------------------------------------------------

async fn object_post(
    State(state): State<TargetState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> S3Result {
    check_request_age(&state, &params)?;
    let bck = resolve_bck(&state, &bucket)?;
    validate_obj_name(&key)?;

    if params.contains_key("uploads") {
        return initiate_multipart(&state, &bucket, &key, &headers).await;
    }
    if let Some(upload_id) = params.get("uploadId") {
        return complete_multipart(&state, &bck, &key, upload_id, &body).await;
    }
    Err(S3Error::invalid("unsupported POST on object"))
}

async fn initiate_multipart(
    state: &TargetState,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> S3Result {
    let upload_id = Uuid::new_v4().simple().to_string();

    let mut custom = BTreeMap::new();
    for &header in PASSTHROUGH_HEADERS {
        if let Some(v) = headers.get(header).and_then(|v| v.to_str().ok()) {
            custom.insert(header.to_string(), v.to_string());
        }
    }

    state.uploads.write().await.insert(
        upload_id.clone(),
        MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            parts: BTreeMap::new(),
            custom,
        },
    );
    info!(bucket, key, %upload_id, "initiate multipart upload");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/xml")
        .header("server", SERVER_NAME)
        .body(Body::from(xml::initiate_multipart_upload(bucket, key, &upload_id)))
        .expect("static response"))
}

async fn upload_part(
    state: &TargetState,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: &str,
    body: Bytes,
) -> S3Result {
    let part_number: u16 = part_number
        .parse()
        .map_err(|_| S3Error::invalid(format!("invalid part number {part_number:?}")))?;

    let etag = blake3::hash(&body).to_hex().to_string();
    {
        let mut uploads = state.uploads.write().await;
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| S3Error::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;
        if upload.bucket != bucket || upload.key != key {
            return Err(S3Error::NoSuchUpload {
                upload_id: upload_id.to_string(),
            });
        }
        upload.parts.insert(part_number, body.to_vec());
    }

    debug!(upload_id, part_number, "upload part");
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("etag", format!("\"{etag}\""))
        .body(Body::empty())
        .expect("static response"))
}

async fn complete_multipart(
    state: &TargetState,
    bck: &Bck,
    key: &str,
    upload_id: &str,
    body: &Bytes,
) -> S3Result {
    let requested = xml::parse_complete_multipart(&String::from_utf8_lossy(body));

    let upload = {
        let mut uploads = state.uploads.write().await;
        uploads
            .remove(upload_id)
            .ok_or_else(|| S3Error::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?
    };
    if upload.bucket != bck.name || upload.key != key {
        return Err(S3Error::NoSuchUpload {
            upload_id: upload_id.to_string(),
        });
    }

    let part_numbers: Vec<u16> = if requested.is_empty() {
        upload.parts.keys().copied().collect()
    } else {
        requested
    };

    let mut assembled = Vec::new();
    for n in &part_numbers {
        let part = upload
            .parts
            .get(n)
            .ok_or_else(|| S3Error::invalid(format!("missing part {n}")))?;
        assembled.extend_from_slice(part);
    }

    let data = Bytes::from(assembled);
    let checksum = Cksum::compute(checksum_type(state, bck), &data);
    let etag = checksum.as_ref().map(|c| c.value.clone()).unwrap_or_default();
    let attrs = ObjAttrs {
        size: data.len() as i64,
        atime_ns: wall_nanos() as i64,
        checksum,
        custom: upload.custom,
    };
    state.store.put(bck, key, data, attrs, Owt::Put).await?;
    info!(bck = %bck, key, upload_id, parts = part_numbers.len(), "complete multipart upload");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/xml")
        .header("server", SERVER_NAME)
        .body(Body::from(xml::complete_multipart_upload(&bck.name, key, &etag)))
        .expect("static response"))
}

#[cfg(test)]
mod tests {
    use atoll_store::MemoryStore;
    use atoll_types::{BckProps, Bmd, Node, NodeRole, NodeState, Smap};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range("bytes=4-100", 10), Some((4, 9)));
        assert_eq!(parse_range("bytes=10-", 10), None);
        assert_eq!(parse_range("bytes=-0", 10), None);
        assert_eq!(parse_range("bytes=-", 10), None);
        assert_eq!(parse_range("elephants=0-4", 10), None);
        assert_eq!(parse_range("bytes=0-4", 0), None);
    }

    /// Single-target data path over an in-memory store.
    fn target_router(buckets: &[&str]) -> axum::Router {
        let node_id = NodeId::from("t-0");
        let mut smap = Smap::initial(Node {
            id: NodeId::from("p-0"),
            role: NodeRole::Proxy,
            pub_urls: vec!["http://p-0:8080".to_string()],
            intra_url: "http://p-0:9080".to_string(),
            mover_id: None,
            mover_addrs: vec![],
            state: NodeState::Active,
        });
        smap.tmap.insert(
            node_id.clone(),
            Node {
                id: node_id.clone(),
                role: NodeRole::Target,
                pub_urls: vec!["http://t-0:8080".to_string()],
                intra_url: "http://t-0:9080".to_string(),
                mover_id: None,
                mover_addrs: vec![],
                state: NodeState::Active,
            },
        );
        smap.version = 2;

        let bmd = BmdOwner::new(Bmd::default());
        for name in buckets {
            bmd.create_bucket(&Bck::native(*name), BckProps::default());
        }

        TargetServer::new(TargetState(Arc::new(TargetInner {
            node_id,
            store: Arc::new(MemoryStore::new(2, 1 << 24)),
            smap: Arc::new(SmapOwner::new(smap)),
            bmd: Arc::new(bmd),
            cp: CpClient::new(),
            cluster_features: 0,
            uploads: RwLock::new(HashMap::new()),
            max_request_age: Duration::from_secs(300),
        })))
        .into_router()
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn put(uri: &str, body: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    fn req(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrips_bytes() {
        let router = target_router(&["b1"]);
        let resp = router
            .clone()
            .oneshot(put("/s3/b1/k/obj", b"hello atoll"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let etag = resp.headers().get("etag").unwrap().clone();

        let resp = router.oneshot(req("GET", "/s3/b1/k/obj")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("etag").unwrap(), &etag);
        assert_eq!(body_text(resp).await, "hello atoll");
    }

    #[tokio::test]
    async fn test_head_missing_object_vs_missing_bucket() {
        let router = target_router(&["b1"]);
        // Missing object: 404 NoSuchKey.
        let resp = router.clone().oneshot(req("HEAD", "/s3/b1/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        // Missing bucket: 404 with the distinct bucket code (HEAD has no
        // body, so the code is only visible via the error path on GET).
        let resp = router
            .clone()
            .oneshot(req("GET", "/s3/nosuch/k"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_text(resp).await.contains("NoSuchBucket"));
    }

    #[tokio::test]
    async fn test_range_get() {
        let router = target_router(&["b1"]);
        router
            .clone()
            .oneshot(put("/s3/b1/r", b"0123456789"))
            .await
            .unwrap();

        let request = Request::builder()
            .method("GET")
            .uri("/s3/b1/r")
            .header("range", "bytes=2-5")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            resp.headers().get("content-range").unwrap(),
            "bytes 2-5/10"
        );
        assert_eq!(body_text(resp).await, "2345");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let router = target_router(&["b1"]);
        router.clone().oneshot(put("/s3/b1/d", b"x")).await.unwrap();
        for _ in 0..2 {
            let resp = router.clone().oneshot(req("DELETE", "/s3/b1/d")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
    }

    #[tokio::test]
    async fn test_multipart_flow() {
        let router = target_router(&["b1"]);

        let resp = router
            .clone()
            .oneshot(req("POST", "/s3/b1/big?uploads"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        let upload_id = text
            .split("<UploadId>")
            .nth(1)
            .and_then(|s| s.split("</UploadId>").next())
            .unwrap()
            .to_string();

        for (n, part) in [(1, "aaa"), (2, "bbb")] {
            let uri = format!("/s3/b1/big?uploadId={upload_id}&partNumber={n}");
            let request = Request::builder()
                .method("PUT")
                .uri(uri)
                .body(Body::from(part))
                .unwrap();
            let resp = router.clone().oneshot(request).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        // The upload is listed until completed.
        let resp = router
            .clone()
            .oneshot(req("GET", "/s3/b1?uploads"))
            .await
            .unwrap();
        assert!(body_text(resp).await.contains(&upload_id));

        let resp = router
            .clone()
            .oneshot(req("POST", &format!("/s3/b1/big?uploadId={upload_id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router.clone().oneshot(req("GET", "/s3/b1/big")).await.unwrap();
        assert_eq!(body_text(resp).await, "aaabbb");

        // Gone from the listing once assembled.
        let resp = router.oneshot(req("GET", "/s3/b1?uploads")).await.unwrap();
        assert!(!body_text(resp).await.contains(&upload_id));
    }

    #[tokio::test]
    async fn test_stale_redirect_rejected() {
        let router = target_router(&["b1"]);
        // A redirect stamped an hour ago is outside the window.
        let resp = router
            .oneshot(req("GET", "/s3/b1/k?uts=1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("RequestTimeTooSkewed"));
    }
}
