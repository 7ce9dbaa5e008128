//! Proxy-side S3 request handlers.
//!
//! The dispatch mirrors the S3 verb table: method × path arity × query
//! parameters select the action. Object-scope requests resolve the
//! owning target through the rendezvous router and redirect; bucket
//! mutations ride the forward-CP contract to the primary; multi-object
//! requests fan out to the target fleet.

use std::collections::BTreeMap;

use atoll_placement::{hrw_multihome, hrw_target};
use atoll_types::msg::{ActMsg, LsoEntry, LsoMsg, ACT_CREATE_BCK, ACT_DESTROY_BCK, ACT_SET_BPROPS};
use atoll_types::{validate_obj_name, Bck, BckEntry, BmdLookupErr};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Response, StatusCode, Uri};
use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::S3Error;
use crate::redirect::{s3_redirect, NET_CONTROL, NET_DATA};
use crate::{xml, GatewayState, REGION, SERVER_NAME};

type Params = BTreeMap<String, String>;
type S3Result = Result<Response<Body>, S3Error>;

/// Bucket subresources the gateway deliberately does not implement.
const UNSUPPORTED_SUBRESOURCES: &[&str] = &["lifecycle", "policy", "cors", "acl"];

fn xml_response(body: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/xml")
        .header("server", SERVER_NAME)
        .body(Body::from(body))
        .expect("static response")
}

/// Relay a forwarded response from the primary as-is.
fn relay(status: u16, body: String) -> S3Result {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status).header("server", SERVER_NAME);
    if !body.is_empty() {
        builder = builder.header("content-type", "application/xml");
    }
    Ok(builder.body(Body::from(body)).expect("static response"))
}

/// Resolve a bucket by name against the current metadata snapshot.
fn init_bck(state: &GatewayState, bucket: &str) -> Result<BckEntry, S3Error> {
    let bmd = state.bmd.get();
    match bmd.init_by_name(bucket, None) {
        Ok(entry) => Ok(entry.clone()),
        Err(BmdLookupErr::NotFound(_)) => Err(S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        }),
        Err(BmdLookupErr::AmbiguousProvider(_, _)) => Err(S3Error::AmbiguousBucket {
            bucket: bucket.to_string(),
        }),
    }
}

fn primary_intra(state: &GatewayState) -> Result<String, S3Error> {
    let smap = state.smap.get();
    smap.primary_node()
        .map(|n| n.intra_url.clone())
        .ok_or(S3Error::Cluster(atoll_cluster::ClusterError::NoPrimary))
}

// -----------------------------------------------------------------------
// GET /  — ListBuckets
// -----------------------------------------------------------------------

/// List all buckets currently present in the BMD.
pub(crate) async fn list_buckets(State(state): State<GatewayState>) -> S3Result {
    let bmd = state.bmd.get();
    let buckets: Vec<(String, u64)> = bmd
        .buckets
        .values()
        .map(|e| (e.bck.name.clone(), e.props.created_ns))
        .collect();
    Ok(xml_response(xml::list_all_my_buckets("atoll", &buckets)))
}

// -----------------------------------------------------------------------
// GET /{bucket} — versioning | unsupported | uploads | ListObjectsV2
// -----------------------------------------------------------------------

pub(crate) async fn bucket_get(
    State(state): State<GatewayState>,
    Path(bucket): Path<String>,
    Query(params): Query<Params>,
    uri: Uri,
) -> S3Result {
    // Bucket existence is validated before anything else: an unknown
    // bucket is 404 even for subresources we answer 501 to.
    let entry = init_bck(&state, &bucket)?;

    if UNSUPPORTED_SUBRESOURCES
        .iter()
        .any(|s| params.contains_key(*s))
    {
        let what = UNSUPPORTED_SUBRESOURCES
            .iter()
            .find(|s| params.contains_key(**s))
            .expect("checked above");
        return Err(S3Error::NotImplemented {
            what: (*what).to_string(),
        });
    }

    if params.contains_key("uploads") {
        return list_multipart_uploads(&state, &entry.bck, &uri).await;
    }

    if params.contains_key("versioning") {
        return Ok(xml_response(xml::versioning_configuration(
            entry.props.versioning.enabled,
        )));
    }

    list_objects(&state, &entry.bck, &params).await
}

/// The gateway is the page aggregator: it issues paged list requests
/// against the target fleet, accumulating entries. The first page
/// establishes a listing job UUID that subsequent pages must echo.
async fn list_objects(state: &GatewayState, bck: &Bck, params: &Params) -> S3Result {
    let prefix = params.get("prefix").map(String::as_str).unwrap_or("");
    let max_keys: usize = params
        .get("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let client_token = params
        .get("continuation-token")
        .cloned()
        .unwrap_or_default();

    if max_keys == 0 {
        return Ok(xml_response(xml::list_objects_v2(
            &bck.name,
            prefix,
            &[],
            0,
            None,
            None,
        )));
    }

    let smap = state.smap.get();
    let mut msg = LsoMsg {
        prefix: prefix.to_string(),
        page_size: max_keys,
        continuation_token: client_token.clone(),
        uuid: Uuid::new_v4().simple().to_string(),
    };

    let mut entries: Vec<LsoEntry> = Vec::new();
    let mut fleet_token = String::new();
    loop {
        let page = state.cp.list_page(&smap, bck, &msg).await?;
        entries.extend(page.entries);
        fleet_token = page.continuation_token;
        if fleet_token.is_empty() || entries.len() >= max_keys {
            break;
        }
        msg.continuation_token = fleet_token.clone();
    }

    let truncated = entries.len() > max_keys || !fleet_token.is_empty();
    entries.truncate(max_keys);
    let next_token = if truncated {
        entries.last().map(|e| e.name.clone())
    } else {
        None
    };

    debug!(bck = %bck, listed = entries.len(), truncated, "list_objects");
    Ok(xml_response(xml::list_objects_v2(
        &bck.name,
        prefix,
        &entries,
        max_keys,
        (!client_token.is_empty()).then_some(client_token),
        next_token,
    )))
}

/// GET /{bucket}?uploads — single target redirects, fleets aggregate.
async fn list_multipart_uploads(state: &GatewayState, bck: &Bck, uri: &Uri) -> S3Result {
    let smap = state.smap.get();
    if smap.count_active_targets() == 1 {
        let target = hrw_target(&bck.make_uname(""), &smap)?;
        return Ok(s3_redirect(state, target.pub_url(), uri, NET_CONTROL));
    }

    // Broadcast to every target's public endpoint and merge the answers.
    let mut all: Vec<xml::UploadXml> = Vec::new();
    for node in smap.active_targets() {
        let url = format!(
            "{}{}{}",
            node.pub_url(),
            uri.path(),
            uri.query().map(|q| format!("?{q}")).unwrap_or_default()
        );
        let resp = state.cp.get_raw(&url).await?;
        if !resp.status().is_success() {
            continue;
        }
        let body = resp.text().await.map_err(atoll_cluster::ClusterError::Http)?;
        match xml::parse_multipart_uploads(&body) {
            Ok(parsed) => all.extend(parsed.uploads),
            Err(e) => debug!(node = %node.id, %e, "skipping unparsable uploads answer"),
        }
    }
    Ok(xml_response(xml::list_multipart_uploads(&bck.name, all)))
}

// -----------------------------------------------------------------------
// PUT /{bucket} — CreateBucket | versioning update (forward-CP)
// -----------------------------------------------------------------------

pub(crate) async fn bucket_put(
    State(state): State<GatewayState>,
    Path(bucket): Path<String>,
    Query(params): Query<Params>,
    body: Bytes,
) -> S3Result {
    let primary = primary_intra(&state)?;

    if params.contains_key("versioning") {
        // Bucket must exist before its properties can change.
        init_bck(&state, &bucket)?;
        let enabled = xml::parse_versioning_request(&String::from_utf8_lossy(&body))
            .map_err(S3Error::invalid)?;
        let act = ActMsg::new(ACT_SET_BPROPS, &bucket)
            .with_value(&serde_json::json!({ "versioning": enabled }))
            .map_err(atoll_cluster::ClusterError::Encode)?;
        let (status, body) = state.cp.bucket_act(&primary, &bucket, &act).await?;
        return relay(status, body);
    }

    let bck = Bck::native(&bucket);
    bck.validate()?;
    let act = ActMsg::new(ACT_CREATE_BCK, &bucket);
    let (status, body) = state.cp.bucket_act(&primary, &bucket, &act).await?;
    info!(%bucket, status, "create bucket");
    relay(status, body)
}

// -----------------------------------------------------------------------
// DELETE /{bucket} — multi-delete | DeleteBucket (forward-CP)
// -----------------------------------------------------------------------

pub(crate) async fn bucket_delete(
    State(state): State<GatewayState>,
    Path(bucket): Path<String>,
    Query(params): Query<Params>,
    body: Bytes,
) -> S3Result {
    if params.contains_key("delete") {
        return multi_delete(&state, &bucket, &body).await;
    }

    init_bck(&state, &bucket)?;
    let primary = primary_intra(&state)?;
    let act = ActMsg::new(ACT_DESTROY_BCK, &bucket);
    let (status, body) = state.cp.bucket_act(&primary, &bucket, &act).await?;
    info!(%bucket, status, "destroy bucket");
    relay(status, body)
}

// -----------------------------------------------------------------------
// POST /{bucket} — multi-delete only
// -----------------------------------------------------------------------

pub(crate) async fn bucket_post(
    State(state): State<GatewayState>,
    Path(bucket): Path<String>,
    Query(params): Query<Params>,
    body: Bytes,
) -> S3Result {
    if !params.contains_key("delete") {
        return Err(S3Error::invalid("unsupported POST on bucket"));
    }
    multi_delete(&state, &bucket, &body).await
}

/// Parse the XML key list and invoke the cluster-wide list-range delete.
///
/// Targets report a single aggregate result, so per-key failures are not
/// available; the response lists every requested key under `Deleted`.
async fn multi_delete(state: &GatewayState, bucket: &str, body: &Bytes) -> S3Result {
    let entry = init_bck(state, bucket)?;
    let keys = xml::parse_multi_delete(&String::from_utf8_lossy(body)).map_err(S3Error::invalid)?;
    if keys.is_empty() {
        return Ok(xml_response(xml::delete_result(&[])));
    }

    let smap = state.smap.get();
    state.cp.delete_objects(&smap, &entry.bck, &keys).await?;
    info!(%bucket, n = keys.len(), "multi-delete");
    Ok(xml_response(xml::delete_result(&keys)))
}

// -----------------------------------------------------------------------
// HEAD /{bucket}
// -----------------------------------------------------------------------

/// Existence check; AWS clients also expect the region header.
pub(crate) async fn bucket_head(
    State(state): State<GatewayState>,
    Path(bucket): Path<String>,
) -> S3Result {
    init_bck(&state, &bucket)?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("server", SERVER_NAME)
        .header("x-amz-bucket-region", REGION)
        .body(Body::empty())
        .expect("static response"))
}

// -----------------------------------------------------------------------
// Object-scope handlers: resolve owner, redirect (or reverse-proxy)
// -----------------------------------------------------------------------

pub(crate) async fn object_get(
    State(state): State<GatewayState>,
    Path((bucket, key)): Path<(String, String)>,
    uri: Uri,
) -> S3Result {
    let entry = init_bck(&state, &bucket)?;
    validate_obj_name(&key)?;
    let smap = state.smap.get();
    let (_, pub_url) = hrw_multihome(&entry.bck.make_uname(&key), &smap)?;
    Ok(s3_redirect(&state, pub_url, &uri, NET_DATA))
}

pub(crate) async fn object_put(
    State(state): State<GatewayState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> S3Result {
    // Server-side copy: route by the SOURCE object so the target that
    // owns the source performs the copy.
    if let Some(src) = headers.get("x-amz-copy-source").and_then(|v| v.to_str().ok()) {
        return copy_object(&state, &bucket, src, &uri).await;
    }

    let entry = init_bck(&state, &bucket)?;
    validate_obj_name(&key)?;
    let smap = state.smap.get();
    let (target, pub_url) = hrw_multihome(&entry.bck.make_uname(&key), &smap)?;
    debug!(obj = %entry.bck.cname(&key), target = %target.id, "put redirect");
    Ok(s3_redirect(&state, pub_url, &uri, NET_DATA))
}

async fn copy_object(state: &GatewayState, dst_bucket: &str, src: &str, uri: &Uri) -> S3Result {
    let src = src.trim_matches('/');
    let (src_bucket, src_key) = src
        .split_once('/')
        .ok_or_else(|| S3Error::invalid(format!("invalid x-amz-copy-source: {src:?}")))?;
    let src_entry = init_bck(state, src_bucket)?;
    init_bck(state, dst_bucket)?;
    let src_key = src_key.trim_matches('/');
    validate_obj_name(src_key)?;

    let smap = state.smap.get();
    let target = hrw_target(&src_entry.bck.make_uname(src_key), &smap)?;
    debug!(src = %src_entry.bck.cname(src_key), target = %target.id, "copy redirect");
    Ok(s3_redirect(state, target.pub_url(), uri, NET_CONTROL))
}

/// HEAD on objects reverse-proxies by default: S3 clients do not follow
/// redirects on HEAD. The knob in the gateway state flips this to 307.
pub(crate) async fn object_head(
    State(state): State<GatewayState>,
    Path((bucket, key)): Path<(String, String)>,
    uri: Uri,
) -> S3Result {
    let entry = init_bck(&state, &bucket)?;
    validate_obj_name(&key)?;
    let smap = state.smap.get();
    let target = hrw_target(&entry.bck.make_uname(&key), &smap)?;

    if state.head_via_redirect {
        return Ok(s3_redirect(&state, target.pub_url(), &uri, NET_CONTROL));
    }

    let url = crate::redirect::redirect_url(&state, target.pub_url(), &uri, NET_CONTROL);
    let upstream = state.cp.head_raw(&url).await?;
    let mut builder = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    Ok(builder.body(Body::empty()).expect("relayed response"))
}

pub(crate) async fn object_delete(
    State(state): State<GatewayState>,
    Path((bucket, key)): Path<(String, String)>,
    uri: Uri,
) -> S3Result {
    let entry = init_bck(&state, &bucket)?;
    validate_obj_name(&key)?;
    let smap = state.smap.get();
    let target = hrw_target(&entry.bck.make_uname(&key), &smap)?;
    Ok(s3_redirect(&state, target.pub_url(), &uri, NET_CONTROL))
}

/// Multipart operations route by hash; the target owns the upload state.
pub(crate) async fn object_post(
    State(state): State<GatewayState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<Params>,
    uri: Uri,
) -> S3Result {
    if !params.contains_key("uploads") && !params.contains_key("uploadId") {
        return Err(S3Error::invalid("unsupported POST on object"));
    }
    let entry = init_bck(&state, &bucket)?;
    validate_obj_name(&key)?;
    let smap = state.smap.get();
    let (_, pub_url) = hrw_multihome(&entry.bck.make_uname(&key), &smap)?;
    Ok(s3_redirect(&state, pub_url, &uri, NET_DATA))
}
