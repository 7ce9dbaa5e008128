//! Control-plane HTTP routes.
//!
//! The private JSON RPC between nodes: snapshot fetch/install, cluster
//! join (primary only), bucket actions (primary applies, non-primaries
//! forward), transform-copy dispatch and status (targets), and the
//! per-target listing and list-range-delete pages.

use std::sync::Arc;

use atoll_cluster::{
    paths, BmdOwner, CpClient, DeleteObjsReq, JoinReply, ListPageReq, SmapOwner,
};
use atoll_meta::MetaCache;
use atoll_net::AddressBook;
use atoll_placement::hrw_target;
use atoll_store::ObjectStore;
use atoll_types::msg::{
    ActMsg, ListRange, LsoPage, NameXform, Selection, TcoMsg, ACT_COPY_OBJECTS, ACT_CREATE_BCK,
    ACT_DELETE_OBJECTS, ACT_DESTROY_BCK, ACT_ETL_OBJECTS, ACT_SET_BPROPS,
};
use atoll_types::{Bck, BckProps, Bmd, Node, NodeId, NodeRole, Smap};
use atoll_xcopy::XcopyEngine;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Shared state of the control-plane routes.
pub struct CtlInner {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub smap: Arc<SmapOwner>,
    pub bmd: Arc<BmdOwner>,
    pub cp: CpClient,
    pub meta: Arc<MetaCache>,
    /// Data-mover address book, refreshed on map installs (targets).
    pub address_book: Option<AddressBook>,
    pub engine: Option<Arc<XcopyEngine>>,
    pub store: Option<Arc<dyn ObjectStore>>,
}

#[derive(Clone)]
pub struct CtlState(pub Arc<CtlInner>);

impl std::ops::Deref for CtlState {
    type Target = CtlInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Control-plane error: status + JSON message.
pub struct CtlError {
    status: StatusCode,
    message: String,
}

impl CtlError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for CtlError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<atoll_cluster::ClusterError> for CtlError {
    fn from(e: atoll_cluster::ClusterError) -> Self {
        match &e {
            atoll_cluster::ClusterError::VersionRegression { .. } => Self::conflict(e.to_string()),
            atoll_cluster::ClusterError::BucketNotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                message: e.to_string(),
            },
            atoll_cluster::ClusterError::Template(_) => Self::bad_request(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<atoll_xcopy::XcopyError> for CtlError {
    fn from(e: atoll_xcopy::XcopyError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<atoll_store::StoreError> for CtlError {
    fn from(e: atoll_store::StoreError) -> Self {
        Self::internal(e.to_string())
    }
}

type CtlResult<T> = Result<T, CtlError>;

// -----------------------------------------------------------------------
// Routers
// -----------------------------------------------------------------------

fn common_routes() -> Router<CtlState> {
    Router::new()
        .route(paths::SMAP, get(get_smap).put(install_smap))
        .route(paths::BMD, get(get_bmd).put(install_bmd))
}

/// Control routes served by proxies.
pub fn proxy_router(state: CtlState) -> Router {
    common_routes()
        .route(paths::JOIN, post(join))
        .route(&format!("{}/{{name}}", paths::BUCKETS), post(proxy_bucket_act))
        .with_state(state)
}

/// Control routes served by targets.
pub fn target_router(state: CtlState) -> Router {
    common_routes()
        .route(&format!("{}/{{name}}", paths::BUCKETS), post(target_bucket_act))
        .route(paths::XCOPY, post(xcopy_begin))
        .route(&format!("{}/{{uuid}}", paths::XCOPY), get(xcopy_status))
        .route(
            &format!("{}/{{uuid}}/commit", paths::XCOPY),
            post(xcopy_commit),
        )
        .route(
            &format!("{}/{{uuid}}/abort", paths::XCOPY),
            post(xcopy_abort),
        )
        .route(paths::OBJECTS_LIST, post(objects_list))
        .route(paths::OBJECTS_DELETE, post(objects_delete))
        .with_state(state)
}

// -----------------------------------------------------------------------
// Snapshots
// -----------------------------------------------------------------------

async fn get_smap(State(state): State<CtlState>) -> Json<Smap> {
    Json(Smap::clone(&state.smap.get()))
}

async fn get_bmd(State(state): State<CtlState>) -> Json<Bmd> {
    Json(Bmd::clone(&state.bmd.get()))
}

async fn install_smap(
    State(state): State<CtlState>,
    Json(offered): Json<Smap>,
) -> CtlResult<StatusCode> {
    state.smap.install(offered)?;
    let installed = state.smap.get();
    if let Some(book) = &state.address_book {
        refresh_address_book(book, &installed).await;
    }
    if let Err(e) = state.meta.put_smap(&installed) {
        warn!(%e, "smap cache write failed");
    }
    Ok(StatusCode::OK)
}

async fn install_bmd(
    State(state): State<CtlState>,
    Json(offered): Json<Bmd>,
) -> CtlResult<StatusCode> {
    state.bmd.install(offered)?;
    if let Err(e) = state.meta.put_bmd(&state.bmd.get()) {
        warn!(%e, "bmd cache write failed");
    }
    Ok(StatusCode::OK)
}

/// Rebuild the data-mover address book from an installed map.
pub async fn refresh_address_book(book: &AddressBook, smap: &Smap) {
    let mut entries = Vec::new();
    for node in smap.tmap.values() {
        let Some(mover_id) = &node.mover_id else {
            continue;
        };
        let Some(bytes) = decode_hex32(mover_id) else {
            warn!(node = %node.id, "bad mover id in cluster map");
            continue;
        };
        let Ok(eid) = iroh::NodeId::from_bytes(&bytes) else {
            warn!(node = %node.id, "mover id is not a valid endpoint key");
            continue;
        };
        let addr = iroh::NodeAddr::new(eid).with_direct_addresses(node.mover_addrs.iter().copied());
        entries.push((node.id.clone(), addr));
    }
    let mut book = book.write().await;
    book.clear();
    book.extend(entries);
}

fn decode_hex32(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

// -----------------------------------------------------------------------
// Join (primary)
// -----------------------------------------------------------------------

async fn join(State(state): State<CtlState>, Json(node): Json<Node>) -> CtlResult<Json<JoinReply>> {
    let smap = state.smap.get();
    if !smap.is_primary(&state.node_id) {
        // The joiner asked a non-primary; point it at the real one.
        return Err(CtlError {
            status: StatusCode::MISDIRECTED_REQUEST,
            message: format!("primary is {}", smap.primary),
        });
    }

    let next = state.smap.add_node(node);
    if let Err(e) = state.meta.put_smap(&next) {
        warn!(%e, "smap cache write failed");
    }

    // Everybody learns about the newcomer.
    let cp = state.cp.clone();
    let bcast = Smap::clone(&next);
    let skip = state.node_id.clone();
    tokio::spawn(async move {
        cp.broadcast_smap(&bcast, &skip).await;
    });

    Ok(Json(JoinReply {
        smap: Smap::clone(&next),
        bmd: Bmd::clone(&state.bmd.get()),
    }))
}

// -----------------------------------------------------------------------
// Bucket actions (proxy)
// -----------------------------------------------------------------------

/// Parameters of a transform-copy origination, carried in the ActMsg
/// value of `copy-objects` / `etl-objects`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcoRequest {
    pub bck_to: Bck,
    pub selection: Selection,
    #[serde(default)]
    pub xform: NameXform,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub etl: Option<String>,
}

/// Reply to a job origination: the ID to poll.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobReply {
    pub job_id: String,
}

async fn proxy_bucket_act(
    State(state): State<CtlState>,
    Path(name): Path<String>,
    Json(act): Json<ActMsg>,
) -> CtlResult<axum::response::Response> {
    let smap = state.smap.get();
    let is_primary = smap.is_primary(&state.node_id);

    match act.action.as_str() {
        // Metadata mutations: the primary is the single serialization
        // point; everyone else forwards and relays.
        ACT_CREATE_BCK | ACT_DESTROY_BCK | ACT_SET_BPROPS if !is_primary => {
            let primary = smap
                .primary_node()
                .ok_or_else(|| CtlError::internal("cluster map has no primary"))?;
            let (status, body) = state.cp.bucket_act(&primary.intra_url, &name, &act).await?;
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Ok((status, body).into_response())
        }

        ACT_CREATE_BCK => {
            let bck = Bck::native(&name);
            bck.validate()
                .map_err(|e| CtlError::bad_request(e.to_string()))?;
            // Creating an existing bucket is a no-op success.
            let (_, bmd) = state.bmd.create_bucket(&bck, BckProps::default());
            persist_and_broadcast_bmd(&state, &bmd).await;
            Ok(StatusCode::OK.into_response())
        }

        ACT_DESTROY_BCK => {
            let bck = Bck::native(&name);
            let (existed, bmd) = state.bmd.destroy_bucket(&bck);
            if existed {
                persist_and_broadcast_bmd(&state, &bmd).await;
                // Targets drop their local data for the bucket.
                let act = ActMsg::new(ACT_DESTROY_BCK, &name);
                if let Err(e) = state
                    .cp
                    .broadcast_act(&smap, &format!("{}/{name}", paths::BUCKETS), &act)
                    .await
                {
                    warn!(%e, bucket = %name, "bucket eviction broadcast failed");
                }
            } else {
                info!(bucket = %name, "bucket already destroyed, nothing to do");
            }
            Ok(StatusCode::OK.into_response())
        }

        ACT_SET_BPROPS => {
            let bck = Bck::native(&name);
            let value: serde_json::Value = act.value;
            let versioning = value.get("versioning").and_then(|v| v.as_bool());
            let bmd = state.bmd.set_bprops(&bck, |props| {
                if let Some(enabled) = versioning {
                    props.versioning.enabled = enabled;
                }
            })?;
            persist_and_broadcast_bmd(&state, &bmd).await;
            Ok(StatusCode::OK.into_response())
        }

        ACT_COPY_OBJECTS | ACT_ETL_OBJECTS => {
            let req: TcoRequest = serde_json::from_value(act.value)
                .map_err(|e| CtlError::bad_request(format!("bad job message: {e}")))?;
            let reply = originate_xcopy(&state, &name, req).await?;
            Ok(Json(reply).into_response())
        }

        ACT_DELETE_OBJECTS => {
            let lr: ListRange = serde_json::from_value(act.value)
                .map_err(|e| CtlError::bad_request(format!("bad list-range: {e}")))?;
            let bck = resolve_bucket(&state, &name)?;
            state.cp.delete_objects(&smap, &bck, &lr.obj_names).await?;
            Ok(StatusCode::OK.into_response())
        }

        other => Err(CtlError::bad_request(format!("unknown action {other:?}"))),
    }
}

fn resolve_bucket(state: &CtlState, name: &str) -> CtlResult<Bck> {
    state
        .bmd
        .get()
        .init_by_name(name, None)
        .map(|e| e.bck.clone())
        .map_err(|e| CtlError {
            status: StatusCode::NOT_FOUND,
            message: e.to_string(),
        })
}

async fn persist_and_broadcast_bmd(state: &CtlState, bmd: &Bmd) {
    if let Err(e) = state.meta.put_bmd(bmd) {
        warn!(%e, "bmd cache write failed");
    }
    let cp = state.cp.clone();
    let smap = Smap::clone(&state.smap.get());
    let bmd = bmd.clone();
    let skip = state.node_id.clone();
    tokio::spawn(async move {
        cp.broadcast_bmd(&smap, &bmd, &skip).await;
    });
}

/// Originate a transform-copy job: validate the selection on this node,
/// make sure the destination bucket exists (recording whether this job
/// created it), and broadcast the job message to all targets.
async fn originate_xcopy(
    state: &CtlState,
    src_name: &str,
    req: TcoRequest,
) -> CtlResult<JobReply> {
    let bck_from = resolve_bucket(state, src_name)?;
    req.selection
        .parse_template()
        .map_err(|e| CtlError::bad_request(e.to_string()))?;

    let smap = state.smap.get();
    let mut dst_was_created = false;
    if state.bmd.get().get(&req.bck_to).is_none() {
        let primary = smap
            .primary_node()
            .ok_or_else(|| CtlError::internal("cluster map has no primary"))?;
        let act = ActMsg::new(ACT_CREATE_BCK, &req.bck_to.name);
        let (status, body) = state
            .cp
            .bucket_act(&primary.intra_url, &req.bck_to.name, &act)
            .await?;
        if !(200..300).contains(&status) {
            return Err(CtlError::internal(format!(
                "destination bucket create failed ({status}): {body}"
            )));
        }
        dst_was_created = true;
    }

    let msg = TcoMsg {
        txn_uuid: CpClient::new_tco_id(),
        bck_from,
        bck_to: req.bck_to,
        selection: req.selection,
        xform: req.xform,
        dry_run: req.dry_run,
        continue_on_error: req.continue_on_error,
        etl: req.etl,
        dst_was_created,
    };
    let job_id = state.cp.start_xcopy(&smap, &msg).await?;
    Ok(JobReply { job_id })
}

// -----------------------------------------------------------------------
// Bucket actions (target): local data cleanup only
// -----------------------------------------------------------------------

async fn target_bucket_act(
    State(state): State<CtlState>,
    Path(name): Path<String>,
    Json(act): Json<ActMsg>,
) -> CtlResult<StatusCode> {
    match act.action.as_str() {
        ACT_DESTROY_BCK => {
            let store = state
                .store
                .as_ref()
                .ok_or_else(|| CtlError::internal("no store configured"))?;
            let removed = store.evict_bucket(&Bck::native(&name)).await?;
            info!(bucket = %name, removed, "evicted destroyed bucket");
            Ok(StatusCode::OK)
        }
        // Metadata-only actions arrive via the BMD broadcast.
        ACT_CREATE_BCK | ACT_SET_BPROPS => Ok(StatusCode::OK),
        other => Err(CtlError::bad_request(format!("unknown action {other:?}"))),
    }
}

// -----------------------------------------------------------------------
// Transform-copy (target)
// -----------------------------------------------------------------------

async fn xcopy_begin(
    State(state): State<CtlState>,
    Json(msg): Json<TcoMsg>,
) -> CtlResult<StatusCode> {
    let engine = state
        .engine
        .as_ref()
        .ok_or_else(|| CtlError::internal("no engine configured"))?;
    engine.begin(msg).await?;
    Ok(StatusCode::OK)
}

async fn xcopy_commit(
    State(state): State<CtlState>,
    Path(uuid): Path<String>,
) -> CtlResult<StatusCode> {
    let engine = state
        .engine
        .as_ref()
        .ok_or_else(|| CtlError::internal("no engine configured"))?;
    engine.commit(&uuid).await?;
    Ok(StatusCode::OK)
}

async fn xcopy_abort(
    State(state): State<CtlState>,
    Path(uuid): Path<String>,
) -> CtlResult<StatusCode> {
    let engine = state
        .engine
        .as_ref()
        .ok_or_else(|| CtlError::internal("no engine configured"))?;
    engine.abort(&uuid, "abort requested").await?;
    Ok(StatusCode::OK)
}

async fn xcopy_status(
    State(state): State<CtlState>,
    Path(uuid): Path<String>,
) -> CtlResult<Json<atoll_xcopy::JobSnap>> {
    let engine = state
        .engine
        .as_ref()
        .ok_or_else(|| CtlError::internal("no engine configured"))?;
    engine
        .status(&uuid)
        .map(Json)
        .ok_or_else(|| CtlError {
            status: StatusCode::NOT_FOUND,
            message: format!("unknown job {uuid}"),
        })
}

// -----------------------------------------------------------------------
// Object pages (target)
// -----------------------------------------------------------------------

async fn objects_list(
    State(state): State<CtlState>,
    Json(req): Json<ListPageReq>,
) -> CtlResult<Json<LsoPage>> {
    let store = state
        .store
        .as_ref()
        .ok_or_else(|| CtlError::internal("no store configured"))?;
    let (entries, truncated) = store
        .list_page(
            &req.bck,
            &req.msg.prefix,
            &req.msg.continuation_token,
            req.msg.page_size.max(1),
        )
        .await?;
    let continuation_token = if truncated {
        entries.last().map(|e| e.name.clone()).unwrap_or_default()
    } else {
        String::new()
    };
    Ok(Json(LsoPage {
        // The listing job UUID is echoed back verbatim; the aggregator
        // checks it on every page.
        uuid: req.msg.uuid,
        entries,
        continuation_token,
    }))
}

async fn objects_delete(
    State(state): State<CtlState>,
    Json(req): Json<DeleteObjsReq>,
) -> CtlResult<StatusCode> {
    let store = state
        .store
        .as_ref()
        .ok_or_else(|| CtlError::internal("no store configured"))?;
    let smap = state.smap.get();

    let mut deleted = 0usize;
    for name in &req.names {
        // Each target deletes only the keys it owns; deleting an absent
        // key is a no-op.
        let owner = hrw_target(&req.bck.make_uname(name), &smap)
            .map_err(|e| CtlError::internal(e.to_string()))?;
        if owner.id != state.node_id {
            continue;
        }
        if store.delete(&req.bck, name).await? {
            deleted += 1;
        }
    }
    info!(bck = %req.bck, requested = req.names.len(), deleted, "list-range delete");
    Ok(StatusCode::OK)
}
