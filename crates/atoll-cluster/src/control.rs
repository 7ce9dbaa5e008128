//! Control-plane HTTP client.
//!
//! Private JSON RPC between proxies and targets: cluster join and
//! snapshot broadcast, the forward-CP contract (mutating bucket ops go
//! to the primary, the response is relayed verbatim), ActMsg fan-out to
//! targets, the distributed-listing page primitive, and transform-copy
//! job dispatch.

use std::sync::Arc;

use atoll_types::msg::{ActMsg, LsoEntry, LsoMsg, LsoPage, TcoMsg};
use atoll_types::{Bck, Bmd, Node, NodeId, Smap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ClusterError;

/// Control-plane URL paths, shared by client and server.
pub mod paths {
    pub const SMAP: &str = "/v1/cluster/smap";
    pub const BMD: &str = "/v1/cluster/bmd";
    pub const JOIN: &str = "/v1/cluster/join";
    pub const BUCKETS: &str = "/v1/buckets";
    pub const XCOPY: &str = "/v1/xcopy";
    pub const OBJECTS_LIST: &str = "/v1/objects/list";
    pub const OBJECTS_DELETE: &str = "/v1/objects/delete";
}

/// Primary's answer to a join request: the snapshots the node installs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReply {
    pub smap: Smap,
    pub bmd: Bmd,
}

/// Body of the target-side listing page RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPageReq {
    pub bck: Bck,
    pub msg: LsoMsg,
}

/// Body of the target-side list-range delete RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteObjsReq {
    pub bck: Bck,
    pub names: Vec<String>,
}

/// Result type shortened for this module.
type Result<T> = std::result::Result<T, ClusterError>;

/// Control-plane HTTP client, shared by the gateway and the daemon.
#[derive(Clone)]
pub struct CpClient {
    http: reqwest::Client,
}

impl Default for CpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CpClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn expect_ok(url: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(ClusterError::PeerStatus {
            url: url.to_string(),
            status,
            body,
        })
    }

    // -------------------------------------------------------------------
    // Snapshots and join
    // -------------------------------------------------------------------

    pub async fn fetch_smap(&self, intra_url: &str) -> Result<Smap> {
        let url = format!("{intra_url}{}", paths::SMAP);
        let resp = Self::expect_ok(&url, self.http.get(&url).send().await?).await?;
        Ok(resp.json().await?)
    }

    pub async fn fetch_bmd(&self, intra_url: &str) -> Result<Bmd> {
        let url = format!("{intra_url}{}", paths::BMD);
        let resp = Self::expect_ok(&url, self.http.get(&url).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Register `node` with the primary; answers with current snapshots.
    pub async fn join(&self, primary_intra: &str, node: &Node) -> Result<JoinReply> {
        let url = format!("{primary_intra}{}", paths::JOIN);
        let resp =
            Self::expect_ok(&url, self.http.post(&url).json(node).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Join the cluster, contacting candidates in order: the primary URL
    /// recorded in the cached map, then the discovery URL, then the
    /// original-primary URL. The first success wins.
    pub async fn discover_and_join(
        &self,
        candidates: &[String],
        node: &Node,
    ) -> Result<JoinReply> {
        let mut attempts = Vec::new();
        for base in candidates {
            if base.is_empty() {
                continue;
            }
            // The candidate may be any node; ask it for the map first and
            // then join through the actual primary.
            let primary_intra = match self.fetch_smap(base).await {
                Ok(smap) => match smap.primary_node() {
                    Some(p) => p.intra_url.clone(),
                    None => {
                        attempts.push(format!("{base}: map without primary"));
                        continue;
                    }
                },
                Err(e) => {
                    attempts.push(format!("{base}: {e}"));
                    continue;
                }
            };
            match self.join(&primary_intra, node).await {
                Ok(reply) => {
                    info!(via = %base, smap = reply.smap.version, "joined cluster");
                    return Ok(reply);
                }
                Err(e) => attempts.push(format!("{primary_intra}: {e}")),
            }
        }
        Err(ClusterError::JoinFailed(attempts))
    }

    /// Push a new snapshot to every node except `skip` (usually self).
    /// Best effort: a node that misses a broadcast catches up on its next
    /// join or install.
    pub async fn broadcast_smap(&self, smap: &Smap, skip: &NodeId) {
        let body = Arc::new(smap.clone());
        let mut tasks = tokio::task::JoinSet::new();
        for node in smap.all_nodes().filter(|n| n.id != *skip) {
            let url = format!("{}{}", node.intra_url, paths::SMAP);
            let http = self.http.clone();
            let body = body.clone();
            let id = node.id.clone();
            tasks.spawn(async move {
                if let Err(e) = http.put(&url).json(&*body).send().await {
                    warn!(node = %id, %e, "smap broadcast failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Push new bucket metadata to every node except `skip`.
    pub async fn broadcast_bmd(&self, smap: &Smap, bmd: &Bmd, skip: &NodeId) {
        let body = Arc::new(bmd.clone());
        let mut tasks = tokio::task::JoinSet::new();
        for node in smap.all_nodes().filter(|n| n.id != *skip) {
            let url = format!("{}{}", node.intra_url, paths::BMD);
            let http = self.http.clone();
            let body = body.clone();
            let id = node.id.clone();
            tasks.spawn(async move {
                if let Err(e) = http.put(&url).json(&*body).send().await {
                    warn!(node = %id, %e, "bmd broadcast failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    // -------------------------------------------------------------------
    // Forward-CP
    // -------------------------------------------------------------------

    /// Send a bucket-scope [`ActMsg`] to the primary and relay its
    /// response. Every proxy calls this for mutating bucket ops; on the
    /// primary it loops back over HTTP, which keeps one code path and
    /// one serialization point.
    pub async fn bucket_act(
        &self,
        primary_intra: &str,
        bucket: &str,
        act: &ActMsg,
    ) -> Result<(u16, String)> {
        let url = format!("{primary_intra}{}/{bucket}", paths::BUCKETS);
        debug!(url, action = %act.action, "forward-cp");
        let resp = self.http.post(&url).json(act).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }

    /// Fan an [`ActMsg`] out to all active targets at `path`. Fails on
    /// the first non-success answer.
    pub async fn broadcast_act(&self, smap: &Smap, path: &str, act: &ActMsg) -> Result<()> {
        for node in smap.active_targets() {
            let url = format!("{}{path}", node.intra_url);
            let resp = self.http.post(&url).json(act).send().await?;
            Self::expect_ok(&url, resp).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Cluster-wide object operations
    // -------------------------------------------------------------------

    /// List-range delete: every target deletes the keys it owns.
    pub async fn delete_objects(&self, smap: &Smap, bck: &Bck, names: &[String]) -> Result<()> {
        let req = DeleteObjsReq {
            bck: bck.clone(),
            names: names.to_vec(),
        };
        for node in smap.active_targets() {
            let url = format!("{}{}", node.intra_url, paths::OBJECTS_DELETE);
            let resp = self.http.post(&url).json(&req).send().await?;
            Self::expect_ok(&url, resp).await?;
        }
        Ok(())
    }

    /// One page of the distributed listing.
    ///
    /// Scatters the request to all active targets and merge-sorts the
    /// answers. When a target truncates its local page, keys above its
    /// last returned name may still be missing from this round, so the
    /// page is therefore cut at the smallest such bound so that every
    /// key is emitted exactly once across pages.
    pub async fn list_page(&self, smap: &Smap, bck: &Bck, msg: &LsoMsg) -> Result<LsoPage> {
        let req = ListPageReq {
            bck: bck.clone(),
            msg: msg.clone(),
        };

        let mut entries: Vec<LsoEntry> = Vec::new();
        let mut bound: Option<String> = None;
        let mut any_truncated = false;
        for node in smap.active_targets() {
            let url = format!("{}{}", node.intra_url, paths::OBJECTS_LIST);
            let resp = self.http.post(&url).json(&req).send().await?;
            let page: LsoPage = Self::expect_ok(&url, resp).await?.json().await?;
            if !msg.uuid.is_empty() && page.uuid != msg.uuid {
                return Err(ClusterError::ListUuidMismatch {
                    want: msg.uuid.clone(),
                    got: page.uuid,
                });
            }
            if !page.continuation_token.is_empty() {
                any_truncated = true;
                bound = Some(match bound.take() {
                    Some(b) if b <= page.continuation_token => b,
                    _ => page.continuation_token.clone(),
                });
            }
            entries.extend(page.entries);
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(bound) = &bound {
            entries.retain(|e| e.name <= *bound);
        }
        let overflow = entries.len() > msg.page_size;
        entries.truncate(msg.page_size);

        let continuation_token = if (any_truncated || overflow) && !entries.is_empty() {
            entries.last().map(|e| e.name.clone()).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(LsoPage {
            uuid: msg.uuid.clone(),
            entries,
            continuation_token,
        })
    }

    /// Aggregate every page of a listing, gateway-style.
    ///
    /// The first page establishes the listing job UUID; each subsequent
    /// page must echo it ([`ClusterError::ListUuidMismatch`] otherwise).
    pub async fn list_all_pages(
        &self,
        smap: &Smap,
        bck: &Bck,
        prefix: &str,
        page_size: usize,
    ) -> Result<Vec<LsoEntry>> {
        let mut msg = LsoMsg {
            prefix: prefix.to_string(),
            page_size,
            continuation_token: String::new(),
            uuid: Uuid::new_v4().simple().to_string(),
        };

        let mut all: Vec<LsoEntry> = Vec::new();
        loop {
            let page = self.list_page(smap, bck, &msg).await?;
            all.extend(page.entries);
            if page.continuation_token.is_empty() {
                return Ok(all);
            }
            msg.continuation_token = page.continuation_token;
        }
    }

    // -------------------------------------------------------------------
    // Transform-copy
    // -------------------------------------------------------------------

    /// Mint a transform-copy transaction UUID.
    pub fn new_tco_id() -> String {
        format!("tco-{}", Uuid::new_v4().simple())
    }

    /// Broadcast a transform-copy job to all active targets, in two
    /// phases: every target begins (inserts the work item and registers
    /// its receive side) before any target commits and starts moving
    /// data. No payload can reach a target that is not listening.
    /// The template selection is parsed here first so a malformed
    /// template fails on the originator, user-visibly, before anything
    /// is dispatched.
    pub async fn start_xcopy(&self, smap: &Smap, msg: &TcoMsg) -> Result<String> {
        msg.selection.parse_template()?;
        for node in smap.active_targets() {
            let url = format!("{}{}", node.intra_url, paths::XCOPY);
            let resp = self.http.post(&url).json(msg).send().await?;
            Self::expect_ok(&url, resp).await?;
        }
        for node in smap.active_targets() {
            let url = format!("{}{}/{}/commit", node.intra_url, paths::XCOPY, msg.txn_uuid);
            let resp = self.http.post(&url).send().await?;
            Self::expect_ok(&url, resp).await?;
        }
        info!(job = %msg.txn_uuid, from = %msg.bck_from, to = %msg.bck_to, "xcopy dispatched");
        Ok(msg.txn_uuid.clone())
    }

    // -------------------------------------------------------------------
    // Raw pass-through (reverse proxy, fan-out over public URLs)
    // -------------------------------------------------------------------

    /// HEAD a URL, returning the raw response for header relaying.
    pub async fn head_raw(&self, url: &str) -> Result<reqwest::Response> {
        Ok(self.http.head(url).send().await?)
    }

    /// GET a URL, returning the raw response.
    pub async fn get_raw(&self, url: &str) -> Result<reqwest::Response> {
        Ok(self.http.get(url).send().await?)
    }

    /// PUT raw bytes to a URL (target-to-target copy relay).
    pub async fn put_raw(&self, url: &str, body: bytes::Bytes) -> Result<reqwest::Response> {
        Ok(self.http.put(url).body(body).send().await?)
    }
}
