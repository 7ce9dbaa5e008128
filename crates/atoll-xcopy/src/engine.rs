//! The per-target transform-copy engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use atoll_cluster::SmapOwner;
use atoll_net::{DataMover, NetError, ObjHdr, RecvHandler, OPC_OBJ};
use atoll_placement::hrw_target;
use atoll_store::{mpath_of, ObjectStore, Owt};
use atoll_types::clock::wall_nanos;
use atoll_types::msg::{Selection, TcoMsg};
use atoll_types::template::Template;
use atoll_types::{ChecksumType, Cksum, NodeId, Smap};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::XcopyError;
use crate::etl::Transform;
use crate::pending::{JobSnap, JobState, WorkItem};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct XcopyConfig {
    /// Work-channel capacity; enqueuers yield above half of it.
    pub max_in_parallel: usize,
    /// Control-plane period: the receive-idle grace during quiescence.
    pub cplane_period: Duration,
    /// Total quiescence budget before declaring timeout.
    pub send_file_timeout: Duration,
    /// Workers per mountpath for ETL jobs (plain copy runs one).
    pub etl_parallel: usize,
    /// Joggers back off while mountpath utilization is at or above this.
    pub disk_util_high: u8,
}

impl Default for XcopyConfig {
    fn default() -> Self {
        Self {
            max_in_parallel: 64,
            cplane_period: Duration::from_secs(1),
            send_file_timeout: Duration::from_secs(120),
            etl_parallel: 2,
            disk_util_high: 80,
        }
    }
}

/// How the engine reaches the data-mover layer: per-job stream opening
/// plus receive-handler (de)registration. Implemented over the QUIC
/// endpoint in the daemon and over the loopback net in tests.
#[async_trait::async_trait]
pub trait MoverConnector: Send + Sync {
    async fn open(&self, job_uuid: &str, pdu: bool) -> Result<Arc<dyn DataMover>, NetError>;
    async fn register(&self, job_uuid: &str, handler: Arc<dyn RecvHandler>);
    async fn unregister(&self, job_uuid: &str);
}

/// Per-job context shared by the jogger workers.
struct JobCtx {
    wi: Arc<WorkItem>,
    mover: Arc<dyn DataMover>,
    smap: Arc<Smap>,
    store: Arc<dyn ObjectStore>,
    local: NodeId,
    etl: Option<Arc<dyn Transform>>,
    util_high: u8,
}

/// The per-target transform-copy engine.
///
/// Jobs arrive in two phases, [`XcopyEngine::begin`] then
/// [`XcopyEngine::commit`], and are queued on a bounded work channel,
/// executed one at a time by the dispatch loop; parallelism lives inside
/// a job (one jogger per mountpath). The pending map holds each job's
/// [`WorkItem`] from begin until all peers have signaled done.
pub struct XcopyEngine {
    local: NodeId,
    smap: Arc<SmapOwner>,
    store: Arc<dyn ObjectStore>,
    connector: Arc<dyn MoverConnector>,
    cfg: XcopyConfig,
    pending: RwLock<HashMap<String, Arc<WorkItem>>>,
    /// Movers of jobs that are begun but not yet committed.
    staged: StdMutex<HashMap<String, Arc<dyn DataMover>>>,
    /// Final snapshots of completed jobs, kept for status polling.
    finished: RwLock<HashMap<String, JobSnap>>,
    etls: RwLock<HashMap<String, Arc<dyn Transform>>>,
    work_tx: mpsc::Sender<(Arc<WorkItem>, Arc<dyn DataMover>)>,
    chan_full: AtomicI64,
}

impl XcopyEngine {
    pub fn new(
        local: NodeId,
        smap: Arc<SmapOwner>,
        store: Arc<dyn ObjectStore>,
        connector: Arc<dyn MoverConnector>,
        cfg: XcopyConfig,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::channel(cfg.max_in_parallel);
        let engine = Arc::new(Self {
            local,
            smap,
            store,
            connector,
            cfg,
            pending: RwLock::new(HashMap::new()),
            staged: StdMutex::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            etls: RwLock::new(HashMap::new()),
            work_tx,
            chan_full: AtomicI64::new(0),
        });
        tokio::spawn(Self::run_loop(engine.clone(), work_rx));
        engine
    }

    /// Make an ETL transform available to jobs by name.
    pub fn register_etl(&self, transform: Arc<dyn Transform>) {
        self.etls
            .write()
            .expect("etl registry poisoned")
            .insert(transform.name().to_string(), transform);
    }

    /// Status of one job, pending or finished.
    pub fn status(&self, uuid: &str) -> Option<JobSnap> {
        if let Some(wi) = self.pending.read().expect("pending map poisoned").get(uuid) {
            return Some(wi.snap());
        }
        self.finished
            .read()
            .expect("finished map poisoned")
            .get(uuid)
            .cloned()
    }

    /// Abort a pending job. A job that was begun but never committed is
    /// torn down right here; no dispatch loop will ever pick it up.
    pub async fn abort(&self, uuid: &str, reason: &str) -> Result<(), XcopyError> {
        let wi = self
            .pending
            .read()
            .expect("pending map poisoned")
            .get(uuid)
            .cloned()
            .ok_or_else(|| XcopyError::UnknownJob(uuid.to_string()))?;
        wi.abort(XcopyError::Aborted(reason.to_string()));

        let staged = self
            .staged
            .lock()
            .expect("staged map poisoned")
            .remove(uuid);
        if let Some(mover) = staged {
            wi.set_state(JobState::Aborted);
            self.finish(&wi, mover).await;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().expect("pending map poisoned").len()
    }

    /// Begin a job: validate the message, insert the work item into the
    /// pending map, and hook up the data mover's receive side. The job
    /// does not run until [`XcopyEngine::commit`]: the originator
    /// commits only once every target has begun, so no payload can
    /// arrive at a target whose receive handler is not yet registered.
    pub async fn begin(&self, msg: TcoMsg) -> Result<(), XcopyError> {
        let smap = self.smap.get();
        let me_active = smap
            .tmap
            .get(&self.local)
            .is_some_and(|n| n.is_active());
        if !me_active {
            return Err(XcopyError::NotActive(smap.version));
        }

        // A malformed template must fail before any state exists.
        msg.selection.parse_template()?;

        if let Some(name) = &msg.etl {
            if !self
                .etls
                .read()
                .expect("etl registry poisoned")
                .contains_key(name)
            {
                return Err(XcopyError::UnknownEtl(name.clone()));
            }
        }

        let uuid = msg.txn_uuid.clone();
        let is_etl = msg.is_etl();
        let wi = Arc::new(WorkItem::new(msg));
        {
            let mut pending = self.pending.write().expect("pending map poisoned");
            if pending.contains_key(&uuid) {
                return Err(XcopyError::DuplicateJob(uuid));
            }
            pending.insert(uuid.clone(), wi.clone());
        }

        let handler = Arc::new(JobRecv {
            wi,
            store: self.store.clone(),
        });
        self.connector.register(&uuid, handler).await;
        let mover = match self.connector.open(&uuid, is_etl).await {
            Ok(m) => m,
            Err(e) => {
                self.connector.unregister(&uuid).await;
                self.pending
                    .write()
                    .expect("pending map poisoned")
                    .remove(&uuid);
                return Err(e.into());
            }
        };
        self.staged
            .lock()
            .expect("staged map poisoned")
            .insert(uuid, mover);
        Ok(())
    }

    /// Commit a begun job: enqueue it for execution.
    ///
    /// Enqueueing applies the work-channel backpressure discipline:
    /// above half capacity the enqueuer yields; at full capacity the
    /// throttle event is logged periodically rather than per message.
    pub async fn commit(&self, uuid: &str) -> Result<(), XcopyError> {
        let mover = self
            .staged
            .lock()
            .expect("staged map poisoned")
            .remove(uuid)
            .ok_or_else(|| XcopyError::UnknownJob(uuid.to_string()))?;
        let wi = self
            .pending
            .read()
            .expect("pending map poisoned")
            .get(uuid)
            .cloned()
            .ok_or_else(|| XcopyError::UnknownJob(uuid.to_string()))?;

        let cap = self.work_tx.max_capacity();
        let occupancy = cap - self.work_tx.capacity();
        if occupancy > cap / 2 {
            tokio::task::yield_now().await;
            if occupancy == cap {
                let cnt = self.chan_full.fetch_add(1, Ordering::Relaxed) + 1;
                if (10..=20).contains(&cnt) {
                    warn!(job = %uuid, "work channel full");
                }
            }
        }
        if self.work_tx.send((wi, mover)).await.is_err() {
            return Err(XcopyError::Aborted("engine stopped".to_string()));
        }
        Ok(())
    }

    async fn run_loop(
        engine: Arc<Self>,
        mut work_rx: mpsc::Receiver<(Arc<WorkItem>, Arc<dyn DataMover>)>,
    ) {
        while let Some((wi, mover)) = work_rx.recv().await {
            engine.run_job(wi, mover).await;
        }
        debug!("xcopy dispatch loop stopped");
    }

    async fn run_job(self: &Arc<Self>, wi: Arc<WorkItem>, mover: Arc<dyn DataMover>) {
        let smap = self.smap.get();
        let nat = smap.count_active_targets();
        wi.arm_refc(nat as i32 - 1);
        wi.set_state(JobState::Running);
        info!(
            job = %wi.msg.txn_uuid,
            from = %wi.msg.bck_from,
            to = %wi.msg.bck_to,
            peers = nat - 1,
            "xcopy: running"
        );

        if let Err(e) = self.iterate(&wi, &mover, &smap).await {
            if !wi.aborted() {
                wi.abort(e);
            }
        }

        if wi.aborted() {
            wi.set_state(JobState::Aborted);
        } else {
            // Local iteration done: tell every peer, then wait for their
            // "done"s. The mover preserves per-sender FIFO, so this ack
            // follows every payload already enqueued above. Best effort:
            // a peer that died mid-job is caught by the quiescence
            // timeout, not here.
            for peer in smap.active_targets().filter(|n| n.id != self.local) {
                if let Err(e) = mover.send_done(&peer.id, &wi.msg.txn_uuid).await {
                    warn!(job = %wi.msg.txn_uuid, peer = %peer.id, %e, "done broadcast failed");
                }
            }
            self.quiesce(&wi).await;
        }

        self.finish(&wi, mover).await;
    }

    /// Mountpath-parallel iteration over the selection.
    async fn iterate(
        self: &Arc<Self>,
        wi: &Arc<WorkItem>,
        mover: &Arc<dyn DataMover>,
        smap: &Arc<Smap>,
    ) -> Result<(), XcopyError> {
        let etl = match &wi.msg.etl {
            Some(name) => Some(
                self.etls
                    .read()
                    .expect("etl registry poisoned")
                    .get(name)
                    .cloned()
                    .ok_or_else(|| XcopyError::UnknownEtl(name.clone()))?,
            ),
            None => None,
        };

        let ctx = Arc::new(JobCtx {
            wi: wi.clone(),
            mover: mover.clone(),
            smap: smap.clone(),
            store: self.store.clone(),
            local: self.local.clone(),
            etl,
            util_high: self.cfg.disk_util_high,
        });

        let parallel = if wi.msg.is_etl() {
            self.cfg.etl_parallel.max(1)
        } else {
            1
        };

        let mut workers = JoinSet::new();
        for mp in 0..self.store.num_mountpaths() {
            let names = self.names_for_mountpath(mp, wi, smap).await?;
            if names.is_empty() {
                continue;
            }
            // Fixed small parallelism per mountpath for ETL overlaps
            // transform latency with I/O; plain copy keeps one jogger
            // per disk.
            let chunk = names.len().div_ceil(parallel);
            for piece in names.chunks(chunk.max(1)) {
                let ctx = ctx.clone();
                let piece = piece.to_vec();
                workers.spawn(async move { jogger(ctx, mp, piece).await });
            }
        }

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                wi.add_err(format!("jogger panicked: {e}"));
            }
        }

        if wi.aborted() {
            Err(XcopyError::Aborted(wi.err().unwrap_or_default()))
        } else {
            Ok(())
        }
    }

    /// The names this target must process on one mountpath.
    ///
    /// Template and list selections are filtered by source-object hash
    /// ownership; non-owners skip silently. A prefix selection iterates
    /// the local store, which holds owned objects by construction.
    async fn names_for_mountpath(
        &self,
        mp: usize,
        wi: &WorkItem,
        smap: &Smap,
    ) -> Result<Vec<String>, XcopyError> {
        let bck = &wi.msg.bck_from;
        let n_mp = self.store.num_mountpaths();
        let owned_here = |name: &str| -> Result<bool, XcopyError> {
            let owner = hrw_target(&bck.make_uname(name), smap)?;
            Ok(owner.id == self.local && mpath_of(bck, name, n_mp) == mp)
        };

        match &wi.msg.selection {
            Selection::Prefix(prefix) => {
                Ok(self.store.list_mountpath(mp, bck, prefix).await?)
            }
            Selection::Template(spec) => {
                let template = Template::parse(spec)?;
                let mut names = Vec::new();
                for name in template.iter() {
                    if owned_here(&name)? {
                        names.push(name);
                    }
                }
                Ok(names)
            }
            Selection::List(all) => {
                let mut names = Vec::new();
                for name in all {
                    if owned_here(name)? {
                        names.push(name.clone());
                    }
                }
                Ok(names)
            }
        }
    }

    /// Quiescence: wait until this target's refc reaches zero, an abort
    /// arrives, or the timeout discipline trips: idle on the receive
    /// side for more than one control-plane period while the total wait
    /// has exceeded the send-file budget.
    async fn quiesce(&self, wi: &Arc<WorkItem>) {
        wi.set_state(JobState::Quiescing);
        let started = Instant::now();
        let poll = (self.cfg.cplane_period / 10).max(Duration::from_millis(5));
        let mut abort_rx = wi.abort_watch();

        loop {
            if wi.refc() <= 0 {
                wi.set_state(JobState::Done);
                return;
            }
            if wi.aborted() {
                wi.set_state(JobState::Aborted);
                return;
            }
            let idle = Duration::from_nanos(wi.rx_idle_ns());
            if idle > self.cfg.cplane_period && started.elapsed() > self.cfg.send_file_timeout {
                wi.add_err(XcopyError::QuiesceTimeout { missing: wi.refc() });
                wi.set_state(JobState::Aborted);
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = abort_rx.changed() => {}
            }
        }
    }

    /// Teardown: deregister the receive handler, close the transport
    /// exactly once, release the work item, and clean a destination this
    /// job created if it aborted.
    async fn finish(&self, wi: &Arc<WorkItem>, mover: Arc<dyn DataMover>) {
        self.connector.unregister(&wi.msg.txn_uuid).await;
        if let Err(e) = mover.close().await {
            warn!(job = %wi.msg.txn_uuid, %e, "mover close");
        }
        let state = wi.state();
        self.finished
            .write()
            .expect("finished map poisoned")
            .insert(wi.msg.txn_uuid.clone(), wi.snap());
        self.pending
            .write()
            .expect("pending map poisoned")
            .remove(&wi.msg.txn_uuid);

        if state == JobState::Aborted && wi.msg.dst_was_created {
            // The destination bucket only exists because of this job;
            // drop whatever landed locally. `dst_was_created` was
            // recorded when the job was accepted, never inferred.
            match self.store.evict_bucket(&wi.msg.bck_to).await {
                Ok(n) => debug!(job = %wi.msg.txn_uuid, evicted = n, "cleaned created destination"),
                Err(e) => warn!(job = %wi.msg.txn_uuid, %e, "destination cleanup failed"),
            }
        }
        info!(
            job = %wi.msg.txn_uuid,
            ?state,
            copied = wi.n_copied.load(Ordering::Relaxed),
            sent = wi.n_sent.load(Ordering::Relaxed),
            received = wi.n_received.load(Ordering::Relaxed),
            skipped = wi.n_skipped.load(Ordering::Relaxed),
            err = wi.err().as_deref().unwrap_or(""),
            "xcopy: finished"
        );
    }
}

/// One jogger worker: processes its share of a mountpath's names.
async fn jogger(ctx: Arc<JobCtx>, mp: usize, names: Vec<String>) {
    let abort_rx = ctx.wi.abort_watch();
    for name in names {
        if *abort_rx.borrow() {
            return;
        }
        // Always-on throttling: back off while the disk is busy.
        while ctx.store.utilization(mp).await >= ctx.util_high {
            if *abort_rx.borrow() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Err(e) = copy_one(&ctx, &name).await {
            let suppress = matches!(&e, XcopyError::NotFound(_))
                && ctx.wi.msg.selection.is_list()
                && ctx.wi.msg.continue_on_error;
            if suppress {
                ctx.wi.n_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            ctx.wi.abort(e);
            return;
        }
    }
}

/// Copy or transform one object to its hash-assigned destination.
async fn copy_one(ctx: &JobCtx, name: &str) -> Result<(), XcopyError> {
    let msg = &ctx.wi.msg;
    let to_name = msg.xform.to_name(name);

    // Same bucket, same name: the destination already is the source.
    if ctx.wi.sync_same_name && to_name == name {
        ctx.wi.n_skipped.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    let obj = ctx
        .store
        .get(&msg.bck_from, name)
        .await?
        .ok_or_else(|| XcopyError::NotFound(msg.bck_from.cname(name)))?;

    let (data, mut attrs) = (obj.data, obj.attrs);
    let data = match &ctx.etl {
        Some(t) => {
            let out = t
                .apply(name, data)
                .map_err(|reason| XcopyError::EtlFailed {
                    obj: msg.bck_from.cname(name),
                    reason,
                })?;
            // Transformed bytes get a fresh checksum; the original one
            // described the source payload.
            attrs.checksum = Cksum::compute(ChecksumType::Blake3, &out);
            out
        }
        None => data,
    };
    attrs.size = data.len() as i64;

    if msg.dry_run {
        ctx.wi.n_copied.fetch_add(1, Ordering::Relaxed);
        ctx.wi
            .bytes_moved
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        return Ok(());
    }

    let dst_uname = msg.bck_to.make_uname(&to_name);
    let owner = hrw_target(&dst_uname, &ctx.smap)?;
    let size = data.len() as u64;

    if owner.id == ctx.local {
        ctx.store
            .put(&msg.bck_to, &to_name, data, attrs, Owt::Put)
            .await?;
        ctx.wi.n_copied.fetch_add(1, Ordering::Relaxed);
    } else {
        let hdr = ObjHdr {
            opcode: OPC_OBJ,
            txn_uuid: msg.txn_uuid.clone(),
            bck: msg.bck_to.clone(),
            obj_name: to_name,
            attrs,
        };
        ctx.mover.send_obj(&owner.id, hdr, data).await?;
        ctx.wi.n_sent.fetch_add(1, Ordering::Relaxed);
    }
    ctx.wi.bytes_moved.fetch_add(size, Ordering::Relaxed);
    Ok(())
}

/// Receive side of a job: commits incoming objects, counts "done"s.
struct JobRecv {
    wi: Arc<WorkItem>,
    store: Arc<dyn ObjectStore>,
}

#[async_trait::async_trait]
impl RecvHandler for JobRecv {
    async fn recv(&self, hdr: ObjHdr, payload: Bytes) -> Result<(), NetError> {
        self.wi.touch_rx();

        if hdr.is_done() {
            let left = self.wi.dec_refc();
            debug!(job = %hdr.txn_uuid, left, "received done");
            return Ok(());
        }

        let mut attrs = hdr.attrs;
        attrs.size = payload.len() as i64;
        if attrs.atime_ns == 0 {
            // The sender should be setting it; synthesize until then.
            attrs.atime_ns = wall_nanos() as i64;
        }

        match self
            .store
            .put(&hdr.bck, &hdr.obj_name, payload, attrs, Owt::Put)
            .await
        {
            Ok(()) => {
                self.wi.n_received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if self.wi.msg.continue_on_error {
                    self.wi.add_err(&e);
                    Ok(())
                } else {
                    // Strict mode: the put error aborts the local job and
                    // is handed back to the transport to terminate the
                    // sender's stream.
                    self.wi.abort(&e);
                    Err(NetError::Rejected(e.to_string()))
                }
            }
        }
    }
}
