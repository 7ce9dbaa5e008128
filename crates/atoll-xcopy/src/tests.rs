//! Multi-target engine tests over the loopback mover.
//!
//! Targets share one cluster map and one in-process "network"; each has
//! its own store, exactly like separate processes would. Jobs are
//! dispatched to every engine the way the originating proxy broadcasts
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use atoll_cluster::SmapOwner;
use atoll_net::{DataMover, LoopbackMover, LoopbackNet, NetError, RecvHandler};
use atoll_placement::hrw_target;
use atoll_store::{MemoryStore, ObjectStore, Owt};
use atoll_types::clock::wall_nanos;
use atoll_types::msg::{NameXform, Selection, TcoMsg};
use atoll_types::{
    Bck, ChecksumType, Cksum, Node, NodeId, NodeRole, NodeState, ObjAttrs, Smap,
};
use bytes::Bytes;

use crate::engine::{MoverConnector, XcopyConfig, XcopyEngine};
use crate::etl::Transform;
use crate::pending::JobState;

const STORE_BYTES: u64 = 1 << 30;

struct LoopbackConnector {
    net: Arc<LoopbackNet>,
    local: NodeId,
}

#[async_trait::async_trait]
impl MoverConnector for LoopbackConnector {
    async fn open(&self, job_uuid: &str, _pdu: bool) -> Result<Arc<dyn DataMover>, NetError> {
        Ok(Arc::new(LoopbackMover::new(self.net.clone(), job_uuid)))
    }

    async fn register(&self, job_uuid: &str, handler: Arc<dyn RecvHandler>) {
        self.net.register(self.local.clone(), job_uuid, handler).await;
    }

    async fn unregister(&self, job_uuid: &str) {
        self.net.unregister(&self.local, job_uuid).await;
    }
}

struct TestCluster {
    smap: Smap,
    engines: Vec<Arc<XcopyEngine>>,
    stores: Vec<Arc<MemoryStore>>,
    ids: Vec<NodeId>,
}

fn target_node(id: &str) -> Node {
    Node {
        id: NodeId::from(id),
        role: NodeRole::Target,
        pub_urls: vec![format!("http://{id}:8080")],
        intra_url: format!("http://{id}:9080"),
        mover_id: None,
        mover_addrs: vec![],
        state: NodeState::Active,
    }
}

fn test_config() -> XcopyConfig {
    XcopyConfig {
        max_in_parallel: 8,
        cplane_period: Duration::from_millis(50),
        send_file_timeout: Duration::from_millis(400),
        etl_parallel: 2,
        disk_util_high: 101, // never throttle in tests
    }
}

/// Build an `n`-target cluster; `live` of them actually run engines.
fn cluster_with_live(n: usize, live: usize, cfg: XcopyConfig) -> TestCluster {
    let mut smap = Smap::initial(Node {
        id: NodeId::from("p-0"),
        role: NodeRole::Proxy,
        pub_urls: vec!["http://p-0:8080".to_string()],
        intra_url: "http://p-0:9080".to_string(),
        mover_id: None,
        mover_addrs: vec![],
        state: NodeState::Active,
    });
    let ids: Vec<NodeId> = (0..n).map(|i| NodeId::new(format!("t-{i}"))).collect();
    for id in &ids {
        smap.tmap.insert(id.clone(), target_node(id.as_str()));
    }
    smap.version = 2;

    let net = LoopbackNet::new();
    let mut engines = Vec::new();
    let mut stores = Vec::new();
    for id in ids.iter().take(live) {
        let store = Arc::new(MemoryStore::new(2, STORE_BYTES));
        let engine = XcopyEngine::new(
            id.clone(),
            Arc::new(SmapOwner::new(smap.clone())),
            store.clone(),
            Arc::new(LoopbackConnector {
                net: net.clone(),
                local: id.clone(),
            }),
            cfg.clone(),
        );
        engines.push(engine);
        stores.push(store);
    }

    TestCluster {
        smap,
        engines,
        stores,
        ids,
    }
}

fn cluster(n: usize) -> TestCluster {
    cluster_with_live(n, n, test_config())
}

impl TestCluster {
    /// Store index owning `name` in `bck`.
    fn owner_of(&self, bck: &Bck, name: &str) -> usize {
        let owner = hrw_target(&bck.make_uname(name), &self.smap).unwrap();
        self.ids.iter().position(|id| *id == owner.id).unwrap()
    }

    /// Seed objects onto their hash-assigned owners.
    async fn seed(&self, bck: &Bck, names: &[String], payload_len: usize) {
        for (i, name) in names.iter().enumerate() {
            let mut data = vec![(i % 251) as u8; payload_len];
            data[0] = (i / 251) as u8;
            let data = Bytes::from(data);
            let attrs = ObjAttrs {
                size: data.len() as i64,
                atime_ns: wall_nanos() as i64,
                checksum: Cksum::compute(ChecksumType::Blake3, &data),
                custom: BTreeMap::new(),
            };
            let owner = self.owner_of(bck, name);
            self.stores[owner]
                .put(bck, name, data, attrs, Owt::Put)
                .await
                .unwrap();
        }
    }

    /// Broadcast a job to every live engine, the way the originating
    /// proxy does: every target begins before any target commits.
    async fn dispatch_all(&self, msg: &TcoMsg) {
        for engine in &self.engines {
            engine.begin(msg.clone()).await.unwrap();
        }
        for engine in &self.engines {
            engine.commit(&msg.txn_uuid).await.unwrap();
        }
    }

    /// Wait until no engine has the job pending.
    async fn wait_done(&self, uuid: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self
                .engines
                .iter()
                .any(|e| e.status(uuid).is_some_and(|s| !s.state.is_terminal()));
            if !pending {
                return;
            }
            assert!(Instant::now() < deadline, "job {uuid} did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Fetch an object from whichever target owns it.
    async fn get(&self, bck: &Bck, name: &str) -> Option<atoll_store::StoredObject> {
        let owner = self.owner_of(bck, name);
        self.stores[owner].get(bck, name).await.unwrap()
    }

    /// Total object count in a bucket across all live targets.
    async fn count(&self, bck: &Bck, prefix: &str) -> usize {
        let mut total = 0;
        for store in &self.stores {
            let (page, more) = store.list_page(bck, prefix, "", 100_000).await.unwrap();
            assert!(!more);
            total += page.len();
        }
        total
    }
}

fn tco_msg(uuid: &str, from: &Bck, to: &Bck, selection: Selection) -> TcoMsg {
    TcoMsg {
        txn_uuid: uuid.to_string(),
        bck_from: from.clone(),
        bck_to: to.clone(),
        selection,
        xform: NameXform::default(),
        dry_run: false,
        continue_on_error: false,
        etl: None,
        dst_was_created: false,
    }
}

#[tokio::test]
async fn test_template_copy_moves_exact_window() {
    let cluster = cluster(3);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");

    let names: Vec<String> = (1..=100).map(|i| format!("test/a-{i:04}")).collect();
    cluster.seed(&b1, &names, 128).await;

    let msg = tco_msg(
        "tco-template",
        &b1,
        &b2,
        Selection::Template("test/a-{0010..0029}".to_string()),
    );
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-template", Duration::from_secs(5)).await;

    assert_eq!(cluster.count(&b2, "test/").await, 20);
    for i in 10..30 {
        let name = format!("test/a-{i:04}");
        let src = cluster.get(&b1, &name).await.unwrap();
        let dst = cluster.get(&b2, &name).await.unwrap();
        assert_eq!(src.data, dst.data);
        // Attributes preserved: size, checksum, and a set atime.
        assert_eq!(dst.attrs.size, 128);
        assert_eq!(dst.attrs.checksum, src.attrs.checksum);
        assert!(dst.attrs.atime_ns > 0);
    }
    for engine in &cluster.engines {
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(
            engine.status("tco-template").unwrap().state,
            JobState::Done
        );
    }
}

#[tokio::test]
async fn test_done_accounting_balances() {
    let cluster = cluster(4);
    let b1 = Bck::native("src");
    let b2 = Bck::native("dst");
    let names: Vec<String> = (0..40).map(|i| format!("k/{i:03}")).collect();
    cluster.seed(&b1, &names, 64).await;

    let msg = tco_msg("tco-acct", &b1, &b2, Selection::Prefix("k/".to_string()));
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-acct", Duration::from_secs(5)).await;

    // Every target finished with its own refc drained.
    for engine in &cluster.engines {
        let snap = engine.status("tco-acct").unwrap();
        assert_eq!(snap.state, JobState::Done);
        assert_eq!(snap.refc, 0);
    }
    assert_eq!(cluster.count(&b2, "").await, 40);
}

#[tokio::test]
async fn test_prefix_copy_with_prepend() {
    let cluster = cluster(3);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");
    let names: Vec<String> = (0..25).map(|i| format!("logs/{i:02}")).collect();
    cluster.seed(&b1, &names, 32).await;

    let mut msg = tco_msg("tco-prepend", &b1, &b2, Selection::Prefix("logs/".to_string()));
    msg.xform = NameXform {
        prepend: "archive/".to_string(),
        ..NameXform::default()
    };
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-prepend", Duration::from_secs(5)).await;

    assert_eq!(cluster.count(&b2, "archive/logs/").await, 25);
    assert_eq!(cluster.count(&b2, "logs/").await, 0);
    assert!(cluster.get(&b2, "archive/logs/07").await.is_some());
    assert!(cluster.get(&b2, "logs/07").await.is_none());
}

#[tokio::test]
async fn test_list_copy_skips_unowned_silently() {
    let cluster = cluster(3);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");
    let names: Vec<String> = (0..10).map(|i| format!("obj-{i}")).collect();
    cluster.seed(&b1, &names, 16).await;

    let msg = tco_msg("tco-list", &b1, &b2, Selection::List(names.clone()));
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-list", Duration::from_secs(5)).await;

    assert_eq!(cluster.count(&b2, "").await, 10);
    for engine in &cluster.engines {
        assert_eq!(engine.status("tco-list").unwrap().state, JobState::Done);
    }
}

#[tokio::test]
async fn test_list_not_found_suppressed_with_continue_on_error() {
    let cluster = cluster(3);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");
    let names: Vec<String> = (0..6).map(|i| format!("have-{i}")).collect();
    cluster.seed(&b1, &names, 16).await;

    let mut all = names.clone();
    all.push("missing-1".to_string());
    all.push("missing-2".to_string());

    let mut msg = tco_msg("tco-cont", &b1, &b2, Selection::List(all));
    msg.continue_on_error = true;
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-cont", Duration::from_secs(5)).await;

    assert_eq!(cluster.count(&b2, "have-").await, 6);
    let total_skipped: u64 = cluster
        .engines
        .iter()
        .map(|e| e.status("tco-cont").unwrap().n_skipped)
        .sum();
    assert_eq!(total_skipped, 2);
    for engine in &cluster.engines {
        assert_eq!(engine.status("tco-cont").unwrap().state, JobState::Done);
    }
}

#[tokio::test]
async fn test_list_not_found_aborts_when_strict() {
    let cluster = cluster(2);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");

    let missing = vec!["nope-a".to_string(), "nope-b".to_string()];
    let msg = tco_msg("tco-strict", &b1, &b2, Selection::List(missing.clone()));
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-strict", Duration::from_secs(5)).await;

    // Both names hash somewhere; whichever target owns one aborts.
    let aborted = cluster
        .engines
        .iter()
        .filter(|e| e.status("tco-strict").unwrap().state == JobState::Aborted)
        .count();
    assert!(aborted >= 1, "strict missing objects must abort the owner");
    for engine in &cluster.engines {
        assert_eq!(engine.pending_count(), 0);
    }
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let cluster = cluster(3);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");
    let names: Vec<String> = (0..20).map(|i| format!("d/{i:02}")).collect();
    cluster.seed(&b1, &names, 64).await;

    let mut msg = tco_msg("tco-dry", &b1, &b2, Selection::Prefix("d/".to_string()));
    msg.dry_run = true;
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-dry", Duration::from_secs(5)).await;

    assert_eq!(cluster.count(&b2, "").await, 0);
    let counted: u64 = cluster
        .engines
        .iter()
        .map(|e| e.status("tco-dry").unwrap().n_copied)
        .sum();
    assert_eq!(counted, 20);
}

#[tokio::test]
async fn test_dead_peer_trips_quiesce_timeout_and_releases_state() {
    // Three targets in the map, only two alive: each live target arms
    // refc = 2 but receives a single "done", so its counter never
    // reaches zero and the quiescence timeout fires.
    let cluster = cluster_with_live(3, 2, test_config());
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");

    let msg = tco_msg("tco-dead", &b1, &b2, Selection::List(vec![]));
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-dead", Duration::from_secs(5)).await;

    for engine in &cluster.engines {
        let snap = engine.status("tco-dead").unwrap();
        assert_eq!(snap.state, JobState::Aborted);
        assert!(
            snap.err.as_deref().unwrap_or("").contains("quiesce timeout"),
            "unexpected err: {:?}",
            snap.err
        );
        assert_eq!(snap.refc, 1, "one done signal must remain outstanding");
        assert_eq!(engine.pending_count(), 0, "pending state must be released");
    }
}

#[tokio::test]
async fn test_single_target_job_finishes_alone() {
    let cluster = cluster(1);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");
    let names: Vec<String> = (0..5).map(|i| format!("solo-{i}")).collect();
    cluster.seed(&b1, &names, 8).await;

    let msg = tco_msg("tco-solo", &b1, &b2, Selection::Prefix(String::new()));
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-solo", Duration::from_secs(5)).await;

    assert_eq!(cluster.count(&b2, "").await, 5);
    assert_eq!(cluster.engines[0].status("tco-solo").unwrap().state, JobState::Done);
}

struct ReverseTransform;

impl Transform for ReverseTransform {
    fn name(&self) -> &str {
        "reverse"
    }

    fn apply(&self, _obj_name: &str, data: Bytes) -> Result<Bytes, String> {
        let mut v = data.to_vec();
        v.reverse();
        Ok(Bytes::from(v))
    }
}

#[tokio::test]
async fn test_etl_transforms_payloads() {
    let cluster = cluster(3);
    for engine in &cluster.engines {
        engine.register_etl(Arc::new(ReverseTransform));
    }
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");
    let names: Vec<String> = (0..12).map(|i| format!("e/{i:02}")).collect();
    cluster.seed(&b1, &names, 48).await;

    let mut msg = tco_msg("tco-etl", &b1, &b2, Selection::Prefix("e/".to_string()));
    msg.etl = Some("reverse".to_string());
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-etl", Duration::from_secs(5)).await;

    assert_eq!(cluster.count(&b2, "e/").await, 12);
    for name in &names {
        let src = cluster.get(&b1, name).await.unwrap();
        let dst = cluster.get(&b2, name).await.unwrap();
        let mut expect = src.data.to_vec();
        expect.reverse();
        assert_eq!(dst.data.to_vec(), expect);
        // The transformed payload carries a fresh checksum.
        let want = Cksum::compute(ChecksumType::Blake3, &expect).unwrap();
        assert_eq!(dst.attrs.checksum.as_ref().unwrap().value, want.value);
    }
}

#[tokio::test]
async fn test_unknown_etl_rejected_at_dispatch() {
    let cluster = cluster(1);
    let mut msg = tco_msg(
        "tco-noetl",
        &Bck::native("b1"),
        &Bck::native("b2"),
        Selection::Prefix(String::new()),
    );
    msg.etl = Some("no-such-transform".to_string());
    let err = cluster.engines[0].begin(msg).await.unwrap_err();
    assert!(matches!(err, crate::XcopyError::UnknownEtl(_)));
    assert_eq!(cluster.engines[0].pending_count(), 0);
}

#[tokio::test]
async fn test_bad_template_rejected_at_dispatch() {
    let cluster = cluster(1);
    let msg = tco_msg(
        "tco-badtpl",
        &Bck::native("b1"),
        &Bck::native("b2"),
        Selection::Template("oops{..}".to_string()),
    );
    let err = cluster.engines[0].begin(msg).await.unwrap_err();
    assert!(matches!(err, crate::XcopyError::Template(_)));
}

#[tokio::test]
async fn test_abort_cleans_created_destination() {
    let cluster = cluster(1);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");

    // Something already landed in the created destination before the
    // job hits the missing object and aborts.
    cluster.seed(&b1, &["keep-0".to_string()], 8).await;
    cluster
        .stores[0]
        .put(
            &b2,
            "partial",
            Bytes::from_static(b"x"),
            ObjAttrs::default(),
            Owt::Put,
        )
        .await
        .unwrap();

    let mut msg = tco_msg(
        "tco-clean",
        &b1,
        &b2,
        Selection::List(vec!["missing".to_string()]),
    );
    msg.dst_was_created = true;
    cluster.dispatch_all(&msg).await;
    cluster.wait_done("tco-clean", Duration::from_secs(5)).await;

    assert_eq!(
        cluster.engines[0].status("tco-clean").unwrap().state,
        JobState::Aborted
    );
    assert_eq!(cluster.count(&b2, "").await, 0, "created destination must be cleaned");
}

#[tokio::test]
async fn test_duplicate_job_rejected() {
    let cluster = cluster(1);
    let msg = tco_msg(
        "tco-dup",
        &Bck::native("b1"),
        &Bck::native("b2"),
        Selection::List(vec![]),
    );
    cluster.engines[0].begin(msg.clone()).await.unwrap();
    let err = cluster.engines[0].begin(msg.clone()).await.unwrap_err();
    assert!(matches!(err, crate::XcopyError::DuplicateJob(_)));
    cluster.engines[0].commit(&msg.txn_uuid).await.unwrap();
    cluster.wait_done("tco-dup", Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_abort_before_commit_tears_down() {
    let cluster = cluster(1);
    let msg = tco_msg(
        "tco-staged",
        &Bck::native("b1"),
        &Bck::native("b2"),
        Selection::List(vec![]),
    );
    cluster.engines[0].begin(msg.clone()).await.unwrap();
    cluster.engines[0]
        .abort("tco-staged", "never committed")
        .await
        .unwrap();
    assert_eq!(cluster.engines[0].pending_count(), 0);
    assert_eq!(
        cluster.engines[0].status("tco-staged").unwrap().state,
        JobState::Aborted
    );
    // Committing after the teardown is an error, not a hang.
    assert!(cluster.engines[0].commit("tco-staged").await.is_err());
}

#[tokio::test]
async fn test_explicit_abort() {
    let slow_cfg = XcopyConfig {
        send_file_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let cluster = cluster_with_live(2, 1, slow_cfg);
    let b1 = Bck::native("b1");
    let b2 = Bck::native("b2");

    // One live target of two: the job will sit in Quiescing until aborted.
    let msg = tco_msg("tco-abort", &b1, &b2, Selection::List(vec![]));
    cluster.engines[0].begin(msg.clone()).await.unwrap();
    cluster.engines[0].commit(&msg.txn_uuid).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match cluster.engines[0].status("tco-abort") {
            Some(s) if s.state == JobState::Quiescing => break,
            Some(_) => {}
            None => {}
        }
        assert!(Instant::now() < deadline, "job never reached quiescing");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cluster.engines[0]
        .abort("tco-abort", "operator request")
        .await
        .unwrap();
    cluster.wait_done("tco-abort", Duration::from_secs(5)).await;
    let snap = cluster.engines[0].status("tco-abort").unwrap();
    assert_eq!(snap.state, JobState::Aborted);
    assert!(snap.err.unwrap().contains("operator request"));
}
