//! Per-job work items and the pending map.
//!
//! A [`WorkItem`] lives from job begin until every peer has signaled
//! "done" (or the job aborts). It holds the immutable job message, the
//! remaining-ack counter, the abort channel, and the job's error sink;
//! the first non-suppressed error becomes the job's public result.

use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use atoll_types::clock::wall_nanos;
use atoll_types::msg::TcoMsg;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of a job on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Begin,
    Running,
    Quiescing,
    Done,
    Aborted,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobState::Begin,
            1 => JobState::Running,
            2 => JobState::Quiescing,
            3 => JobState::Done,
            _ => JobState::Aborted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JobState::Begin => 0,
            JobState::Running => 1,
            JobState::Quiescing => 2,
            JobState::Done => 3,
            JobState::Aborted => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Aborted)
    }
}

/// Per-job, per-target state.
pub struct WorkItem {
    pub msg: TcoMsg,
    /// Number of peer targets that still owe this target a "done".
    /// Set to (active targets − 1) at first dispatch.
    refc: AtomicI32,
    state: AtomicU8,
    /// Wall nanoseconds of the last receive activity; drives quiescence.
    rx_last: AtomicU64,
    /// First non-suppressed error; the job's public result.
    err: Mutex<Option<String>>,
    err_cnt: AtomicU64,
    abort_tx: watch::Sender<bool>,
    abort_rx: watch::Receiver<bool>,
    /// True when destination names equal source names and both buckets
    /// are the same; lets the engine skip copy-onto-itself no-ops.
    pub sync_same_name: bool,

    // Progress counters.
    pub n_copied: AtomicU64,
    pub n_sent: AtomicU64,
    pub n_received: AtomicU64,
    pub n_skipped: AtomicU64,
    pub bytes_moved: AtomicU64,
}

impl WorkItem {
    pub fn new(msg: TcoMsg) -> Self {
        let sync_same_name = msg.bck_from == msg.bck_to && msg.xform.is_identity();
        let (abort_tx, abort_rx) = watch::channel(false);
        Self {
            msg,
            refc: AtomicI32::new(0),
            state: AtomicU8::new(JobState::Begin.as_u8()),
            rx_last: AtomicU64::new(wall_nanos()),
            err: Mutex::new(None),
            err_cnt: AtomicU64::new(0),
            abort_tx,
            abort_rx,
            sync_same_name,
            n_copied: AtomicU64::new(0),
            n_sent: AtomicU64::new(0),
            n_received: AtomicU64::new(0),
            n_skipped: AtomicU64::new(0),
            bytes_moved: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: JobState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Arm the counter with the number of peers that owe a "done".
    /// Adds rather than stores: a peer that finished before this target
    /// dispatched has already driven the counter negative, and its early
    /// "done" must not be lost.
    pub fn arm_refc(&self, peers: i32) -> i32 {
        self.refc.fetch_add(peers, Ordering::SeqCst) + peers
    }

    pub fn refc(&self) -> i32 {
        self.refc.load(Ordering::SeqCst)
    }

    /// Decrement on a received "done".
    pub fn dec_refc(&self) -> i32 {
        self.refc.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn touch_rx(&self) {
        self.rx_last.store(wall_nanos(), Ordering::SeqCst);
    }

    /// Nanoseconds since the last receive activity.
    pub fn rx_idle_ns(&self) -> u64 {
        wall_nanos().saturating_sub(self.rx_last.load(Ordering::SeqCst))
    }

    /// Record an error. The first one sticks as the job's result.
    pub fn add_err(&self, err: impl ToString) {
        self.err_cnt.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.err.lock().expect("err sink poisoned");
        if slot.is_none() {
            *slot = Some(err.to_string());
        }
    }

    pub fn err(&self) -> Option<String> {
        self.err.lock().expect("err sink poisoned").clone()
    }

    pub fn err_cnt(&self) -> u64 {
        self.err_cnt.load(Ordering::SeqCst)
    }

    /// Signal abort to every worker blocked in the job.
    pub fn abort(&self, reason: impl ToString) {
        self.add_err(reason);
        let _ = self.abort_tx.send(true);
    }

    pub fn aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    pub fn abort_watch(&self) -> watch::Receiver<bool> {
        self.abort_rx.clone()
    }

    /// Status snapshot for control-plane queries.
    pub fn snap(&self) -> JobSnap {
        JobSnap {
            uuid: self.msg.txn_uuid.clone(),
            state: self.state(),
            refc: self.refc(),
            n_copied: self.n_copied.load(Ordering::Relaxed),
            n_sent: self.n_sent.load(Ordering::Relaxed),
            n_received: self.n_received.load(Ordering::Relaxed),
            n_skipped: self.n_skipped.load(Ordering::Relaxed),
            bytes_moved: self.bytes_moved.load(Ordering::Relaxed),
            err: self.err(),
        }
    }
}

/// Serializable job status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnap {
    pub uuid: String,
    pub state: JobState,
    pub refc: i32,
    pub n_copied: u64,
    pub n_sent: u64,
    pub n_received: u64,
    pub n_skipped: u64,
    pub bytes_moved: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[cfg(test)]
mod tests {
    use atoll_types::msg::{NameXform, Selection};
    use atoll_types::Bck;

    use super::*;

    fn msg(from: &str, to: &str, prepend: &str) -> TcoMsg {
        TcoMsg {
            txn_uuid: "tco-test".to_string(),
            bck_from: Bck::native(from),
            bck_to: Bck::native(to),
            selection: Selection::Prefix(String::new()),
            xform: NameXform {
                prepend: prepend.to_string(),
                ..NameXform::default()
            },
            dry_run: false,
            continue_on_error: false,
            etl: None,
            dst_was_created: false,
        }
    }

    #[test]
    fn test_refc_counts_down() {
        let wi = WorkItem::new(msg("a", "b", ""));
        assert_eq!(wi.arm_refc(2), 2);
        assert_eq!(wi.dec_refc(), 1);
        assert_eq!(wi.dec_refc(), 0);
    }

    #[test]
    fn test_early_done_not_lost() {
        let wi = WorkItem::new(msg("a", "b", ""));
        // A fast peer's "done" lands before the local dispatch arms.
        assert_eq!(wi.dec_refc(), -1);
        assert_eq!(wi.arm_refc(2), 1);
        assert_eq!(wi.dec_refc(), 0);
    }

    #[test]
    fn test_first_error_sticks() {
        let wi = WorkItem::new(msg("a", "b", ""));
        wi.add_err("first");
        wi.add_err("second");
        assert_eq!(wi.err().as_deref(), Some("first"));
        assert_eq!(wi.err_cnt(), 2);
    }

    #[test]
    fn test_abort_observable_by_watchers() {
        let wi = WorkItem::new(msg("a", "b", ""));
        let watch = wi.abort_watch();
        assert!(!*watch.borrow());
        wi.abort("stop");
        assert!(*watch.borrow());
        assert!(wi.aborted());
    }

    #[test]
    fn test_sync_same_name_disabled_by_prepend() {
        assert!(WorkItem::new(msg("a", "a", "")).sync_same_name);
        assert!(!WorkItem::new(msg("a", "a", "pfx/")).sync_same_name);
        assert!(!WorkItem::new(msg("a", "b", "")).sync_same_name);
    }

    #[test]
    fn test_state_transitions() {
        let wi = WorkItem::new(msg("a", "b", ""));
        assert_eq!(wi.state(), JobState::Begin);
        wi.set_state(JobState::Running);
        wi.set_state(JobState::Quiescing);
        assert!(!wi.state().is_terminal());
        wi.set_state(JobState::Done);
        assert!(wi.state().is_terminal());
    }
}
