//! Versioned bucket-metadata ownership.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use atoll_types::clock::MonoClock;
use atoll_types::{Bck, BckEntry, BckProps, Bmd};
use tracing::{info, warn};

use crate::error::ClusterError;

/// Outcome of a create-bucket request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The bucket already existed; creating it again is a semantic no-op.
    AlreadyExists,
}

/// Snapshot owner of the bucket metadata.
///
/// Same publication discipline as the cluster map: single writer (the
/// primary), snapshot readers, strictly increasing versions. Bucket IDs
/// are unique and stable: a monotonically increasing counter seeded
/// above any ID seen so far.
pub struct BmdOwner {
    inner: ArcSwap<Bmd>,
    next_bid: AtomicU64,
    clock: MonoClock,
}

impl BmdOwner {
    pub fn new(bmd: Bmd) -> Self {
        let max_bid = bmd.buckets.values().map(|e| e.props.bid).max().unwrap_or(0);
        Self {
            inner: ArcSwap::from_pointee(bmd),
            next_bid: AtomicU64::new(max_bid + 1),
            clock: MonoClock::new(),
        }
    }

    /// Atomic snapshot of the current metadata.
    pub fn get(&self) -> Arc<Bmd> {
        self.inner.load_full()
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    /// Install a broadcast snapshot; versions are monotone.
    pub fn install(&self, offered: Bmd) -> Result<(), ClusterError> {
        let current = self.inner.load();
        if offered.version <= current.version {
            warn!(
                current = current.version,
                offered = offered.version,
                "rejecting bmd regression"
            );
            return Err(ClusterError::VersionRegression {
                kind: "bmd",
                current: current.version,
                offered: offered.version,
            });
        }
        let max_bid = offered.buckets.values().map(|e| e.props.bid).max().unwrap_or(0);
        self.next_bid.fetch_max(max_bid + 1, Ordering::SeqCst);
        self.inner.store(Arc::new(offered));
        Ok(())
    }

    /// Primary: create a bucket. Creating an existing bucket succeeds as
    /// a no-op: the caller cannot tell the difference and PUT-bucket is
    /// idempotent on the wire.
    pub fn create_bucket(&self, bck: &Bck, mut props: BckProps) -> (CreateOutcome, Arc<Bmd>) {
        let current = self.inner.load_full();
        if current.get(bck).is_some() {
            return (CreateOutcome::AlreadyExists, current);
        }
        props.bid = self.next_bid.fetch_add(1, Ordering::SeqCst);
        props.created_ns = self.clock.tick();

        let mut next = Bmd::clone(&current);
        next.version += 1;
        next.buckets.insert(
            bck.bck_uname(),
            BckEntry {
                bck: bck.clone(),
                props,
            },
        );
        info!(bck = %bck, version = next.version, "bmd: bucket created");
        let next = Arc::new(next);
        self.inner.store(next.clone());
        (CreateOutcome::Created, next)
    }

    /// Primary: destroy a bucket. Destroying a bucket that is already
    /// gone (including one lost to a concurrent destroy) is success.
    pub fn destroy_bucket(&self, bck: &Bck) -> (bool, Arc<Bmd>) {
        let current = self.inner.load_full();
        if current.get(bck).is_none() {
            return (false, current);
        }
        let mut next = Bmd::clone(&current);
        next.version += 1;
        next.buckets.remove(&bck.bck_uname());
        info!(bck = %bck, version = next.version, "bmd: bucket destroyed");
        let next = Arc::new(next);
        self.inner.store(next.clone());
        (true, next)
    }

    /// Primary: update bucket properties through a closure over a clone.
    pub fn set_bprops(
        &self,
        bck: &Bck,
        update: impl FnOnce(&mut BckProps),
    ) -> Result<Arc<Bmd>, ClusterError> {
        let current = self.inner.load_full();
        let mut next = Bmd::clone(&current);
        let entry = next
            .buckets
            .get_mut(&bck.bck_uname())
            .ok_or_else(|| ClusterError::BucketNotFound(bck.to_string()))?;
        update(&mut entry.props);
        next.version += 1;
        info!(bck = %bck, version = next.version, "bmd: props updated");
        let next = Arc::new(next);
        self.inner.store(next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assigns_unique_stable_bids() {
        let owner = BmdOwner::new(Bmd::default());
        let (o1, _) = owner.create_bucket(&Bck::native("a"), BckProps::default());
        let (o2, bmd) = owner.create_bucket(&Bck::native("b"), BckProps::default());
        assert_eq!(o1, CreateOutcome::Created);
        assert_eq!(o2, CreateOutcome::Created);

        let bid_a = bmd.get(&Bck::native("a")).unwrap().props.bid;
        let bid_b = bmd.get(&Bck::native("b")).unwrap().props.bid;
        assert_ne!(bid_a, bid_b);
    }

    #[test]
    fn test_create_twice_is_noop_success() {
        let owner = BmdOwner::new(Bmd::default());
        let (_, v_after_first) = owner.create_bucket(&Bck::native("a"), BckProps::default());
        let first_version = v_after_first.version;
        let (outcome, v_after_second) = owner.create_bucket(&Bck::native("a"), BckProps::default());
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
        assert_eq!(v_after_second.version, first_version, "no-op must not bump");
    }

    #[test]
    fn test_destroy_idempotent() {
        let owner = BmdOwner::new(Bmd::default());
        owner.create_bucket(&Bck::native("a"), BckProps::default());
        let (existed, _) = owner.destroy_bucket(&Bck::native("a"));
        assert!(existed);
        let (existed, _) = owner.destroy_bucket(&Bck::native("a"));
        assert!(!existed); // still success from the caller's perspective
    }

    #[test]
    fn test_set_bprops_bumps_version() {
        let owner = BmdOwner::new(Bmd::default());
        owner.create_bucket(&Bck::native("a"), BckProps::default());
        let before = owner.version();
        let bmd = owner
            .set_bprops(&Bck::native("a"), |p| p.versioning.enabled = true)
            .unwrap();
        assert_eq!(bmd.version, before + 1);
        assert!(bmd.get(&Bck::native("a")).unwrap().props.versioning.enabled);
    }

    #[test]
    fn test_set_bprops_missing_bucket() {
        let owner = BmdOwner::new(Bmd::default());
        assert!(matches!(
            owner.set_bprops(&Bck::native("nope"), |_| {}),
            Err(ClusterError::BucketNotFound(_))
        ));
    }

    #[test]
    fn test_install_monotone_and_bid_floor() {
        let owner = BmdOwner::new(Bmd::default());
        let mut offered = Bmd::default();
        offered.version = 9;
        offered.buckets.insert(
            Bck::native("x").bck_uname(),
            BckEntry {
                bck: Bck::native("x"),
                props: BckProps {
                    bid: 77,
                    ..BckProps::default()
                },
            },
        );
        owner.install(offered).unwrap();

        // New buckets must not reuse an installed bid.
        let (_, bmd) = owner.create_bucket(&Bck::native("y"), BckProps::default());
        assert!(bmd.get(&Bck::native("y")).unwrap().props.bid > 77);

        let stale = Bmd::default();
        assert!(owner.install(stale).is_err());
    }
}
