//! Versioned cluster-map ownership.

use std::sync::Arc;

use arc_swap::ArcSwap;
use atoll_types::{Node, NodeId, NodeState, Smap};
use tracing::{info, warn};

use crate::error::ClusterError;

/// Snapshot owner of the cluster map.
///
/// Readers call [`SmapOwner::get`] and keep the returned `Arc` for the
/// duration of a request; they never observe a half-applied transition.
/// Mutating methods are only meaningful on the primary; every other node
/// installs broadcast snapshots via [`SmapOwner::install`].
pub struct SmapOwner {
    inner: ArcSwap<Smap>,
}

impl SmapOwner {
    pub fn new(smap: Smap) -> Self {
        Self {
            inner: ArcSwap::from_pointee(smap),
        }
    }

    /// Atomic snapshot of the current map.
    pub fn get(&self) -> Arc<Smap> {
        self.inner.load_full()
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    /// Install a broadcast snapshot. Versions are monotone: a regression
    /// (or replay of the current version) is rejected and the installed
    /// map stays untouched.
    pub fn install(&self, offered: Smap) -> Result<(), ClusterError> {
        let current = self.inner.load();
        if offered.version <= current.version {
            warn!(
                current = current.version,
                offered = offered.version,
                "rejecting smap regression"
            );
            return Err(ClusterError::VersionRegression {
                kind: "smap",
                current: current.version,
                offered: offered.version,
            });
        }
        info!(from = current.version, to = offered.version, "installing smap");
        self.inner.store(Arc::new(offered));
        Ok(())
    }

    /// Primary: add (or re-add) a node and publish the next version.
    pub fn add_node(&self, node: Node) -> Arc<Smap> {
        let mut next = Smap::clone(&self.inner.load());
        next.version += 1;
        info!(node = %node.id, role = ?node.role, version = next.version, "smap: node joined");
        match node.role {
            atoll_types::NodeRole::Proxy => {
                next.pmap.insert(node.id.clone(), node);
            }
            atoll_types::NodeRole::Target => {
                next.tmap.insert(node.id.clone(), node);
            }
        }
        let next = Arc::new(next);
        self.inner.store(next.clone());
        next
    }

    /// Primary: remove a node and publish the next version.
    pub fn remove_node(&self, id: &NodeId) -> Arc<Smap> {
        let mut next = Smap::clone(&self.inner.load());
        next.version += 1;
        next.pmap.remove(id);
        next.tmap.remove(id);
        info!(node = %id, version = next.version, "smap: node removed");
        let next = Arc::new(next);
        self.inner.store(next.clone());
        next
    }

    /// Primary: mark a node under maintenance and publish the next version.
    pub fn set_maintenance(&self, id: &NodeId) -> Arc<Smap> {
        let mut next = Smap::clone(&self.inner.load());
        next.version += 1;
        if let Some(node) = next.tmap.get_mut(id).or_else(|| next.pmap.get_mut(id)) {
            node.state = NodeState::Maintenance;
        }
        let next = Arc::new(next);
        self.inner.store(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use atoll_types::NodeRole;

    use super::*;

    fn node(id: &str, role: NodeRole) -> Node {
        Node {
            id: NodeId::from(id),
            role,
            pub_urls: vec![format!("http://{id}:8080")],
            intra_url: format!("http://{id}:9080"),
            mover_id: None,
            mover_addrs: vec![],
            state: NodeState::Active,
        }
    }

    #[test]
    fn test_versions_strictly_increase() {
        let owner = SmapOwner::new(Smap::initial(node("p-1", NodeRole::Proxy)));
        assert_eq!(owner.version(), 1);
        owner.add_node(node("t-1", NodeRole::Target));
        assert_eq!(owner.version(), 2);
        owner.remove_node(&NodeId::from("t-1"));
        assert_eq!(owner.version(), 3);
    }

    #[test]
    fn test_install_rejects_regression() {
        let owner = SmapOwner::new(Smap::initial(node("p-1", NodeRole::Proxy)));
        owner.add_node(node("t-1", NodeRole::Target)); // v2

        let stale = Smap::initial(node("p-1", NodeRole::Proxy)); // v1
        assert!(matches!(
            owner.install(stale),
            Err(ClusterError::VersionRegression { current: 2, offered: 1, .. })
        ));
        assert_eq!(owner.version(), 2);

        let mut newer = Smap::clone(&owner.get());
        newer.version = 5;
        owner.install(newer).unwrap();
        assert_eq!(owner.version(), 5);
    }

    #[test]
    fn test_readers_see_consistent_snapshot() {
        let owner = SmapOwner::new(Smap::initial(node("p-1", NodeRole::Proxy)));
        let snapshot = owner.get();
        owner.add_node(node("t-1", NodeRole::Target));
        // The old snapshot is unchanged; a fresh read sees the new node.
        assert_eq!(snapshot.count_active_targets(), 0);
        assert_eq!(owner.get().count_active_targets(), 1);
    }

    #[test]
    fn test_maintenance_excluded_from_active() {
        let owner = SmapOwner::new(Smap::initial(node("p-1", NodeRole::Proxy)));
        owner.add_node(node("t-1", NodeRole::Target));
        owner.set_maintenance(&NodeId::from("t-1"));
        assert_eq!(owner.get().count_active_targets(), 0);
        assert_eq!(owner.get().tmap.len(), 1);
    }
}
