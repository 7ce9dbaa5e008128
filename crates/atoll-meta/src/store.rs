//! [`MetaCache`] implementation with fjall (disk) and in-memory backends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use atoll_types::{Bmd, NodeId, Smap};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

const KEY_SMAP: &str = "smap";
const KEY_BMD: &str = "bmd";
const KEY_NODE_ID: &str = "node-id";

/// Inner backend: fjall-backed (disk) or pure in-memory.
enum Backend {
    Fjall {
        #[allow(dead_code)]
        keyspace: Keyspace,
        snapshots: PartitionHandle,
    },
    Memory(RwLock<HashMap<&'static str, Vec<u8>>>),
}

/// Cached cluster metadata, persisted across restarts.
pub struct MetaCache {
    backend: Backend,
}

impl MetaCache {
    /// Open a persistent cache at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let snapshots =
            keyspace.open_partition("snapshots", PartitionCreateOptions::default())?;
        Ok(Self {
            backend: Backend::Fjall {
                keyspace,
                snapshots,
            },
        })
    }

    /// Pure in-memory cache (tests, `--memory` mode).
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
        }
    }

    fn put_raw(&self, key: &'static str, value: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Fjall { snapshots, .. } => {
                snapshots.insert(key, value)?;
            }
            Backend::Memory(map) => {
                map.write().expect("meta lock poisoned").insert(key, value.to_vec());
            }
        }
        Ok(())
    }

    fn get_raw(&self, key: &'static str) -> Result<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Fjall { snapshots, .. } => {
                Ok(snapshots.get(key)?.map(|slice| slice.to_vec()))
            }
            Backend::Memory(map) => Ok(map
                .read()
                .expect("meta lock poisoned")
                .get(key)
                .cloned()),
        }
    }

    fn put_value<T: Serialize>(&self, key: &'static str, value: &T) -> Result<()> {
        let bytes = postcard::to_allocvec(value).map_err(MetaError::Encode)?;
        self.put_raw(key, &bytes)
    }

    fn get_value<T: DeserializeOwned>(&self, key: &'static str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(|source| MetaError::Decode { key, source }),
            None => Ok(None),
        }
    }

    /// Persist an installed cluster-map snapshot.
    pub fn put_smap(&self, smap: &Smap) -> Result<()> {
        debug!(version = smap.version, "caching smap");
        self.put_value(KEY_SMAP, smap)
    }

    /// Latest cached cluster map, if any.
    pub fn get_smap(&self) -> Result<Option<Smap>> {
        self.get_value(KEY_SMAP)
    }

    /// Persist an installed bucket-metadata snapshot.
    pub fn put_bmd(&self, bmd: &Bmd) -> Result<()> {
        debug!(version = bmd.version, "caching bmd");
        self.put_value(KEY_BMD, bmd)
    }

    /// Latest cached bucket metadata, if any.
    pub fn get_bmd(&self) -> Result<Option<Bmd>> {
        self.get_value(KEY_BMD)
    }

    /// Persist this node's identity (assigned once, never reused).
    pub fn put_node_id(&self, id: &NodeId) -> Result<()> {
        self.put_raw(KEY_NODE_ID, id.as_str().as_bytes())
    }

    /// This node's identity from a previous run, if any.
    pub fn get_node_id(&self) -> Result<Option<NodeId>> {
        Ok(self
            .get_raw(KEY_NODE_ID)?
            .map(|bytes| NodeId::new(String::from_utf8_lossy(&bytes).into_owned())))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use atoll_types::{Node, NodeRole, NodeState};

    use super::*;

    fn sample_smap() -> Smap {
        let primary = Node {
            id: NodeId::from("p-1"),
            role: NodeRole::Proxy,
            pub_urls: vec!["http://p1:8080".to_string()],
            intra_url: "http://p1:9080".to_string(),
            mover_id: None,
            mover_addrs: vec![],
            state: NodeState::Active,
        };
        Smap::initial(primary)
    }

    #[test]
    fn test_memory_smap_roundtrip() {
        let cache = MetaCache::in_memory();
        assert!(cache.get_smap().unwrap().is_none());

        let smap = sample_smap();
        cache.put_smap(&smap).unwrap();
        assert_eq!(cache.get_smap().unwrap().unwrap(), smap);
    }

    #[test]
    fn test_memory_bmd_roundtrip() {
        let cache = MetaCache::in_memory();
        let bmd = Bmd {
            version: 7,
            buckets: BTreeMap::new(),
        };
        cache.put_bmd(&bmd).unwrap();
        assert_eq!(cache.get_bmd().unwrap().unwrap().version, 7);
    }

    #[test]
    fn test_node_id_roundtrip() {
        let cache = MetaCache::in_memory();
        assert!(cache.get_node_id().unwrap().is_none());
        cache.put_node_id(&NodeId::from("t-abc123")).unwrap();
        assert_eq!(cache.get_node_id().unwrap().unwrap().as_str(), "t-abc123");
    }

    #[test]
    fn test_fjall_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let smap = sample_smap();
        {
            let cache = MetaCache::open(dir.path()).unwrap();
            cache.put_smap(&smap).unwrap();
            cache.put_node_id(&NodeId::from("p-1")).unwrap();
        }
        let cache = MetaCache::open(dir.path()).unwrap();
        assert_eq!(cache.get_smap().unwrap().unwrap(), smap);
        assert_eq!(cache.get_node_id().unwrap().unwrap().as_str(), "p-1");
    }
}
