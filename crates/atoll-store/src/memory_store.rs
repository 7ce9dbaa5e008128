//! In-memory object storage backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use atoll_types::msg::LsoEntry;
use atoll_types::{Bck, ObjAttrs};
use bytes::Bytes;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{mpath_of, ObjectStore, Owt, StoredObject};

/// One simulated mountpath: `full-uname → object`, sorted by name.
type Shard = RwLock<BTreeMap<String, StoredObject>>;

/// In-memory object store sharded over simulated mountpaths.
///
/// Used for testing and for nodes configured to run in memory-only mode.
/// Tracks total bytes stored against a configurable maximum; used bytes
/// are maintained incrementally via an atomic counter.
pub struct MemoryStore {
    mountpaths: Vec<Shard>,
    max_bytes: u64,
    used_bytes: AtomicU64,
}

impl MemoryStore {
    /// Create a store with `num_mountpaths` simulated disks.
    pub fn new(num_mountpaths: usize, max_bytes: u64) -> Self {
        let mountpaths = (0..num_mountpaths.max(1)).map(|_| Shard::default()).collect();
        Self {
            mountpaths,
            max_bytes,
            used_bytes: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, bck: &Bck, name: &str) -> &Shard {
        &self.mountpaths[mpath_of(bck, name, self.mountpaths.len())]
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    fn num_mountpaths(&self) -> usize {
        self.mountpaths.len()
    }

    async fn put(
        &self,
        bck: &Bck,
        name: &str,
        data: Bytes,
        attrs: ObjAttrs,
        _owt: Owt,
    ) -> Result<(), StoreError> {
        let uname = bck.make_uname(name);
        let mut map = self.shard_for(bck, name).write().expect("store lock poisoned");

        let data_len = data.len() as u64;
        let used = self.used_bytes.load(Ordering::Relaxed);
        let existing_len = map.get(&uname).map_or(0, |o| o.data.len() as u64);
        let net_increase = data_len.saturating_sub(existing_len);
        if used + net_increase > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed: net_increase,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        debug!(uname, size = data.len(), "storing object in memory");
        map.insert(uname, StoredObject { data, attrs });
        self.used_bytes
            .store(used - existing_len + data_len, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, bck: &Bck, name: &str) -> Result<Option<StoredObject>, StoreError> {
        let map = self.shard_for(bck, name).read().expect("store lock poisoned");
        Ok(map.get(&bck.make_uname(name)).cloned())
    }

    async fn head(&self, bck: &Bck, name: &str) -> Result<Option<ObjAttrs>, StoreError> {
        let map = self.shard_for(bck, name).read().expect("store lock poisoned");
        Ok(map.get(&bck.make_uname(name)).map(|o| o.attrs.clone()))
    }

    async fn delete(&self, bck: &Bck, name: &str) -> Result<bool, StoreError> {
        let mut map = self.shard_for(bck, name).write().expect("store lock poisoned");
        match map.remove(&bck.make_uname(name)) {
            Some(removed) => {
                self.used_bytes
                    .fetch_sub(removed.data.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_mountpath(
        &self,
        mpath: usize,
        bck: &Bck,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        let shard = self
            .mountpaths
            .get(mpath)
            .ok_or(StoreError::BadMountpath(mpath))?;
        let map = shard.read().expect("store lock poisoned");
        let bck_prefix = bck.bck_uname();
        Ok(map
            .range(bck_prefix.clone()..)
            .take_while(|(uname, _)| uname.starts_with(&bck_prefix))
            .map(|(uname, _)| uname[bck_prefix.len()..].to_string())
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn list_page(
        &self,
        bck: &Bck,
        prefix: &str,
        start_after: &str,
        limit: usize,
    ) -> Result<(Vec<LsoEntry>, bool), StoreError> {
        let bck_prefix = bck.bck_uname();
        let mut entries: Vec<LsoEntry> = Vec::new();
        for shard in &self.mountpaths {
            let map = shard.read().expect("store lock poisoned");
            for (uname, obj) in map.range(bck_prefix.clone()..) {
                if !uname.starts_with(&bck_prefix) {
                    break;
                }
                let name = &uname[bck_prefix.len()..];
                if !name.starts_with(prefix) || name <= start_after {
                    continue;
                }
                entries.push(LsoEntry {
                    name: name.to_string(),
                    size: obj.data.len() as u64,
                    atime_ns: obj.attrs.atime_ns,
                    checksum: obj
                        .attrs
                        .checksum
                        .as_ref()
                        .map(|c| c.value.clone())
                        .unwrap_or_default(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let truncated = entries.len() > limit;
        entries.truncate(limit);
        Ok((entries, truncated))
    }

    async fn utilization(&self, _mpath: usize) -> u8 {
        let used = self.used_bytes.load(Ordering::Relaxed);
        if self.max_bytes == 0 {
            return 0;
        }
        ((used.saturating_mul(100)) / self.max_bytes).min(100) as u8
    }

    async fn evict_bucket(&self, bck: &Bck) -> Result<usize, StoreError> {
        let bck_prefix = bck.bck_uname();
        let mut removed = 0usize;
        for shard in &self.mountpaths {
            let mut map = shard.write().expect("store lock poisoned");
            let doomed: Vec<String> = map
                .range(bck_prefix.clone()..)
                .take_while(|(uname, _)| uname.starts_with(&bck_prefix))
                .map(|(uname, _)| uname.clone())
                .collect();
            for uname in doomed {
                if let Some(obj) = map.remove(&uname) {
                    self.used_bytes
                        .fetch_sub(obj.data.len() as u64, Ordering::Relaxed);
                    removed += 1;
                }
            }
        }
        debug!(bck = %bck, removed, "evicted bucket data");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(size: i64) -> ObjAttrs {
        ObjAttrs {
            size,
            atime_ns: 1,
            checksum: None,
            custom: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryStore::new(4, 1 << 20);
        let bck = Bck::native("b1");
        store
            .put(&bck, "a/1", Bytes::from_static(b"hello"), attrs(5), Owt::Put)
            .await
            .unwrap();

        let obj = store.get(&bck, "a/1").await.unwrap().unwrap();
        assert_eq!(&obj.data[..], b"hello");
        assert!(store.get(&bck, "a/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_absence() {
        let store = MemoryStore::new(2, 1 << 20);
        let bck = Bck::native("b1");
        store
            .put(&bck, "k", Bytes::from_static(b"x"), attrs(1), Owt::Put)
            .await
            .unwrap();
        assert!(store.delete(&bck, "k").await.unwrap());
        assert!(!store.delete(&bck, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let store = MemoryStore::new(1, 8);
        let bck = Bck::native("b1");
        let err = store
            .put(&bck, "big", Bytes::from(vec![0u8; 16]), attrs(16), Owt::Put)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn test_list_page_sorted_and_paged() {
        let store = MemoryStore::new(4, 1 << 20);
        let bck = Bck::native("b1");
        for i in 0..10 {
            store
                .put(
                    &bck,
                    &format!("k/{i:02}"),
                    Bytes::from_static(b"v"),
                    attrs(1),
                    Owt::Put,
                )
                .await
                .unwrap();
        }

        let (page1, more) = store.list_page(&bck, "k/", "", 4).await.unwrap();
        assert!(more);
        assert_eq!(
            page1.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["k/00", "k/01", "k/02", "k/03"]
        );

        let (page2, more) = store.list_page(&bck, "k/", "k/03", 100).await.unwrap();
        assert!(!more);
        assert_eq!(page2.len(), 6);
        assert_eq!(page2[0].name, "k/04");
    }

    #[tokio::test]
    async fn test_mountpath_listing_partitions_names() {
        let store = MemoryStore::new(3, 1 << 20);
        let bck = Bck::native("b1");
        for i in 0..30 {
            store
                .put(
                    &bck,
                    &format!("o-{i}"),
                    Bytes::from_static(b"v"),
                    attrs(1),
                    Owt::Put,
                )
                .await
                .unwrap();
        }

        let mut total = 0;
        for mp in 0..store.num_mountpaths() {
            let names = store.list_mountpath(mp, &bck, "").await.unwrap();
            for name in &names {
                assert_eq!(mpath_of(&bck, name, 3), mp);
            }
            total += names.len();
        }
        assert_eq!(total, 30);
    }

    #[tokio::test]
    async fn test_evict_bucket_only_touches_that_bucket() {
        let store = MemoryStore::new(2, 1 << 20);
        let b1 = Bck::native("b1");
        let b2 = Bck::native("b2");
        for i in 0..5 {
            let name = format!("k{i}");
            store
                .put(&b1, &name, Bytes::from_static(b"x"), attrs(1), Owt::Put)
                .await
                .unwrap();
            store
                .put(&b2, &name, Bytes::from_static(b"x"), attrs(1), Owt::Put)
                .await
                .unwrap();
        }

        assert_eq!(store.evict_bucket(&b1).await.unwrap(), 5);
        assert!(store.get(&b1, "k0").await.unwrap().is_none());
        assert!(store.get(&b2, "k0").await.unwrap().is_some());
    }
}
