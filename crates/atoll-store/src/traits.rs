//! Core trait and types for object storage on a target.

use atoll_types::msg::LsoEntry;
use atoll_types::{Bck, ObjAttrs};
use bytes::Bytes;

use crate::error::StoreError;

/// Object-write type: how the store should treat the committed object
/// with respect to a remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owt {
    /// A new object is being created at this destination; if the bucket
    /// is backed by a remote provider, the owner persists it to the
    /// backend after (and only after) the local commit finalizes.
    Put,
}

/// A stored object: payload plus attributes.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub attrs: ObjAttrs,
}

/// Deterministic mountpath assignment for an object within a target.
///
/// Objects are spread over the target's mountpaths (disks) by name hash;
/// the transform-copy jogger runs one worker per mountpath, each visiting
/// only its own objects.
pub fn mpath_of(bck: &Bck, name: &str, num_mountpaths: usize) -> usize {
    debug_assert!(num_mountpaths > 0);
    let uname = bck.make_uname(name);
    let hash = blake3::hash(uname.as_bytes());
    let bytes: [u8; 8] = hash.as_bytes()[..8].try_into().expect("8 bytes");
    (u64::from_le_bytes(bytes) % num_mountpaths as u64) as usize
}

/// Trait for storing and retrieving whole objects on a target.
///
/// Commits are at-most-once from the caller's perspective: a `put` either
/// fully replaces the object (atomic rename / map insert) or fails
/// without leaving a partial object behind.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Number of mountpaths (disks) backing this store. Always ≥ 1.
    fn num_mountpaths(&self) -> usize;

    /// Store an object. Replaces any previous version atomically.
    async fn put(
        &self,
        bck: &Bck,
        name: &str,
        data: Bytes,
        attrs: ObjAttrs,
        owt: Owt,
    ) -> Result<(), StoreError>;

    /// Retrieve an object. Returns `None` if not found.
    async fn get(&self, bck: &Bck, name: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Retrieve attributes only.
    async fn head(&self, bck: &Bck, name: &str) -> Result<Option<ObjAttrs>, StoreError>;

    /// Delete an object. Returns `false` when it was already absent.
    async fn delete(&self, bck: &Bck, name: &str) -> Result<bool, StoreError>;

    /// Names of the objects of `bck` on one mountpath, sorted, filtered
    /// by prefix. The jogger's per-mountpath iteration primitive.
    async fn list_mountpath(
        &self,
        mpath: usize,
        bck: &Bck,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// One sorted page of a bucket listing across all mountpaths:
    /// entries with `name > start_after` matching `prefix`, up to
    /// `limit`, plus a flag telling whether more remain.
    async fn list_page(
        &self,
        bck: &Bck,
        prefix: &str,
        start_after: &str,
        limit: usize,
    ) -> Result<(Vec<LsoEntry>, bool), StoreError>;

    /// Disk utilization of one mountpath, percent. Joggers back off when
    /// this is high.
    async fn utilization(&self, mpath: usize) -> u8;

    /// Drop all local objects of a bucket (bucket destroy / job cleanup).
    /// Returns the number of objects removed.
    async fn evict_bucket(&self, bck: &Bck) -> Result<usize, StoreError>;
}
