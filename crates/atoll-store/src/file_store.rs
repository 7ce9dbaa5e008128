//! File-based object storage backend.
//!
//! Each mountpath is a directory root. An object lands at
//! `{mountpath}/{provider}/{ns}/{bucket}/{name}` with its attributes in a
//! postcard sidecar next to it. Writes are atomic: data goes to a
//! temporary file first, then is renamed into place, so a crash never
//! leaves a partial object visible.

use std::path::{Path, PathBuf};

use atoll_types::msg::LsoEntry;
use atoll_types::{Bck, ObjAttrs};
use bytes::Bytes;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{mpath_of, ObjectStore, Owt, StoredObject};

const ATTR_SUFFIX: &str = ".attrs";
const TMP_SUFFIX: &str = ".tmp";

/// File-backed object store over one or more mountpath roots.
pub struct FileStore {
    mountpaths: Vec<PathBuf>,
}

impl FileStore {
    /// Create a store over the given mountpath roots (created if absent).
    pub fn new(roots: Vec<PathBuf>) -> Result<Self, StoreError> {
        assert!(!roots.is_empty(), "at least one mountpath required");
        for root in &roots {
            std::fs::create_dir_all(root)?;
        }
        Ok(Self { mountpaths: roots })
    }

    /// Single-mountpath convenience constructor.
    pub fn single(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(vec![root.as_ref().to_path_buf()])
    }

    fn bck_dir(&self, mpath: usize, bck: &Bck) -> PathBuf {
        let ns = if bck.ns.is_empty() { "@global" } else { &bck.ns };
        self.mountpaths[mpath]
            .join(bck.provider.as_str())
            .join(ns)
            .join(&bck.name)
    }

    fn obj_path(&self, bck: &Bck, name: &str) -> PathBuf {
        let mpath = mpath_of(bck, name, self.mountpaths.len());
        self.bck_dir(mpath, bck).join(name)
    }

    /// Collect relative object names under `dir`, skipping sidecars and
    /// in-flight temporaries.
    fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = if rel.is_empty() {
                file_name.clone()
            } else {
                format!("{rel}/{file_name}")
            };
            if entry.file_type()?.is_dir() {
                Self::walk(&entry.path(), &child_rel, out)?;
            } else if !file_name.ends_with(ATTR_SUFFIX) && !file_name.ends_with(TMP_SUFFIX) {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for FileStore {
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
        let path = self.obj_path(bck, name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let attr_path = PathBuf::from(format!("{}{ATTR_SUFFIX}", path.display()));
        let attr_bytes = postcard::to_allocvec(&attrs).map_err(|source| StoreError::BadAttrs {
            name: name.to_string(),
            source,
        })?;
        tokio::fs::write(&attr_path, attr_bytes).await?;

        debug!(obj = %bck.cname(name), size = data.len(), "stored object file");
        Ok(())
    }

    async fn get(&self, bck: &Bck, name: &str) -> Result<Option<StoredObject>, StoreError> {
        let path = self.obj_path(bck, name);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let attrs = self.head(bck, name).await?.unwrap_or_default();
        Ok(Some(StoredObject { data, attrs }))
    }

    async fn head(&self, bck: &Bck, name: &str) -> Result<Option<ObjAttrs>, StoreError> {
        let path = self.obj_path(bck, name);
        let attr_path = PathBuf::from(format!("{}{ATTR_SUFFIX}", path.display()));
        match tokio::fs::read(&attr_path).await {
            Ok(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(|source| StoreError::BadAttrs {
                    name: name.to_string(),
                    source,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Object without a sidecar still counts if the data exists.
                match tokio::fs::metadata(&path).await {
                    Ok(md) => Ok(Some(ObjAttrs {
                        size: md.len() as i64,
                        ..ObjAttrs::default()
                    })),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(StoreError::Io(e)),
                }
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete(&self, bck: &Bck, name: &str) -> Result<bool, StoreError> {
        let path = self.obj_path(bck, name);
        let attr_path = PathBuf::from(format!("{}{ATTR_SUFFIX}", path.display()));
        let _ = tokio::fs::remove_file(&attr_path).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list_mountpath(
        &self,
        mpath: usize,
        bck: &Bck,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        if mpath >= self.mountpaths.len() {
            return Err(StoreError::BadMountpath(mpath));
        }
        let mut names = Vec::new();
        Self::walk(&self.bck_dir(mpath, bck), "", &mut names)?;
        names.retain(|n| n.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    async fn list_page(
        &self,
        bck: &Bck,
        prefix: &str,
        start_after: &str,
        limit: usize,
    ) -> Result<(Vec<LsoEntry>, bool), StoreError> {
        let mut names = Vec::new();
        for mpath in 0..self.mountpaths.len() {
            names.extend(self.list_mountpath(mpath, bck, prefix).await?);
        }
        names.sort();
        names.retain(|n| n.as_str() > start_after);
        let truncated = names.len() > limit;
        names.truncate(limit);

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let attrs = self.head(bck, &name).await?.unwrap_or_default();
            entries.push(LsoEntry {
                size: attrs.size.max(0) as u64,
                atime_ns: attrs.atime_ns,
                checksum: attrs
                    .checksum
                    .as_ref()
                    .map(|c| c.value.clone())
                    .unwrap_or_default(),
                name,
            });
        }
        Ok((entries, truncated))
    }

    async fn utilization(&self, _mpath: usize) -> u8 {
        // Filesystem-level utilization is owned by the blob store proper;
        // the boundary reports zero and lets joggers run unthrottled.
        0
    }

    async fn evict_bucket(&self, bck: &Bck) -> Result<usize, StoreError> {
        let mut removed = 0usize;
        for mpath in 0..self.mountpaths.len() {
            let names = self.list_mountpath(mpath, bck, "").await?;
            removed += names.len();
            let dir = self.bck_dir(mpath, bck);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        Ok(removed)
    }
}
