// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blob storage capability for the pipeline.
//!
//! The core is agnostic to transport: `get` must produce a byte-exact copy of
//! whatever was stored under the key, and `put` must be atomic (readers see
//! either the full object or none).  [`FsBlobStore`] backs keys with a local
//! directory tree; [`MemoryBlobStore`] is the test double.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tour_core::BlobKey;
use tour_error::{PipelineError, Result};

/// Opaque storage capability: fetch a key to a local path, publish a local
/// path under a key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Copy the object stored under `key` to `dest`, byte-exact.
    async fn get(&self, key: &BlobKey, dest: &Path) -> Result<()>;

    /// Publish the file at `src` under `key`, atomically.
    async fn put(&self, src: &Path, key: &BlobKey) -> Result<()>;

    /// Whether an object exists under `key`.
    async fn exists(&self, key: &BlobKey) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Filesystem implementation
// ---------------------------------------------------------------------------

/// Blob store backed by a local directory; keys map to relative paths.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`.  The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.as_str())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &BlobKey, dest: &Path) -> Result<()> {
        let src = self.object_path(key);
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(PipelineError::io(
                "BLOB_GET_MISSING",
                format!("no object stored under {key}"),
            )
            .with_context("key", key.as_str()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::io("BLOB_GET_FAILED", "could not create destination directory")
                    .with_source(e)
            })?;
        }
        tokio::fs::copy(&src, dest).await.map_err(|e| {
            PipelineError::io("BLOB_GET_FAILED", format!("copy {key} to {}", dest.display()))
                .with_source(e)
        })?;
        Ok(())
    }

    async fn put(&self, src: &Path, key: &BlobKey) -> Result<()> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::io("BLOB_PUT_FAILED", "could not create object directory")
                    .with_source(e)
            })?;
        }

        // Stage next to the final path, then rename: readers never observe a
        // partially written object.
        let tmp = dest.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
        tokio::fs::copy(src, &tmp).await.map_err(|e| {
            PipelineError::io("BLOB_PUT_FAILED", format!("stage {} for {key}", src.display()))
                .with_source(e)
        })?;
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(
                PipelineError::io("BLOB_PUT_FAILED", format!("publish {key}")).with_source(e)
            );
        }
        Ok(())
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(key))
            .await
            .unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory blob store for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly from bytes.
    pub fn insert_bytes(&self, key: &BlobKey, bytes: impl Into<Vec<u8>>) {
        let mut objects = self.objects.lock().expect("blob lock poisoned");
        objects.insert(key.as_str().to_string(), bytes.into());
    }

    /// Read an object's bytes back out, if present.
    pub fn get_bytes(&self, key: &BlobKey) -> Option<Vec<u8>> {
        let objects = self.objects.lock().expect("blob lock poisoned");
        objects.get(key.as_str()).cloned()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("blob lock poisoned").len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &BlobKey, dest: &Path) -> Result<()> {
        let bytes = self.get_bytes(key).ok_or_else(|| {
            PipelineError::io("BLOB_GET_MISSING", format!("no object stored under {key}"))
                .with_context("key", key.as_str())
        })?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::io("BLOB_GET_FAILED", "could not create destination directory")
                    .with_source(e)
            })?;
        }
        tokio::fs::write(dest, bytes).await.map_err(|e| {
            PipelineError::io("BLOB_GET_FAILED", format!("write {}", dest.display()))
                .with_source(e)
        })?;
        Ok(())
    }

    async fn put(&self, src: &Path, key: &BlobKey) -> Result<()> {
        let bytes = tokio::fs::read(src).await.map_err(|e| {
            PipelineError::io("BLOB_PUT_FAILED", format!("read {}", src.display())).with_source(e)
        })?;
        self.insert_bytes(key, bytes);
        Ok(())
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.get_bytes(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> BlobKey {
        BlobKey::new(s)
    }

    #[tokio::test]
    async fn fs_roundtrip_is_byte_exact() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());

        let src = scratch.path().join("input.ply");
        tokio::fs::write(&src, b"ply payload bytes").await.unwrap();

        let k = key("tours/NYC/asset-1/input.ply");
        store.put(&src, &k).await.unwrap();
        assert!(store.exists(&k).await.unwrap());

        let dest = scratch.path().join("fetched.ply");
        store.get(&k, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"ply payload bytes");
    }

    #[tokio::test]
    async fn fs_get_missing_is_retryable_io() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());
        let err = store
            .get(&key("tours/NYC/none/input.ply"), Path::new("/tmp/never"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, tour_error::ErrorKind::Io);
        assert_eq!(err.code, "BLOB_GET_MISSING");
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn fs_put_overwrites_atomically() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());
        let k = key("tours/SF/a/output.sog");

        let v1 = scratch.path().join("v1");
        tokio::fs::write(&v1, b"first").await.unwrap();
        store.put(&v1, &k).await.unwrap();

        let v2 = scratch.path().join("v2");
        tokio::fs::write(&v2, b"second").await.unwrap();
        store.put(&v2, &k).await.unwrap();

        let dest = scratch.path().join("out");
        store.get(&k, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"second");

        // No stray staging files left behind.
        let dir = root.path().join("tours/SF/a");
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["output.sog"]);
    }

    #[tokio::test]
    async fn memory_roundtrip() {
        let scratch = tempfile::tempdir().unwrap();
        let store = MemoryBlobStore::new();
        let k = key("tours/NYC/b/input.ply");
        store.insert_bytes(&k, b"seeded".to_vec());

        let dest = scratch.path().join("out.ply");
        store.get(&k, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"seeded");

        let src = scratch.path().join("up.sog");
        tokio::fs::write(&src, b"converted").await.unwrap();
        let k2 = key("tours/NYC/b/output.sog");
        store.put(&src, &k2).await.unwrap();
        assert_eq!(store.get_bytes(&k2).unwrap(), b"converted");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn memory_get_missing_errors() {
        let store = MemoryBlobStore::new();
        let err = store
            .get(&key("absent"), Path::new("/tmp/never"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "BLOB_GET_MISSING");
    }
}
