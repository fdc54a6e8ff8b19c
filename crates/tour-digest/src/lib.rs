// SPDX-License-Identifier: MIT OR Apache-2.0
//! Streaming SHA-256 digests over files and buffers.
//!
//! The digest is the integrity anchor for the whole pipeline: the source
//! digest in a conversion result must equal the hash of the bytes the
//! converter consumed, and the output digest must equal the hash of the bytes
//! published to the blob store.  No retries happen here; callers own I/O
//! error policy.

#![deny(unsafe_code)]

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tour_error::{PipelineError, Result};

/// Read files in 64 KiB chunks.
const CHUNK_SIZE: usize = 64 * 1024;

/// Hex digest plus byte count of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// 64 lowercase hex characters.
    pub hex: String,
    /// File size in bytes.
    pub size: u64,
}

/// Compute the SHA-256 of a file, streaming in fixed-size chunks.
pub fn digest_file(path: impl AsRef<Path>) -> Result<FileDigest> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| {
        PipelineError::io("DIGEST_OPEN_FAILED", format!("open {}", path.display())).with_source(e)
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            PipelineError::io("DIGEST_READ_FAILED", format!("read {}", path.display()))
                .with_source(e)
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileDigest {
        hex: format!("{:x}", hasher.finalize()),
        size,
    })
}

/// Compute the SHA-256 of an in-memory buffer.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Verify a file against an expected hex digest (case-insensitive).
pub fn verify_file(path: impl AsRef<Path>, expected_hex: &str) -> Result<bool> {
    let actual = digest_file(path)?;
    Ok(actual.hex.eq_ignore_ascii_case(expected_hex))
}

/// Async wrapper around [`digest_file`]; the streaming hash runs on the
/// blocking pool so large files don't stall the worker runtime.
pub async fn digest_file_async(path: impl AsRef<Path>) -> Result<FileDigest> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || digest_file(&path))
        .await
        .map_err(|e| {
            PipelineError::new(
                tour_error::ErrorKind::Unexpected,
                "DIGEST_TASK_PANICKED",
                "digest task failed to join",
            )
            .with_context("join_error", e.to_string())
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// SHA-256 of the literal bytes `"Hello, World!"`.
    const HELLO_WORLD_SHA256: &str =
        "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

    fn write_fixture(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "input.ply", b"Hello, World!");
        let d = digest_file(&path).unwrap();
        assert_eq!(d.hex, HELLO_WORLD_SHA256);
        assert_eq!(d.size, 13);
    }

    #[test]
    fn verify_accepts_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "input.ply", b"Hello, World!");
        assert!(verify_file(&path, HELLO_WORLD_SHA256).unwrap());
        assert!(verify_file(&path, &HELLO_WORLD_SHA256.to_uppercase()).unwrap());
        assert!(!verify_file(&path, "wrong").unwrap());
    }

    #[test]
    fn bytes_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0xA5u8; 200_000]; // spans multiple chunks
        let path = write_fixture(&dir, "big.bin", &payload);
        let d = digest_file(&path).unwrap();
        assert_eq!(d.hex, digest_bytes(&payload));
        assert_eq!(d.size, 200_000);
    }

    #[test]
    fn empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "empty", b"");
        let d = digest_file(&path).unwrap();
        assert_eq!(
            d.hex,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(d.size, 0);
    }

    #[test]
    fn missing_file_is_io_kind() {
        let err = digest_file("/nonexistent/input.ply").unwrap_err();
        assert_eq!(err.kind, tour_error::ErrorKind::Io);
        assert_eq!(err.code, "DIGEST_OPEN_FAILED");
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn async_wrapper_agrees() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "input.ply", b"Hello, World!");
        let d = digest_file_async(&path).await.unwrap();
        assert_eq!(d.hex, HELLO_WORLD_SHA256);
    }
}
