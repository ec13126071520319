//!
//! Firmware artifact store
//! -----------------------
//! One write-once binary per published version under a configured directory
//! (`<root>/<version>.bin`). Uploads stream through [`ArtifactWriter`], which
//! hashes (SHA-256) and enforces the size cap chunk by chunk, so an oversized
//! or aborted upload never produces a visible artifact: bytes accumulate in a
//! hidden temp file that is only promoted to its final name on `finish()`.
//! The checksum is always computed here from the bytes actually written;
//! caller-supplied digests are never trusted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Outcome of a completed artifact write.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    /// Absolute path of the stored binary; owned exclusively by the registry
    /// row that records it.
    pub storage_path: String,
    /// SHA-256 hex digest of the stored bytes.
    pub checksum: String,
    /// Byte length of the stored binary.
    pub size: u64,
}

/// Filesystem-backed store of firmware binaries, one file per version.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    /// Serializes the exists-check + rename that promotes a temp file, so two
    /// concurrent uploads of the same version cannot both claim the path.
    promote: Arc<Mutex<()>>,
}

impl ArtifactStore {
    /// Create a store rooted at the given directory, creating it if missing.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create firmware directory: {}", root.display()))?;
        Ok(Self { root, promote: Arc::new(Mutex::new(())) })
    }

    pub fn root_path(&self) -> &PathBuf { &self.root }

    /// True if a binary for `version` is already stored.
    pub fn contains(&self, version: &str) -> bool {
        self.final_path(version).exists()
    }

    fn final_path(&self, version: &str) -> PathBuf {
        self.root.join(format!("{}.bin", version))
    }

    /// Begin streaming an artifact upload. The version is supplied at
    /// `finish`, since multipart clients may send the binary field before the
    /// version field; until then bytes live in a hidden temp file.
    pub async fn begin(&self, max_bytes: u64) -> AppResult<ArtifactWriter> {
        let tmp_path = self
            .root
            .join(format!(".upload-{}.partial", Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&tmp_path).await.map_err(|e| {
            AppError::io(
                "storage_error".to_string(),
                format!("Failed to create artifact temp file {}: {}", tmp_path.display(), e),
            )
        })?;
        debug!(target: "otahub::artifacts", "begin: tmp='{}'", tmp_path.display());
        Ok(ArtifactWriter {
            tmp_path,
            store_root: self.root.clone(),
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            max_bytes,
            promote: self.promote.clone(),
            done: false,
        })
    }

    /// Convenience wrapper for callers that already hold the full payload.
    pub async fn put_bytes(&self, version: &str, bytes: &[u8], max_bytes: u64) -> AppResult<StoredArtifact> {
        let mut w = self.begin(max_bytes).await?;
        w.write_chunk(bytes).await?;
        w.finish(version).await
    }

    /// Open a stored artifact for reading, returning the handle and its length.
    pub async fn open(&self, storage_path: &str) -> AppResult<(tokio::fs::File, u64)> {
        let file = match tokio::fs::File::open(storage_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::not_found(
                    "artifact_missing".to_string(),
                    format!("Artifact not found: {}", storage_path),
                ));
            }
            Err(e) => {
                return Err(AppError::io(
                    "storage_error".to_string(),
                    format!("Failed to open artifact {}: {}", storage_path, e),
                ));
            }
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| {
                AppError::io(
                    "storage_error".to_string(),
                    format!("Failed to stat artifact {}: {}", storage_path, e),
                )
            })?
            .len();
        Ok((file, len))
    }

    /// Remove a stored artifact. Used only to roll back a write whose
    /// registration failed; missing files are not an error.
    pub async fn remove(&self, storage_path: &str) -> Result<()> {
        match tokio::fs::remove_file(storage_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove artifact {}", storage_path)),
        }
    }
}

/// In-flight artifact upload. Dropping without `finish()` discards the temp
/// file, leaving no trace of the aborted upload.
pub struct ArtifactWriter {
    tmp_path: PathBuf,
    store_root: PathBuf,
    file: Option<tokio::fs::File>,
    hasher: Sha256,
    written: u64,
    max_bytes: u64,
    promote: Arc<Mutex<()>>,
    done: bool,
}

impl ArtifactWriter {
    pub fn bytes_written(&self) -> u64 { self.written }

    /// Append a chunk, updating the running hash. Rejects the upload as soon
    /// as the running total exceeds the cap, before buffering the remainder.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> AppResult<()> {
        self.written += chunk.len() as u64;
        if self.written > self.max_bytes {
            return Err(AppError::too_large(
                "payload_too_large".to_string(),
                format!("Firmware exceeds maximum size of {} bytes", self.max_bytes),
            ));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AppError::internal("internal".to_string(), "write after finish".to_string()))?;
        file.write_all(chunk).await.map_err(|e| {
            AppError::io(
                "storage_error".to_string(),
                format!("Failed writing artifact temp file: {}", e),
            )
        })?;
        self.hasher.update(chunk);
        Ok(())
    }

    /// Flush, sync and promote the temp file to `<version>.bin`. The
    /// exists-check and rename run under the store's promote lock so the
    /// version path can be claimed exactly once; versions are immutable once
    /// stored.
    pub async fn finish(mut self, version: &str) -> AppResult<StoredArtifact> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| AppError::internal("internal".to_string(), "finish called twice".to_string()))?;
        let io_err = |what: String| AppError::io("storage_error".to_string(), what);
        file.flush()
            .await
            .map_err(|e| io_err(format!("Failed flushing artifact for version {}: {}", version, e)))?;
        file.sync_all()
            .await
            .map_err(|e| io_err(format!("Failed syncing artifact for version {}: {}", version, e)))?;
        drop(file);

        let final_path = self.store_root.join(format!("{}.bin", version));
        {
            let _guard = self.promote.lock();
            if final_path.exists() {
                let _ = std::fs::remove_file(&self.tmp_path);
                self.done = true;
                return Err(AppError::conflict(
                    "duplicate_version".to_string(),
                    format!("Artifact for version {} already stored", version),
                ));
            }
            std::fs::rename(&self.tmp_path, &final_path)
                .map_err(|e| io_err(format!("Failed to store artifact for version {}: {}", version, e)))?;
        }
        self.done = true;

        let checksum = hex::encode(self.hasher.clone().finalize());
        debug!(
            target: "otahub::artifacts",
            "finish: version='{}' path='{}' size={} checksum={}",
            version, final_path.display(), self.written, checksum
        );
        Ok(StoredArtifact {
            storage_path: final_path.to_string_lossy().to_string(),
            checksum,
            size: self.written,
        })
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if !self.done {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
