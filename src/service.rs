//!
//! Firmware service
//! ----------------
//! Orchestrates the upload pipeline and the read/report paths over the three
//! stores. Upload ordering is load-bearing:
//!
//!   1. validate version shape, rollout percent and advisory filename;
//!   2. pre-check version uniqueness against the registry (fail fast, before
//!      any artifact I/O);
//!   3. stream the binary into the artifact store (checksum computed there);
//!   4. register the metadata — the registry re-validates uniqueness and
//!      performs the activate-swap atomically; if registration fails, the
//!      just-written artifact is deleted so no orphan remains.
//!
//! Notification fan-out is NOT part of this pipeline: the HTTP layer spawns
//! it after a successful commit, behind its own error boundary.

use chrono::Utc;
use tracing::{error, info};

use crate::artifacts::{ArtifactStore, ArtifactWriter, StoredArtifact};
use crate::error::{AppError, AppResult};
use crate::registry::{self, FirmwareRecord, NewFirmware, SharedRegistry};
use crate::reports::{DeviceReport, OtaStatus, ReportStore};

/// Metadata accompanying an upload, parsed from the multipart form.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub version: String,
    /// Advisory original filename; defaults to `firmware_v<version>.bin`.
    pub filename: Option<String>,
    pub release_notes: Option<String>,
    pub rollout_percent: i64,
}

/// Inbound device report before the server assigns a timestamp.
#[derive(Debug, Clone)]
pub struct ReportInput {
    pub device_id: String,
    pub firmware_version: String,
    pub status: OtaStatus,
    pub error_message: Option<String>,
    pub progress_percent: Option<i64>,
    pub ip_address: Option<String>,
}

pub struct FirmwareService {
    registry: SharedRegistry,
    artifacts: ArtifactStore,
    reports: ReportStore,
    max_firmware_bytes: u64,
}

impl FirmwareService {
    pub fn new(
        registry: SharedRegistry,
        artifacts: ArtifactStore,
        reports: ReportStore,
        max_firmware_bytes: u64,
    ) -> Self {
        Self { registry, artifacts, reports, max_firmware_bytes }
    }

    pub fn max_firmware_bytes(&self) -> u64 { self.max_firmware_bytes }

    /// Structural validation of the upload metadata. Rejected uploads have no
    /// durable side effect.
    pub fn validate_upload(&self, meta: &UploadMeta) -> AppResult<()> {
        registry::validate_version(&meta.version)?;
        if !(0..=100).contains(&meta.rollout_percent) {
            return Err(AppError::user(
                "invalid_rollout_percent".to_string(),
                format!("rollout_percent must be within 0..=100, got {}", meta.rollout_percent),
            ));
        }
        if let Some(name) = &meta.filename {
            if !name.ends_with(".bin") {
                return Err(AppError::user(
                    "invalid_file_type".to_string(),
                    "Invalid file type. Only .bin files are allowed.".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Fast uniqueness pre-check, run before any artifact I/O. The registry
    /// re-validates under its own lock at commit, which closes the race.
    pub fn ensure_version_free(&self, version: &str) -> AppResult<()> {
        let taken = self.registry.0.lock().exists(version).map_err(AppError::from)?;
        if taken {
            return Err(AppError::conflict(
                "duplicate_version".to_string(),
                format!("Firmware version {} already exists", version),
            ));
        }
        Ok(())
    }

    /// Start streaming an upload into the artifact store.
    pub async fn begin_artifact(&self) -> AppResult<ArtifactWriter> {
        self.artifacts.begin(self.max_firmware_bytes).await
    }

    /// Register a stored artifact in the registry. On any registration
    /// failure the artifact written for this upload is removed again, so the
    /// registry never points at a file that should not exist and the store
    /// never keeps a file the registry does not know.
    pub async fn commit_upload(&self, stored: StoredArtifact, meta: UploadMeta) -> AppResult<FirmwareRecord> {
        let filename = meta
            .filename
            .unwrap_or_else(|| format!("firmware_v{}.bin", meta.version));
        let new = NewFirmware {
            version: meta.version.clone(),
            filename,
            storage_path: stored.storage_path.clone(),
            checksum: stored.checksum,
            file_size: stored.size as i64,
            release_notes: meta.release_notes,
            rollout_percent: meta.rollout_percent,
        };
        let registered = { self.registry.0.lock().register(new) };
        match registered {
            Ok(rec) => {
                info!(
                    target: "otahub::service",
                    "published firmware version={} size={} checksum={}",
                    rec.version, rec.file_size, rec.checksum
                );
                Ok(rec)
            }
            Err(e) => {
                if let Err(cleanup) = self.artifacts.remove(&stored.storage_path).await {
                    error!(
                        target: "otahub::service",
                        "failed to remove artifact after registration failure: {:#}", cleanup
                    );
                }
                Err(e)
            }
        }
    }

    /// One-shot upload used by tests and tooling that already hold the bytes.
    pub async fn upload_bytes(&self, meta: UploadMeta, bytes: &[u8]) -> AppResult<FirmwareRecord> {
        self.validate_upload(&meta)?;
        self.ensure_version_free(&meta.version)?;
        let mut w = self.begin_artifact().await?;
        w.write_chunk(bytes).await?;
        let stored = w.finish(&meta.version).await?;
        self.commit_upload(stored, meta).await
    }

    /// Metadata of the single active version.
    pub fn latest(&self) -> AppResult<FirmwareRecord> {
        self.registry.0.lock().get_latest_active()
    }

    pub fn get_by_version(&self, version: &str) -> AppResult<FirmwareRecord> {
        self.registry.0.lock().get_by_version(version)
    }

    /// Resolve the active version to its metadata plus an open artifact
    /// handle. An advertised version whose binary has gone missing is a
    /// storage-layer inconsistency, not a client error.
    pub async fn resolve_download(&self) -> AppResult<(FirmwareRecord, tokio::fs::File, u64)> {
        let rec = self.latest()?;
        match self.artifacts.open(&rec.storage_path).await {
            Ok((file, len)) => Ok((rec, file, len)),
            Err(AppError::NotFound { .. }) => {
                error!(
                    target: "otahub::service",
                    "active version {} advertises missing artifact {}", rec.version, rec.storage_path
                );
                Err(AppError::io(
                    "storage_error".to_string(),
                    format!("Artifact for version {} is unavailable", rec.version),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Append a device report. `device_id` and `firmware_version` are opaque;
    /// no referential check against the registry, by design.
    pub fn record_report(&self, input: ReportInput, peer_ip: Option<String>) -> AppResult<DeviceReport> {
        if let Some(p) = input.progress_percent {
            if !(0..=100).contains(&p) {
                return Err(AppError::user(
                    "bad_report".to_string(),
                    format!("progress_percent must be within 0..=100, got {}", p),
                ));
            }
        }
        let report = DeviceReport {
            device_id: input.device_id,
            firmware_version: input.firmware_version,
            status: input.status,
            error_message: input.error_message,
            progress_percent: input.progress_percent,
            ip_address: input.ip_address.or(peer_ip),
            reported_at: Utc::now(),
        };
        self.reports.append(&report)?;
        info!(
            target: "otahub::service",
            "OTA report: device='{}' version='{}' status='{}'",
            report.device_id, report.firmware_version, report.status.as_str()
        );
        Ok(report)
    }

    pub fn list_reports(
        &self,
        device_id: Option<&str>,
        firmware_version: Option<&str>,
        limit: usize,
    ) -> AppResult<Vec<DeviceReport>> {
        self.reports.list(device_id, firmware_version, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> FirmwareService {
        let registry = SharedRegistry::new(dir.join("firmware.parquet")).unwrap();
        let artifacts = ArtifactStore::new(dir.join("firmware")).unwrap();
        let reports = ReportStore::new(dir.join("reports")).unwrap();
        FirmwareService::new(registry, artifacts, reports, 1 << 20)
    }

    fn meta(version: &str) -> UploadMeta {
        UploadMeta {
            version: version.to_string(),
            filename: Some(format!("device_v{}.bin", version)),
            release_notes: None,
            rollout_percent: 100,
        }
    }

    #[tokio::test]
    async fn upload_then_latest_then_download() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let payload = vec![7u8; 5000];
        let rec = svc.upload_bytes(meta("1.0.4"), &payload).await.unwrap();
        assert!(rec.is_active);
        assert_eq!(rec.file_size, 5000);

        let latest = svc.latest().unwrap();
        assert_eq!(latest.version, "1.0.4");

        let (rec, _file, len) = svc.resolve_download().await.unwrap();
        assert_eq!(len, 5000);
        assert_eq!(rec.checksum, latest.checksum);
    }

    #[tokio::test]
    async fn rejects_bad_metadata_before_any_side_effect() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());

        let mut m = meta("not-a-version");
        assert_eq!(
            svc.upload_bytes(m.clone(), b"x").await.unwrap_err().code_str(),
            "invalid_version"
        );
        m = meta("1.0.4");
        m.rollout_percent = 101;
        assert_eq!(
            svc.upload_bytes(m.clone(), b"x").await.unwrap_err().code_str(),
            "invalid_rollout_percent"
        );
        m = meta("1.0.4");
        m.filename = Some("firmware.exe".to_string());
        assert_eq!(
            svc.upload_bytes(m, b"x").await.unwrap_err().code_str(),
            "invalid_file_type"
        );

        // Nothing was written anywhere
        assert!(svc.latest().is_err());
        assert!(std::fs::read_dir(tmp.path().join("firmware")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn duplicate_upload_leaves_state_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        svc.upload_bytes(meta("1.0.4"), b"original").await.unwrap();
        let err = svc.upload_bytes(meta("1.0.4"), b"imposter").await.unwrap_err();
        assert_eq!(err.code_str(), "duplicate_version");

        let (rec, _f, len) = svc.resolve_download().await.unwrap();
        assert_eq!(rec.version, "1.0.4");
        assert_eq!(len, b"original".len() as u64);
    }

    #[tokio::test]
    async fn failed_registration_rolls_back_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        // Simulate the pre-check race: the version lands in the registry
        // after this upload streamed its bytes but before it registered.
        let mut w = svc.begin_artifact().await.unwrap();
        w.write_chunk(b"late loser").await.unwrap();
        let stored = w.finish("2.0.0").await.unwrap();

        {
            let reg = svc.registry.0.lock();
            reg.register(crate::registry::NewFirmware {
                version: "2.0.0".to_string(),
                filename: "device_v2.0.0.bin".to_string(),
                storage_path: tmp.path().join("elsewhere/2.0.0.bin").to_string_lossy().to_string(),
                checksum: "cd".repeat(32),
                file_size: 10,
                release_notes: None,
                rollout_percent: 100,
            })
            .unwrap();
        }

        let err = svc.commit_upload(stored.clone(), meta("2.0.0")).await.unwrap_err();
        assert_eq!(err.code_str(), "duplicate_version");
        // The loser's artifact is gone again
        assert!(!std::path::Path::new(&stored.storage_path).exists());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_with_no_residue() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::new(tmp.path().join("firmware.parquet")).unwrap();
        let artifacts = ArtifactStore::new(tmp.path().join("firmware")).unwrap();
        let reports = ReportStore::new(tmp.path().join("reports")).unwrap();
        let svc = FirmwareService::new(registry, artifacts, reports, 16);
        let err = svc.upload_bytes(meta("1.0.4"), &[0u8; 64]).await.unwrap_err();
        assert_eq!(err.code_str(), "payload_too_large");
        assert!(svc.latest().is_err());
        assert!(std::fs::read_dir(tmp.path().join("firmware")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn report_accepts_unknown_version_and_infers_ip() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let rec = svc
            .record_report(
                ReportInput {
                    device_id: "ESP32-1".to_string(),
                    firmware_version: "0.9.0".to_string(),
                    status: OtaStatus::Failed,
                    error_message: Some("flash write error".to_string()),
                    progress_percent: None,
                    ip_address: None,
                },
                Some("10.0.0.7".to_string()),
            )
            .unwrap();
        assert_eq!(rec.ip_address.as_deref(), Some("10.0.0.7"));

        let rows = svc.list_reports(Some("ESP32-1"), None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].firmware_version, "0.9.0");
        assert_eq!(rows[0].error_message.as_deref(), Some("flash write error"));
    }

    #[tokio::test]
    async fn report_with_out_of_range_progress_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let err = svc
            .record_report(
                ReportInput {
                    device_id: "ESP32-1".to_string(),
                    firmware_version: "1.0.4".to_string(),
                    status: OtaStatus::InProgress,
                    error_message: None,
                    progress_percent: Some(250),
                    ip_address: None,
                },
                None,
            )
            .unwrap_err();
        assert_eq!(err.code_str(), "bad_report");
        assert!(svc.list_reports(None, None, 10).unwrap().is_empty());
    }
}
