//!
//! OTA device report log
//! ---------------------
//! Append-only telemetry from devices about their update outcomes. Devices
//! are unauthenticated and identified only by whatever `device_id` they send;
//! neither it nor `firmware_version` is required to reference anything in the
//! registry (a device may report a factory image or a rolled-back version the
//! catalog has never seen).
//!
//! Each accepted report becomes its own Parquet chunk under the reports
//! directory (`report-<epoch_ms>-<uuid>.parquet`), written to a temp name and
//! renamed into place so a partially written chunk is never visible to
//! readers. Appends need no cross-row coordination; listing stacks all
//! chunks, filters, and returns newest first.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Device-reported OTA outcome. The set is closed; anything else is rejected
/// at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaStatus {
    Success,
    Failed,
    InProgress,
}

impl OtaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::Success => "success",
            OtaStatus::Failed => "failed",
            OtaStatus::InProgress => "in_progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(OtaStatus::Success),
            "failed" => Some(OtaStatus::Failed),
            "in_progress" => Some(OtaStatus::InProgress),
            _ => None,
        }
    }
}

/// One telemetry row. `reported_at` is server-assigned at ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub firmware_version: String,
    pub status: OtaStatus,
    pub error_message: Option<String>,
    pub progress_percent: Option<i64>,
    pub ip_address: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Append-only report store rooted at a directory of Parquet chunks.
#[derive(Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create reports directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Durably append one report. Either the chunk becomes fully visible or
    /// the call fails; there is no partial row.
    pub fn append(&self, report: &DeviceReport) -> AppResult<()> {
        let mut df = DataFrame::new(vec![
            Series::new("device_id".into(), vec![report.device_id.clone()]).into(),
            Series::new("firmware_version".into(), vec![report.firmware_version.clone()]).into(),
            Series::new("status".into(), vec![report.status.as_str().to_string()]).into(),
            Series::new("error_message".into(), vec![report.error_message.clone()]).into(),
            Series::new("progress_percent".into(), vec![report.progress_percent]).into(),
            Series::new("ip_address".into(), vec![report.ip_address.clone()]).into(),
            Series::new("reported_at".into(), vec![report.reported_at.timestamp_millis()]).into(),
        ])
        .map_err(anyhow::Error::from)?;

        let name = format!(
            "report-{}-{}.parquet",
            report.reported_at.timestamp_millis(),
            Uuid::new_v4().simple()
        );
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let mut write = || -> Result<()> {
            let mut file = std::fs::File::create(&tmp)
                .with_context(|| format!("Failed to create report chunk: {}", tmp.display()))?;
            ParquetWriter::new(&mut file).finish(&mut df)?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&tmp, self.dir.join(&name))
                .with_context(|| format!("Failed to commit report chunk: {}", name))?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(AppError::from(e));
        }
        debug!(
            target: "otahub::reports",
            "append: device='{}' version='{}' status='{}'",
            report.device_id, report.firmware_version, report.status.as_str()
        );
        Ok(())
    }

    /// Reports matching the optional filters, newest first, capped at `limit`.
    pub fn list(
        &self,
        device_id: Option<&str>,
        firmware_version: Option<&str>,
        limit: usize,
    ) -> AppResult<Vec<DeviceReport>> {
        let mut chunks: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(|e| {
            AppError::io(
                "storage_error".to_string(),
                format!("Failed to read reports directory {}: {}", self.dir.display(), e),
            )
        })? {
            let p = entry.map_err(anyhow::Error::from)?.path();
            if let Some(name) = p.file_name().and_then(|s| s.to_str()) {
                if name.starts_with("report-") && name.ends_with(".parquet") {
                    chunks.push(p);
                }
            }
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut acc: Option<DataFrame> = None;
        for p in chunks {
            let file = std::fs::File::open(&p)
                .with_context(|| format!("Failed to open report chunk: {}", p.display()))
                .map_err(AppError::from)?;
            let df = ParquetReader::new(file).finish().map_err(anyhow::Error::from)?;
            match &mut acc {
                None => acc = Some(df),
                Some(a) => a.vstack_mut(&df).map(|_| ()).map_err(anyhow::Error::from)?,
            }
        }
        let df = match acc {
            Some(df) => df,
            None => return Ok(Vec::new()),
        };

        let mut lf = df.lazy();
        if let Some(d) = device_id {
            lf = lf.filter(col("device_id").eq(lit(d.to_string())));
        }
        if let Some(v) = firmware_version {
            lf = lf.filter(col("firmware_version").eq(lit(v.to_string())));
        }
        let df = lf
            .sort(
                ["reported_at"],
                SortMultipleOptions::default().with_order_descending(true),
            )
            .limit(limit as IdxSize)
            .collect()
            .map_err(anyhow::Error::from)?;

        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            out.push(Self::row_at(&df, i)?);
        }
        Ok(out)
    }

    fn row_at(df: &DataFrame, i: usize) -> Result<DeviceReport> {
        let str_at = |col: &str| -> Result<String> {
            match df.column(col)?.get(i)? {
                AnyValue::String(s) => Ok(s.to_string()),
                AnyValue::StringOwned(s) => Ok(s.to_string()),
                other => anyhow::bail!("Unexpected value in column {}: {:?}", col, other),
            }
        };
        let opt_str_at = |col: &str| -> Result<Option<String>> {
            match df.column(col)?.get(i)? {
                AnyValue::String(s) => Ok(Some(s.to_string())),
                AnyValue::StringOwned(s) => Ok(Some(s.to_string())),
                AnyValue::Null => Ok(None),
                other => anyhow::bail!("Unexpected value in column {}: {:?}", col, other),
            }
        };
        let status_raw = str_at("status")?;
        let status = OtaStatus::parse(&status_raw)
            .with_context(|| format!("Unknown status value in report chunk: {}", status_raw))?;
        let reported_ms = df.column("reported_at")?.i64()?.get(i).unwrap_or(0);
        Ok(DeviceReport {
            device_id: str_at("device_id")?,
            firmware_version: str_at("firmware_version")?,
            status,
            error_message: opt_str_at("error_message")?,
            progress_percent: df.column("progress_percent")?.i64()?.get(i),
            ip_address: opt_str_at("ip_address")?,
            reported_at: DateTime::<Utc>::from_timestamp_millis(reported_ms)
                .with_context(|| format!("Timestamp out of range: {}", reported_ms))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(device: &str, version: &str, status: OtaStatus, at_ms: i64) -> DeviceReport {
        DeviceReport {
            device_id: device.to_string(),
            firmware_version: version.to_string(),
            status,
            error_message: match status {
                OtaStatus::Failed => Some("flash write error".to_string()),
                _ => None,
            },
            progress_percent: match status {
                OtaStatus::InProgress => Some(42),
                OtaStatus::Success => Some(100),
                OtaStatus::Failed => None,
            },
            ip_address: Some("192.168.4.20".to_string()),
            reported_at: DateTime::<Utc>::from_timestamp_millis(at_ms).unwrap(),
        }
    }

    #[test]
    fn append_and_list_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ReportStore::new(tmp.path()).unwrap();
        store
            .append(&report("ESP32-1", "1.0.4", OtaStatus::Failed, 1_700_000_001_000))
            .unwrap();
        let rows = store.list(Some("ESP32-1"), None, 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, "ESP32-1");
        assert_eq!(rows[0].firmware_version, "1.0.4");
        assert_eq!(rows[0].status, OtaStatus::Failed);
        assert_eq!(rows[0].error_message.as_deref(), Some("flash write error"));
    }

    #[test]
    fn list_orders_newest_first_and_caps_at_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ReportStore::new(tmp.path()).unwrap();
        for (i, at) in [1_700_000_001_000i64, 1_700_000_003_000, 1_700_000_002_000]
            .iter()
            .enumerate()
        {
            store
                .append(&report(&format!("dev-{}", i), "1.0.4", OtaStatus::Success, *at))
                .unwrap();
        }
        let rows = store.list(None, None, 100).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].device_id, "dev-1");
        assert_eq!(rows[1].device_id, "dev-2");
        assert_eq!(rows[2].device_id, "dev-0");

        let capped = store.list(None, None, 2).unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].device_id, "dev-1");
    }

    #[test]
    fn filters_by_device_and_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ReportStore::new(tmp.path()).unwrap();
        store
            .append(&report("ESP32-1", "1.0.4", OtaStatus::Success, 1_700_000_001_000))
            .unwrap();
        store
            .append(&report("ESP32-1", "1.0.5", OtaStatus::InProgress, 1_700_000_002_000))
            .unwrap();
        store
            .append(&report("ESP32-2", "1.0.4", OtaStatus::Failed, 1_700_000_003_000))
            .unwrap();

        let by_device = store.list(Some("ESP32-1"), None, 100).unwrap();
        assert_eq!(by_device.len(), 2);
        let by_both = store.list(Some("ESP32-1"), Some("1.0.4"), 100).unwrap();
        assert_eq!(by_both.len(), 1);
        assert_eq!(by_both[0].status, OtaStatus::Success);
        let by_version = store.list(None, Some("1.0.4"), 100).unwrap();
        assert_eq!(by_version.len(), 2);
    }

    #[test]
    fn version_unknown_to_registry_is_still_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ReportStore::new(tmp.path()).unwrap();
        // "0.0.9-factory" never passed through the upload pipeline; reports
        // carry opaque version strings and are stored as-is.
        let mut r = report("ESP32-7", "0.0.9-factory", OtaStatus::Success, 1_700_000_001_000);
        r.ip_address = None;
        store.append(&r).unwrap();
        let rows = store.list(Some("ESP32-7"), Some("0.0.9-factory"), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip_address, None);
        assert_eq!(rows[0].progress_percent, Some(100));
    }

    #[test]
    fn empty_store_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ReportStore::new(tmp.path()).unwrap();
        assert!(store.list(None, None, 100).unwrap().is_empty());
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [OtaStatus::Success, OtaStatus::Failed, OtaStatus::InProgress] {
            assert_eq!(OtaStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OtaStatus::parse("rebooting"), None);
    }
}
