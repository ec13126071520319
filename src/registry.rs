//!
//! Firmware registry
//! -----------------
//! Durable metadata table mapping version -> artifact location, checksum,
//! size, rollout percentage and the single "latest active" flag. The table is
//! one Parquet file; every mutation rewrites it to a temp file and atomically
//! renames it over the old one while holding the registry mutex. The rename
//! is the transaction boundary: the activate-swap (flip the previous active
//! row off, insert the new row active) commits as one unit, so at most one
//! row is active at any time, across crashes and restarts included.
//!
//! Rows are never deleted here; retention of published versions is handled
//! elsewhere, if at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use polars::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Validate the published-version shape: a plain dotted numeric triplet such
/// as `1.0.4`. Pre-release tags and build metadata are rejected; devices
/// compare versions as plain triplets.
pub fn validate_version(version: &str) -> AppResult<()> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return Err(AppError::user(
            "invalid_version".to_string(),
            "Version must not be empty".to_string(),
        ));
    }
    match semver::Version::parse(trimmed) {
        Ok(v) if v.pre.is_empty() && v.build.is_empty() => Ok(()),
        _ => Err(AppError::user(
            "invalid_version".to_string(),
            format!("Invalid version '{}': expected a dotted numeric triplet like 1.0.4", version),
        )),
    }
}

/// Input to [`Registry::register`], produced by the upload pipeline after the
/// artifact store has persisted the binary.
#[derive(Debug, Clone)]
pub struct NewFirmware {
    pub version: String,
    pub filename: String,
    pub storage_path: String,
    pub checksum: String,
    pub file_size: i64,
    pub release_notes: Option<String>,
    pub rollout_percent: i64,
}

/// One published firmware version as recorded in the registry table.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareRecord {
    pub version: String,
    pub filename: String,
    #[serde(skip_serializing)]
    pub storage_path: String,
    pub checksum: String,
    pub file_size: i64,
    pub release_notes: Option<String>,
    pub rollout_percent: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn mk_schema_df() -> DataFrame {
    let version: Series = Series::new("version".into(), Vec::<String>::new());
    let filename: Series = Series::new("filename".into(), Vec::<String>::new());
    let storage_path: Series = Series::new("storage_path".into(), Vec::<String>::new());
    let checksum: Series = Series::new("checksum".into(), Vec::<String>::new());
    let file_size: Series = Series::new("file_size".into(), Vec::<i64>::new());
    let release_notes: Series = Series::new("release_notes".into(), Vec::<Option<String>>::new());
    let rollout_percent: Series = Series::new("rollout_percent".into(), Vec::<i64>::new());
    let is_active: Series = Series::new("is_active".into(), Vec::<bool>::new());
    let created_at: Series = Series::new("created_at".into(), Vec::<i64>::new());
    let updated_at: Series = Series::new("updated_at".into(), Vec::<i64>::new());
    DataFrame::new(vec![
        version.into(),
        filename.into(),
        storage_path.into(),
        checksum.into(),
        file_size.into(),
        release_notes.into(),
        rollout_percent.into(),
        is_active.into(),
        created_at.into(),
        updated_at.into(),
    ])
    .unwrap()
}

fn str_at(df: &DataFrame, col: &str, i: usize) -> Result<String> {
    match df.column(col)?.get(i)? {
        AnyValue::String(s) => Ok(s.to_string()),
        AnyValue::StringOwned(s) => Ok(s.to_string()),
        other => anyhow::bail!("Unexpected value in column {}: {:?}", col, other),
    }
}

fn opt_str_at(df: &DataFrame, col: &str, i: usize) -> Result<Option<String>> {
    match df.column(col)?.get(i)? {
        AnyValue::String(s) => Ok(Some(s.to_string())),
        AnyValue::StringOwned(s) => Ok(Some(s.to_string())),
        AnyValue::Null => Ok(None),
        other => anyhow::bail!("Unexpected value in column {}: {:?}", col, other),
    }
}

fn ms_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .with_context(|| format!("Timestamp out of range: {}", ms))
}

/// On-disk registry handle. Callers go through [`SharedRegistry`]; the mutex
/// serializes the read-modify-rename cycle.
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create registry directory: {}", dir.display()))?;
        }
        Ok(Self { path })
    }

    fn read_table(&self) -> Result<DataFrame> {
        if !self.path.exists() {
            return Ok(mk_schema_df());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open registry table: {}", self.path.display()))?;
        let df = ParquetReader::new(file).finish()?;
        Ok(df)
    }

    fn write_table(&self, mut df: DataFrame) -> Result<()> {
        let tmp = self.path.with_file_name(format!(
            "{}.tmp",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("firmware.parquet")
        ));
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create registry temp file: {}", tmp.display()))?;
        ParquetWriter::new(&mut file).finish(&mut df)?;
        // The rename below is the commit point; sync first so a crash cannot
        // promote a half-written table.
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to commit registry table: {}", self.path.display()))?;
        Ok(())
    }

    fn find_version_row(df: &DataFrame, version: &str) -> Result<Option<usize>> {
        for i in 0..df.height() {
            if str_at(df, "version", i)? == version {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn record_at(df: &DataFrame, i: usize) -> Result<FirmwareRecord> {
        Ok(FirmwareRecord {
            version: str_at(df, "version", i)?,
            filename: str_at(df, "filename", i)?,
            storage_path: str_at(df, "storage_path", i)?,
            checksum: str_at(df, "checksum", i)?,
            file_size: df.column("file_size")?.i64()?.get(i).unwrap_or(0),
            release_notes: opt_str_at(df, "release_notes", i)?,
            rollout_percent: df.column("rollout_percent")?.i64()?.get(i).unwrap_or(0),
            is_active: df.column("is_active")?.bool()?.get(i).unwrap_or(false),
            created_at: ms_to_utc(df.column("created_at")?.i64()?.get(i).unwrap_or(0))?,
            updated_at: ms_to_utc(df.column("updated_at")?.i64()?.get(i).unwrap_or(0))?,
        })
    }

    /// True if a row for `version` exists. Used by the upload pipeline as a
    /// fast pre-check; `register` revalidates under the same lock that
    /// commits, which closes the race.
    pub fn exists(&self, version: &str) -> Result<bool> {
        let df = self.read_table()?;
        Ok(Self::find_version_row(&df, version)?.is_some())
    }

    /// Insert a new version row and make it the single active one. The
    /// previous active row (if any) is deactivated in the same table rewrite,
    /// so the swap is atomic: the renamed file either has the old state or
    /// the complete new state.
    pub fn register(&self, new: NewFirmware) -> AppResult<FirmwareRecord> {
        let mut df = self.read_table()?;
        if Self::find_version_row(&df, &new.version).map_err(AppError::from)?.is_some() {
            return Err(AppError::conflict(
                "duplicate_version".to_string(),
                format!("Firmware version {} already exists", new.version),
            ));
        }

        let now_ms = Utc::now().timestamp_millis();

        // Deactivate whatever row currently holds the active flag, touching
        // its updated_at.
        if df.height() > 0 {
            let was_active: Vec<bool> = df
                .column("is_active")
                .map_err(anyhow::Error::from)?
                .bool()
                .map_err(anyhow::Error::from)?
                .into_iter()
                .map(|o| o.unwrap_or(false))
                .collect();
            let old_updated: Vec<i64> = df
                .column("updated_at")
                .map_err(anyhow::Error::from)?
                .i64()
                .map_err(anyhow::Error::from)?
                .into_iter()
                .map(|o| o.unwrap_or(0))
                .collect();
            let new_updated: Vec<i64> = was_active
                .iter()
                .zip(old_updated)
                .map(|(active, old)| if *active { now_ms } else { old })
                .collect();
            let all_inactive = vec![false; df.height()];
            df.with_column(Series::new("is_active".into(), all_inactive))
                .map_err(anyhow::Error::from)?;
            df.with_column(Series::new("updated_at".into(), new_updated))
                .map_err(anyhow::Error::from)?;
        }

        let row = DataFrame::new(vec![
            Series::new("version".into(), vec![new.version.clone()]).into(),
            Series::new("filename".into(), vec![new.filename.clone()]).into(),
            Series::new("storage_path".into(), vec![new.storage_path.clone()]).into(),
            Series::new("checksum".into(), vec![new.checksum.clone()]).into(),
            Series::new("file_size".into(), vec![new.file_size]).into(),
            Series::new("release_notes".into(), vec![new.release_notes.clone()]).into(),
            Series::new("rollout_percent".into(), vec![new.rollout_percent]).into(),
            Series::new("is_active".into(), vec![true]).into(),
            Series::new("created_at".into(), vec![now_ms]).into(),
            Series::new("updated_at".into(), vec![now_ms]).into(),
        ])
        .map_err(anyhow::Error::from)?;

        let stacked = if df.height() == 0 {
            row
        } else {
            df.vstack(&row).map_err(anyhow::Error::from)?
        };
        self.write_table(stacked)?;
        debug!(target: "otahub::registry", "register: version='{}' now active", new.version);

        Ok(FirmwareRecord {
            version: new.version,
            filename: new.filename,
            storage_path: new.storage_path,
            checksum: new.checksum,
            file_size: new.file_size,
            release_notes: new.release_notes,
            rollout_percent: new.rollout_percent,
            is_active: true,
            created_at: ms_to_utc(now_ms)?,
            updated_at: ms_to_utc(now_ms)?,
        })
    }

    /// The single row with the active flag set, or `no_firmware_available`
    /// when nothing has ever been published. The latter is an expected
    /// condition, not a server error.
    pub fn get_latest_active(&self) -> AppResult<FirmwareRecord> {
        let df = self.read_table()?;
        for i in 0..df.height() {
            if df
                .column("is_active")
                .map_err(anyhow::Error::from)?
                .bool()
                .map_err(anyhow::Error::from)?
                .get(i)
                .unwrap_or(false)
            {
                return Ok(Self::record_at(&df, i)?);
            }
        }
        Err(AppError::not_found(
            "no_firmware_available".to_string(),
            "No firmware available".to_string(),
        ))
    }

    pub fn get_by_version(&self, version: &str) -> AppResult<FirmwareRecord> {
        let df = self.read_table()?;
        match Self::find_version_row(&df, version).map_err(AppError::from)? {
            Some(i) => Ok(Self::record_at(&df, i)?),
            None => Err(AppError::not_found(
                "no_firmware_available".to_string(),
                format!("Firmware version {} not found", version),
            )),
        }
    }

    /// All rows, unordered. Used by tests and the startup inventory log.
    pub fn all(&self) -> Result<Vec<FirmwareRecord>> {
        let df = self.read_table()?;
        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            out.push(Self::record_at(&df, i)?);
        }
        Ok(out)
    }
}

#[derive(Clone)]
pub struct SharedRegistry(pub Arc<Mutex<Registry>>);

impl SharedRegistry {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Registry::new(path)?))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_fw(version: &str) -> NewFirmware {
        NewFirmware {
            version: version.to_string(),
            filename: format!("device_v{}.bin", version),
            storage_path: format!("/tmp/firmware/{}.bin", version),
            checksum: "ab".repeat(32),
            file_size: 500_000,
            release_notes: Some("notes".to_string()),
            rollout_percent: 100,
        }
    }

    #[test]
    fn validate_version_accepts_triplets_only() {
        assert!(validate_version("1.0.4").is_ok());
        assert!(validate_version("10.20.30").is_ok());
        assert!(validate_version("").is_err());
        assert!(validate_version("  ").is_err());
        assert!(validate_version("1.0").is_err());
        assert!(validate_version("v1.0.4").is_err());
        assert!(validate_version("1.0.4-beta").is_err());
        assert!(validate_version("1.0.4+build5").is_err());
        assert!(validate_version("abc").is_err());
    }

    #[test]
    fn first_register_becomes_active() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new(tmp.path().join("firmware.parquet")).unwrap();
        let rec = reg.register(new_fw("1.0.4")).unwrap();
        assert!(rec.is_active);
        let latest = reg.get_latest_active().unwrap();
        assert_eq!(latest.version, "1.0.4");
    }

    #[test]
    fn register_swaps_active_flag_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new(tmp.path().join("firmware.parquet")).unwrap();
        reg.register(new_fw("1.0.4")).unwrap();
        reg.register(new_fw("1.0.5")).unwrap();
        reg.register(new_fw("1.0.6")).unwrap();

        let all = reg.all().unwrap();
        assert_eq!(all.len(), 3);
        let active: Vec<_> = all.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1, "exactly one active row expected");
        assert_eq!(active[0].version, "1.0.6");

        let old = reg.get_by_version("1.0.4").unwrap();
        assert!(!old.is_active);
        assert!(old.updated_at >= old.created_at);
    }

    #[test]
    fn duplicate_version_rejected_and_state_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new(tmp.path().join("firmware.parquet")).unwrap();
        reg.register(new_fw("1.0.4")).unwrap();
        let err = reg.register(new_fw("1.0.4")).unwrap_err();
        assert_eq!(err.code_str(), "duplicate_version");
        assert_eq!(err.http_status(), 409);
        assert_eq!(reg.all().unwrap().len(), 1);
        assert_eq!(reg.get_latest_active().unwrap().version, "1.0.4");
    }

    #[test]
    fn empty_registry_reports_no_firmware() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new(tmp.path().join("firmware.parquet")).unwrap();
        let err = reg.get_latest_active().unwrap_err();
        assert_eq!(err.code_str(), "no_firmware_available");
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn table_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("firmware.parquet");
        {
            let reg = Registry::new(&path).unwrap();
            reg.register(new_fw("1.0.4")).unwrap();
            let mut fw = new_fw("1.0.5");
            fw.release_notes = None;
            reg.register(fw).unwrap();
        }
        let reg = Registry::new(&path).unwrap();
        let latest = reg.get_latest_active().unwrap();
        assert_eq!(latest.version, "1.0.5");
        assert_eq!(latest.release_notes, None);
        let old = reg.get_by_version("1.0.4").unwrap();
        assert!(!old.is_active);
        assert_eq!(old.release_notes.as_deref(), Some("notes"));
    }

    #[test]
    fn no_temp_file_left_after_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new(tmp.path().join("firmware.parquet")).unwrap();
        reg.register(new_fw("1.0.4")).unwrap();
        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["firmware.parquet".to_string()]);
    }
}
