//!
//! otahub HTTP server
//! ------------------
//! This module defines the Axum-based HTTP API for the firmware distribution
//! service.
//!
//! Responsibilities:
//! - Admin endpoints (upload, report listing) behind HTTP Basic credentials
//!   from process configuration.
//! - Public device/mobile endpoints: latest metadata, binary download with
//!   integrity headers and range/conditional support, OTA status reports.
//! - Post-commit notification fan-out, spawned outside the upload path.
//! - Startup inventory logs.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::info;

use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::error::AppError;
use crate::notify::NotificationDispatcher;
use crate::registry::{self, FirmwareRecord, SharedRegistry};
use crate::reports::{OtaStatus, ReportStore};
use crate::service::{FirmwareService, ReportInput, UploadMeta};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FirmwareService>,
    pub notifier: Arc<NotificationDispatcher>,
    pub config: Arc<Config>,
}

fn log_startup_folders(config: &Config) {
    let cwd = std::env::current_dir().ok();
    let exe = std::env::current_exe().ok();
    info!(
        target: "startup",
        "otahub starting. cwd={:?}, exe={:?}, data_root='{}' (exists={}), max_firmware_bytes={}, push_configured={}",
        cwd,
        exe,
        config.data_root.display(),
        config.data_root.exists(),
        config.max_firmware_bytes,
        config.fcm.is_some()
    );
}

/// Log the published inventory on startup: row count and the active version.
fn print_published_inventory(registry: &SharedRegistry) {
    let guard = registry.0.lock();
    match guard.all() {
        Ok(rows) if rows.is_empty() => {
            info!(target: "startup", "No firmware published yet");
        }
        Ok(rows) => {
            let active = rows.iter().find(|r| r.is_active).map(|r| r.version.clone());
            info!(
                target: "startup",
                "{} firmware version(s) published, active={}",
                rows.len(),
                active.unwrap_or_else(|| "<none>".to_string())
            );
        }
        Err(e) => {
            tracing::warn!(target: "startup", "Failed to read registry inventory: {:#}", e);
        }
    }
}

/// Start the otahub HTTP server bound to the configured port.
pub async fn run(config: Config) -> anyhow::Result<()> {
    log_startup_folders(&config);

    std::fs::create_dir_all(&config.data_root)
        .with_context(|| format!("Failed to create or access data root: {}", config.data_root.display()))?;
    let registry = SharedRegistry::new(config.registry_path())
        .with_context(|| format!("While opening registry under: {}", config.data_root.display()))?;
    let artifacts = ArtifactStore::new(config.firmware_dir())?;
    let reports = ReportStore::new(config.reports_dir())?;
    print_published_inventory(&registry);

    let service = Arc::new(FirmwareService::new(
        registry,
        artifacts,
        reports,
        config.max_firmware_bytes,
    ));
    let notifier = Arc::new(NotificationDispatcher::new(&config));
    let http_port = config.http_port;
    let state = AppState { service, notifier, config: Arc::new(config) };

    let app = router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    // Leave headroom above the firmware cap for the other multipart fields;
    // the artifact writer enforces the real limit while streaming.
    let body_limit = state.config.max_firmware_bytes as usize + (1 << 20);
    Router::new()
        .route("/", get(|| async { "otahub ok" }))
        .route("/api/firmware/latest", get(latest_firmware))
        .route("/api/firmware/download", get(download_firmware))
        .route("/api/firmware/upload", post(upload_firmware))
        .route("/api/firmware/report", post(report_ota_status))
        .route("/api/firmware/reports", get(list_reports))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn err_response(err: AppError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(json!({
        "status": "error",
        "code": err.code_str(),
        "message": err.message()
    }));
    if matches!(err, AppError::Auth { .. }) {
        let mut headers = HeaderMap::new();
        headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
        (status, headers, body).into_response()
    } else {
        (status, body).into_response()
    }
}

/// Registry record as the public metadata JSON, with the download URL added.
fn metadata_json(rec: &FirmwareRecord, config: &Config) -> serde_json::Value {
    let mut v = serde_json::to_value(rec).unwrap_or_else(|_| json!({}));
    if let Some(obj) = v.as_object_mut() {
        obj.insert("url".to_string(), json!(config.download_url()));
    }
    v
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Validate the `Authorization: Basic` header against the configured admin
/// credentials.
fn check_admin(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let denied = || AppError::auth("invalid_credentials".to_string(), "Invalid admin credentials".to_string());
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(denied)?;
    let encoded = value.strip_prefix("Basic ").ok_or_else(denied)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(denied)?;
    let (user, pass) = decoded.split_once(':').ok_or_else(denied)?;
    let user_ok = constant_time_eq(user.as_bytes(), config.admin_user.as_bytes());
    let pass_ok = constant_time_eq(pass.as_bytes(), config.admin_pass.as_bytes());
    if user_ok && pass_ok {
        Ok(())
    } else {
        Err(denied())
    }
}

async fn latest_firmware(State(state): State<AppState>) -> Response {
    match state.service.latest() {
        Ok(rec) => (StatusCode::OK, Json(metadata_json(&rec, &state.config))).into_response(),
        Err(e) => err_response(e),
    }
}

enum ByteRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a single `bytes=` range against the artifact length. Multi-range
/// requests are answered with the full body, which RFC 9110 permits.
fn parse_byte_range(value: &str, len: u64) -> ByteRange {
    let Some(spec) = value.strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((a, b)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    if a.is_empty() {
        // suffix form: last N bytes
        let Ok(n) = b.trim().parse::<u64>() else {
            return ByteRange::Full;
        };
        if n == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        let start = len.saturating_sub(n);
        return ByteRange::Partial { start, end: len - 1 };
    }
    let Ok(start) = a.trim().parse::<u64>() else {
        return ByteRange::Full;
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    let end = if b.trim().is_empty() {
        len - 1
    } else {
        match b.trim().parse::<u64>() {
            Ok(e) => e.min(len - 1),
            Err(_) => return ByteRange::Full,
        }
    };
    if start > end {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial { start, end }
}

/// Stream up to `remaining` bytes from an open artifact in 64 KiB reads, so
/// downloads never buffer the whole binary.
fn file_stream(
    file: tokio::fs::File,
    remaining: u64,
) -> impl futures_util::Stream<Item = std::io::Result<Vec<u8>>> {
    futures_util::stream::unfold((file, remaining), |(mut f, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let cap = remaining.min(64 * 1024) as usize;
        let mut buf = vec![0u8; cap];
        match f.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                let left = remaining - n as u64;
                Some((Ok(buf), (f, left)))
            }
            Err(e) => Some((Err(e), (f, 0))),
        }
    })
}

async fn download_firmware(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (rec, mut file, len) = match state.service.resolve_download().await {
        Ok(x) => x,
        Err(e) => return err_response(e),
    };

    let etag = format!("\"{}\"", rec.checksum);
    if let Some(tag) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if tag.trim() == etag || tag.trim() == "*" {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, etag.as_str())
                .header("X-Firmware-Version", rec.version.as_str())
                .header("X-Firmware-Checksum", rec.checksum.as_str())
                .header("X-Firmware-Size", rec.file_size.to_string())
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_byte_range(v, len))
        .unwrap_or(ByteRange::Full);

    let (status, start, count, content_range) = match range {
        ByteRange::Full => (StatusCode::OK, 0u64, len, None),
        ByteRange::Partial { start, end } => (
            StatusCode::PARTIAL_CONTENT,
            start,
            end - start + 1,
            Some(format!("bytes {}-{}/{}", start, end, len)),
        ),
        ByteRange::Unsatisfiable => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", len))
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    };

    if start > 0 {
        if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
            return err_response(AppError::io(
                "storage_error".to_string(),
                format!("Failed to seek artifact for version {}: {}", rec.version, e),
            ));
        }
    }

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, count)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag.as_str())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", rec.filename),
        )
        .header("X-Firmware-Version", rec.version.as_str())
        .header("X-Firmware-Checksum", rec.checksum.as_str())
        .header("X-Firmware-Size", rec.file_size.to_string());
    if let Some(cr) = content_range {
        builder = builder.header(header::CONTENT_RANGE, cr);
    }
    builder
        .body(Body::from_stream(file_stream(file, count)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn multipart_err(e: axum::extract::multipart::MultipartError) -> AppError {
    AppError::user("bad_upload".to_string(), format!("Malformed multipart body: {}", e))
}

async fn handle_upload(state: &AppState, multipart: &mut Multipart) -> Result<FirmwareRecord, AppError> {
    let svc = &state.service;
    let mut version: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut release_notes: Option<String> = None;
    let mut rollout_percent: i64 = 100;
    let mut writer: Option<crate::artifacts::ArtifactWriter> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_err)? {
        match field.name().map(|s| s.to_string()).as_deref() {
            Some("version") => {
                let v = field.text().await.map_err(multipart_err)?;
                let v = v.trim().to_string();
                // Fail fast, ideally before the binary field is streamed at
                // all; the registry re-validates at commit regardless.
                registry::validate_version(&v)?;
                svc.ensure_version_free(&v)?;
                version = Some(v);
            }
            Some("release_notes") => {
                let t = field.text().await.map_err(multipart_err)?;
                if !t.trim().is_empty() {
                    release_notes = Some(t);
                }
            }
            Some("rollout_percent") => {
                let t = field.text().await.map_err(multipart_err)?;
                rollout_percent = t.trim().parse().map_err(|_| {
                    AppError::user(
                        "invalid_rollout_percent".to_string(),
                        format!("rollout_percent must be an integer, got '{}'", t.trim()),
                    )
                })?;
            }
            Some("file") => {
                filename = field.file_name().map(|s| s.to_string());
                if let Some(name) = &filename {
                    if !name.ends_with(".bin") {
                        return Err(AppError::user(
                            "invalid_file_type".to_string(),
                            "Invalid file type. Only .bin files are allowed.".to_string(),
                        ));
                    }
                }
                let mut w = svc.begin_artifact().await?;
                while let Some(chunk) = field.chunk().await.map_err(multipart_err)? {
                    w.write_chunk(&chunk).await?;
                }
                writer = Some(w);
            }
            _ => {}
        }
    }

    let version = version.ok_or_else(|| {
        AppError::user("missing_field".to_string(), "Form field 'version' is required".to_string())
    })?;
    let writer = writer.ok_or_else(|| {
        AppError::user("missing_field".to_string(), "Form field 'file' is required".to_string())
    })?;

    let meta = UploadMeta {
        version: version.clone(),
        filename,
        release_notes,
        rollout_percent,
    };
    svc.validate_upload(&meta)?;
    // Covers the file-before-version field ordering, where the early
    // pre-check could not run.
    svc.ensure_version_free(&version)?;
    let stored = writer.finish(&version).await?;
    svc.commit_upload(stored, meta).await
}

async fn upload_firmware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(e) = check_admin(&state.config, &headers) {
        return err_response(e);
    }
    match handle_upload(&state, &mut multipart).await {
        Ok(rec) => {
            // Post-commit fan-out: spawned with its own error boundary so a
            // slow or failing push provider cannot affect this response.
            let notifier = state.notifier.clone();
            let version = rec.version.clone();
            let notes = rec.release_notes.clone();
            tokio::spawn(async move {
                notifier.notify_new_version(&version, notes.as_deref()).await;
            });
            (
                StatusCode::CREATED,
                Json(json!({
                    "status": "ok",
                    "message": format!("Firmware {} uploaded successfully", rec.version),
                    "data": metadata_json(&rec, &state.config)
                })),
            )
                .into_response()
        }
        Err(e) => err_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    device_id: String,
    firmware_version: String,
    status: OtaStatus,
    error_message: Option<String>,
    progress_percent: Option<i64>,
    ip_address: Option<String>,
}

async fn report_ota_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rej) => {
            return err_response(AppError::user(
                "bad_report".to_string(),
                format!("Malformed report: {}", rej.body_text()),
            ));
        }
    };
    let input = ReportInput {
        device_id: req.device_id,
        firmware_version: req.firmware_version,
        status: req.status,
        error_message: req.error_message,
        progress_percent: req.progress_percent,
        ip_address: req.ip_address,
    };
    match state.service.record_report(input, Some(addr.ip().to_string())) {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "message": "OTA status reported successfully"})),
        )
            .into_response(),
        Err(e) => err_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReportsQuery {
    device_id: Option<String>,
    firmware_version: Option<String>,
    limit: Option<usize>,
}

async fn list_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ReportsQuery>,
) -> Response {
    if let Err(e) = check_admin(&state.config, &headers) {
        return err_response(e);
    }
    let limit = q.limit.unwrap_or(100).min(1000);
    match state
        .service
        .list_reports(q.device_id.as_deref(), q.firmware_version.as_deref(), limit)
    {
        Ok(rows) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "count": rows.len(), "reports": rows})),
        )
            .into_response(),
        Err(e) => err_response(e),
    }
}
