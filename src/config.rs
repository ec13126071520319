//! Process configuration, read once at startup from `OTAHUB_*` environment
//! variables. Credential rotation requires a restart.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Firebase service-account credentials for the push dispatcher.
///
/// All three fields must be present for notifications to be enabled; a
/// partially configured set disables the dispatcher with a warning rather
/// than failing startup.
#[derive(Debug, Clone)]
pub struct FcmCredentials {
    pub project_id: String,
    pub client_email: String,
    /// PKCS#8 RSA private key in PEM form.
    pub private_key_pem: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    /// Root folder for the registry table, report chunks and firmware binaries.
    pub data_root: PathBuf,
    /// External base URL used to build download links in metadata responses.
    pub base_url: String,
    /// Upload cap in bytes, enforced while streaming the multipart body.
    pub max_firmware_bytes: u64,
    pub admin_user: String,
    pub admin_pass: String,
    pub fcm: Option<FcmCredentials>,
    /// FCM topic addressed by the publish fan-out.
    pub fcm_topic: String,
    /// Timeout for each call to the push provider. Kept short so a slow
    /// provider cannot stall the upload response after the registry commit.
    pub notify_timeout: Duration,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let http_port: u16 = env_or("OTAHUB_HTTP_PORT", "7980")
            .parse()
            .context("OTAHUB_HTTP_PORT must be a port number")?;
        let data_root = PathBuf::from(env_or("OTAHUB_DATA_DIR", "data"));
        let base_url = env_or("OTAHUB_BASE_URL", &format!("http://localhost:{}", http_port))
            .trim_end_matches('/')
            .to_string();
        let max_firmware_bytes: u64 = env_or("OTAHUB_MAX_FIRMWARE_BYTES", "16777216")
            .parse()
            .context("OTAHUB_MAX_FIRMWARE_BYTES must be a byte count")?;

        let admin_user = env_or("OTAHUB_ADMIN_USER", "admin");
        let admin_pass = match std::env::var("OTAHUB_ADMIN_PASS") {
            Ok(p) => p,
            Err(_) => {
                warn!(target: "otahub::config", "OTAHUB_ADMIN_PASS not set; using default admin password");
                "admin".to_string()
            }
        };

        let fcm = Self::fcm_from_env()?;
        let fcm_topic = env_or("OTAHUB_FCM_TOPIC", "all_users");
        let notify_timeout = Duration::from_secs(
            env_or("OTAHUB_NOTIFY_TIMEOUT_SECS", "5")
                .parse()
                .context("OTAHUB_NOTIFY_TIMEOUT_SECS must be a number of seconds")?,
        );

        Ok(Config {
            http_port,
            data_root,
            base_url,
            max_firmware_bytes,
            admin_user,
            admin_pass,
            fcm,
            fcm_topic,
            notify_timeout,
        })
    }

    fn fcm_from_env() -> Result<Option<FcmCredentials>> {
        let project_id = std::env::var("OTAHUB_FCM_PROJECT_ID").ok();
        let client_email = std::env::var("OTAHUB_FCM_CLIENT_EMAIL").ok();
        // Key may be passed inline or as a file path; the file form is what
        // deployment scripts typically use.
        // Inline keys typically arrive with literal "\n" sequences from the
        // environment; normalize them back into real newlines.
        let private_key_pem = match std::env::var("OTAHUB_FCM_PRIVATE_KEY") {
            Ok(k) => Some(k.replace("\\n", "\n")),
            Err(_) => match std::env::var("OTAHUB_FCM_PRIVATE_KEY_FILE") {
                Ok(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read OTAHUB_FCM_PRIVATE_KEY_FILE: {}", path))?,
                ),
                Err(_) => None,
            },
        };
        match (project_id, client_email, private_key_pem) {
            (Some(project_id), Some(client_email), Some(private_key_pem)) => Ok(Some(FcmCredentials {
                project_id,
                client_email,
                private_key_pem,
            })),
            (None, None, None) => Ok(None),
            _ => {
                warn!(target: "otahub::config", "Incomplete FCM credentials (need project id, client email and private key); push notifications disabled");
                Ok(None)
            }
        }
    }

    /// Directory holding one write-once binary per published version.
    pub fn firmware_dir(&self) -> PathBuf { self.data_root.join("firmware") }

    /// Directory holding append-only report chunks.
    pub fn reports_dir(&self) -> PathBuf { self.data_root.join("reports") }

    /// The registry table file.
    pub fn registry_path(&self) -> PathBuf { self.data_root.join("firmware.parquet") }

    /// Public download URL advertised in metadata responses.
    pub fn download_url(&self) -> String { format!("{}/api/firmware/download", self.base_url) }
}
