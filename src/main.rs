use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let config = otahub::config::Config::from_env()?;

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "otahub",
        "otahub starting: RUST_LOG='{}', http_port={}, data_root='{}', base_url='{}', max_firmware_bytes={}, push_configured={}",
        rust_log,
        config.http_port,
        config.data_root.display(),
        config.base_url,
        config.max_firmware_bytes,
        config.fcm.is_some()
    );

    otahub::server::run(config).await
}
