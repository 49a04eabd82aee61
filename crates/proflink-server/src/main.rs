use anyhow::{Context, Result, bail};
use clap::Parser;
use proflink_server::RelayConfig;
use proflink_server::http;
use proflink_store::{DynArtifactStore, HranaConfig, HranaStore, SqliteStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "proflink", version, about = "On-demand profile viewer relay")]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Path prefix routed to viewer sessions.
    #[arg(long, default_value = "/profile")]
    route_prefix: String,

    /// Viewer executable, resolved through PATH.
    #[arg(long, default_value = "samply")]
    viewer_bin: String,

    /// Directory of prebuilt dashboard assets; omit to disable static serving.
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Directory staging dirs are created under (default: system temp dir).
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Seconds a session lives after registration.
    #[arg(long, default_value_t = 5)]
    session_ttl_secs: u64,

    /// Seconds allowed per proxied request.
    #[arg(long, default_value_t = 5)]
    request_timeout_secs: u64,

    /// Seconds to wait for a fresh viewer to announce itself.
    #[arg(long, default_value_t = 5)]
    probe_timeout_secs: u64,

    /// Milliseconds between discovery probes.
    #[arg(long, default_value_t = 100)]
    probe_interval_ms: u64,

    /// Directory of local `<db>.db` SQLite files.
    #[arg(long, conflicts_with = "db_url_template")]
    db_dir: Option<PathBuf>,

    /// Remote database URL template with a `{db}` placeholder,
    /// e.g. `libsql://{db}-myorg.turso.io`.
    #[arg(long)]
    db_url_template: Option<String>,

    /// Bearer token for the remote database.
    #[arg(long, env = "TURSO_DB_AUTH_TOKEN", hide_env_values = true)]
    db_auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();
    let cli = Cli::parse();

    let store = build_store(&cli)?;
    let config = RelayConfig {
        bind: cli.bind,
        route_prefix: normalize_prefix(&cli.route_prefix),
        viewer_bin: cli.viewer_bin.clone(),
        work_root: cli.work_root.clone().unwrap_or_else(std::env::temp_dir),
        assets_dir: cli.assets_dir.clone(),
        session_ttl: Duration::from_secs(cli.session_ttl_secs),
        request_timeout: Duration::from_secs(cli.request_timeout_secs),
        probe_timeout: Duration::from_secs(cli.probe_timeout_secs),
        probe_interval: Duration::from_millis(cli.probe_interval_ms),
    };
    http::serve(config, store).await
}

fn build_store(cli: &Cli) -> Result<DynArtifactStore> {
    match (&cli.db_dir, &cli.db_url_template) {
        (Some(dir), None) => Ok(Arc::new(SqliteStore::new(dir))),
        (None, Some(template)) => {
            let auth_token = cli
                .db_auth_token
                .clone()
                .context("--db-url-template needs --db-auth-token or TURSO_DB_AUTH_TOKEN")?;
            Ok(Arc::new(HranaStore::new(HranaConfig {
                url_template: template.clone(),
                auth_token,
                timeout: Duration::from_secs(30),
            })))
        }
        _ => bail!("select exactly one of --db-dir or --db-url-template"),
    }
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Set up tracing subscriber for daemon logging.
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
