use anyhow::{Context as _, Result};
use buckley_core::config::{ConfigOverrides, DaemonConfig};
use buckley_core::store::sqlite::SqliteStore;
use buckley_core::{identity, transport, AppContext};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "buckleyd", about = "Buckley control-plane daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// `host:port` for the listener.
    #[arg(long, env = "BUCKLEY_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Data directory for config, SQLite database, and session state.
    #[arg(long, env = "BUCKLEY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Static bearer token; non-empty enables operator-scoped builtin auth.
    #[arg(long, env = "BUCKLEY_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Deny unauthenticated requests (exempt: `/healthz`, and `/metrics` iff public).
    #[arg(long, env = "BUCKLEY_REQUIRE_TOKEN")]
    require_token: Option<bool>,

    /// Expose `/metrics` without auth.
    #[arg(long, env = "BUCKLEY_PUBLIC_METRICS")]
    public_metrics: Option<bool>,

    /// Absolute path used as the workspace base.
    #[arg(long, env = "BUCKLEY_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Overrides request-derived base URL for building CLI-login links.
    #[arg(long, env = "BUCKLEY_EXTERNAL_URL")]
    external_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "BUCKLEY_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily), in addition to stdout.
    #[arg(long, env = "BUCKLEY_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default when no subcommand is given).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Serve) | None => run_server(args).await,
    }
}

async fn run_server(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "buckleyd starting");

    let overrides = ConfigOverrides {
        bind_address: args.bind_address,
        auth_token: args.auth_token,
        require_token: args.require_token,
        public_metrics: args.public_metrics,
        project_root: args.project_root,
        external_url: args.external_url,
        log_level: args.log.clone(),
        log_file: args.log_file,
        data_dir: args.data_dir,
        ..Default::default()
    };

    let config = Arc::new(DaemonConfig::new(overrides).context("invalid configuration")?);
    info!(
        data_dir = %config.data_dir.display(),
        bind_address = %config.bind_address,
        rpc_path = %config.rpc_path,
        "config loaded"
    );

    let store = Arc::new(
        SqliteStore::new(&config.data_dir)
            .await
            .context("failed to open SQLite store")?,
    );
    let db_pool = store.pool().clone();

    let daemon_id = identity::compute_daemon_id();
    info!(daemon_id = %daemon_id, "daemon identity ready");

    let ctx = Arc::new(AppContext::new(config, store, daemon_id, Some(db_pool)));

    transport::run(ctx).await
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to
/// both stdout and a daily-rolling file. Returns a `WorkerGuard` that
/// must stay alive for the process lifetime.
///
/// Falls back to stdout-only logging with a warning if the log directory
/// can't be created — never panics.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("buckleyd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
