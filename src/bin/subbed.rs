#![forbid(unsafe_code)]

//! HTTP server for the subtitle catalog.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use subbed::{
    catalog::CatalogStore,
    config::{self, Config, Overrides},
    http::{self, AppState},
    service::Subbed,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve subtitles for YouTube videos.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", help = "Optional TOML config file")]
    config: Option<PathBuf>,
    #[arg(long = "database", value_name = "PATH", help = "SQLite database path")]
    database: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Address to bind")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Port to listen on")]
    port: Option<u16>,
    #[arg(
        long = "static-root",
        value_name = "PATH",
        help = "Directory holding index.html, admin.html and assets"
    )]
    static_root: Option<PathBuf>,
    #[arg(long = "debug", help = "Verbose logging")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(
        cli.config.as_deref(),
        Overrides {
            database_path: cli.database,
            host: cli.host,
            port: cli.port,
            static_root: cli.static_root,
            debug: cli.debug,
        },
    )
    .context("loading configuration")?;

    init_tracing(&cfg);
    run(cfg).await
}

fn init_tracing(cfg: &Config) {
    let default_level = if cfg.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}

async fn run(cfg: Config) -> Result<()> {
    let store = CatalogStore::open_with_timeout(&cfg.database_path, cfg.busy_timeout)
        .context("initializing catalog")?
        .with_span(info_span!("catalog", db = %cfg.database_path.display()));

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        Subbed::new(store),
        cfg.credentials.clone(),
        cfg.static_root.clone(),
        cfg.request_timeout,
        shutdown.clone(),
    );
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind((cfg.host.as_str(), cfg.port))
        .await
        .with_context(|| format!("binding to {}:{}", cfg.host, cfg.port))?;
    let addr = listener.local_addr().context("reading bound address")?;
    info!(%addr, static_root = %cfg.static_root.display(), "server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("running HTTP server")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
        return;
    }
    info!("shutdown requested");
    shutdown.cancel();
}
