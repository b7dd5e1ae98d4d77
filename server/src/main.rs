//! VibeTunnel server binary: loads config (file -> env -> CLI, spec §6.6), builds
//! `AppState`, and serves the route surface until a shutdown signal arrives.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vibetunnel_server::routes::router;
use vibetunnel_server::state::AppState;
use vt_core::config::{ensure_rustls_provider, Config};

/// VibeTunnel: a multiplexed PTY server.
#[derive(Debug, Parser)]
#[command(name = "vibetunnel-server", version)]
struct Cli {
    /// Path to a JSON settings file (missing file falls back to defaults).
    #[arg(long, default_value = "settings.json")]
    config: PathBuf,

    #[arg(long, env = "VT_ROOT")]
    root: Option<PathBuf>,

    #[arg(long, env = "VT_BIND_ADDR")]
    bind_addr: Option<String>,

    #[arg(long, env = "VT_PORT")]
    port: Option<u16>,

    /// Run as an HQ node: aggregates sessions across registered remotes (spec §4.7).
    #[arg(long, env = "VT_IS_HQ")]
    is_hq: bool,

    /// Bearer token this node presents when registering with its own HQ.
    #[arg(long, env = "VT_REMOTE_TOKEN")]
    remote_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    ensure_rustls_provider();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config);
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.is_hq {
        config.is_hq = true;
    }
    if cli.remote_token.is_some() {
        config.remote_token = cli.remote_token;
    }

    let bind_addr = config.bind_addr.clone();
    let port = config.port;
    let state = AppState::new(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((bind_addr.as_str(), port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "vibetunnel server listening");

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let serve = tokio::spawn(
        axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = drain_rx.await;
        }),
    );

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining connections");
    let _ = drain_tx.send(());

    // spec §5: give in-flight connections (SSE streams, WebSocket sessions) 5s to drain,
    // then force-close rather than hang indefinitely.
    match tokio::time::timeout(Duration::from_secs(5), serve).await {
        Ok(result) => result??,
        Err(_) => tracing::warn!("graceful drain window elapsed, forcing shutdown"),
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            return;
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
