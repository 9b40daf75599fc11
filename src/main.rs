mod config;
mod coordinator;
mod events;
mod monitor;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::coordinator::RootCoordinator;

/// Advertise third-party game servers on Xbox Live so console players can
/// join them from the Friends tab.
#[derive(Debug, Parser)]
#[command(name = "friend-connect", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "FRIEND_CONNECT_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Default log filter when RUST_LOG is not set.
    #[arg(long, default_value = "friend_connect=info,fc_auth=info,fc_live=info")]
    log_level: String,

    /// Emit structured JSON log lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );

    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            // Tracing is not up yet; this is the one message that may
            // have to go to stderr directly.
            eprintln!("fatal: {e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&args.log_level, args.log_json || config.log_json);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        servers = config.servers.len(),
        "starting friend-connect"
    );

    let mut coordinator = match RootCoordinator::new(config).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = coordinator.start().await {
        error!("startup failed: {e}");
        coordinator.stop().await;
        return ExitCode::from(1);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    match coordinator.run(shutdown_rx).await {
        Ok(()) => {
            info!("goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("coordinator failed: {e}");
            ExitCode::from(1)
        }
    }
}
