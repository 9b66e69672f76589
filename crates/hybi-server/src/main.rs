//! hybi-server - WebSocket relay
//!
//! Accepts hybi-10 WebSocket clients and rebroadcasts every message it
//! receives to all connected clients.

mod relay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hybi_config::{ConfigLoader, DEFAULT_ENV_PREFIX};
use hybi_ws::WebSocketServer;
use tracing::{error, info};

use crate::relay::RelayDelegate;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("hybi-server {VERSION}");
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r"hybi-server - WebSocket relay

USAGE:
    hybi-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML or JSON)
    -h, --help             Print help information
    -v, --version          Print version information

Without --config, ./hybi.toml is loaded if present.

ENVIRONMENT VARIABLES:
    HYBI__SERVER__BIND_ADDR              Bind address (default: 0.0.0.0)
    HYBI__SERVER__PORT                   Listen port (default: 9000)
    HYBI__SERVER__MAX_CONNECTIONS        Connection limit (default: 10000)
    HYBI__WEBSOCKET__HANDSHAKE_TIMEOUT_MS Handshake deadline (default: 10000)
    HYBI__LOGGING__LEVEL                 Log filter (default: info)
    HYBI__METRICS__ENABLED               Serve Prometheus metrics (default: false)
    RUST_LOG                             Overrides the configured log filter

EXAMPLES:
    hybi-server --config /etc/hybi/hybi.toml
    HYBI__SERVER__PORT=8080 hybi-server
"
    );
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!(error = format!("{e:#}"), "hybi-server failed");
        eprintln!("hybi-server: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let loader = ConfigLoader::new().with_dotenv();
    let loader = match &args.config {
        Some(path) => loader
            .with_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => loader.with_optional_file("hybi.toml")?,
    };
    let config = loader
        .with_env_prefix(DEFAULT_ENV_PREFIX)
        .load()
        .context("invalid configuration")?;

    hybi_telemetry::init_telemetry(&config.to_telemetry_config())
        .context("failed to initialise telemetry")?;

    let relay = Arc::new(RelayDelegate);
    let server = WebSocketServer::start_with_config(config.to_server_config()?, &relay)
        .await
        .context("failed to start server")?;
    info!(addr = %server.local_addr(), version = VERSION, "hybi-server started");

    let outcome = tokio::select! {
        result = server.wait() => result.context("listener stopped"),
        () = wait_for_os_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    server.shutdown().await;
    let stats = server.stats();
    info!(
        total_accepted = stats.total_accepted,
        total_rejected = stats.total_rejected,
        handshake_failures = stats.handshake_failures,
        frame_failures = stats.frame_failures,
        "hybi-server stopped"
    );

    outcome
}

/// Waits for SIGTERM or SIGINT. Only Ctrl+C is available off Unix.
async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to register signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
