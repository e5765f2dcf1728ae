//! taichid - TaiChi Daemon
//!
//! Serves the administration API, the metrics stream and the web terminal
//! from a single listener.
//!
//! Usage:
//!   taichid [OPTIONS] [settings.toml]
//!
//! Exit status is 0 after an interrupt, 2 when the listener cannot be
//! bound and 1 on any other failure.

mod settings;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use taichi_apps::{AdminApp, MonitorApp, TerminalApp, RELEASE};
use taichi_config::ConfigStore;
use taichi_core::{GatewayError, MountedApplication, StopReason};
use taichi_gateway::GatewayServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::{config_path, DaemonSettings, Overrides};

const LOGO: &str = r"
 ███████████            ███    █████████  █████       ███        ███████     █████████
░█░░░███░░░█           ░░░    ███░░░░░███░░███       ░░░       ███░░░░░███  ███░░░░░███
░   ░███  ░   ██████   ████  ███     ░░░  ░███████   ████     ███     ░░███░███    ░░░
    ░███     ░░░░░███ ░░███ ░███          ░███░░███ ░░███    ░███      ░███░░█████████
    ░███      ███████  ░███ ░███          ░███ ░███  ░███    ░███      ░███ ░░░░░░░░███
    ░███     ███░░███  ░███ ░░███     ███ ░███ ░███  ░███    ░░███     ███  ███    ░███
    █████   ░░████████ █████ ░░█████████  ████ █████ █████    ░░░███████░  ░░█████████
   ░░░░░     ░░░░░░░░ ░░░░░   ░░░░░░░░░  ░░░░ ░░░░░ ░░░░░       ░░░░░░░     ░░░░░░░░░
";

#[derive(Parser)]
#[command(name = "taichid")]
#[command(author, version, about = "TaiChi daemon")]
struct Args {
    /// Daemon settings file (TOML)
    settings: Option<PathBuf>,

    /// Application configuration file (JSON), created if missing
    #[arg(short, long, env = "TAICHI_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long, env = "TAICHI_ADDRESS")]
    address: Option<IpAddr>,

    /// Bind port
    #[arg(short, long, env = "TAICHI_PORT")]
    port: Option<u16>,

    /// Seconds in-flight connections get to finish after shutdown starts
    #[arg(long)]
    grace_period: Option<u64>,

    /// Shell started by the web terminal
    #[arg(long)]
    shell: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "taichid=info,taichi_gateway=info,taichi_config=info,taichi_apps=info,tower_http=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(StopReason::Interrupted) => {
            tracing::info!("Interrupted, gateway stopped cleanly");
            ExitCode::SUCCESS
        }
        Ok(reason) => {
            tracing::info!(%reason, "Gateway stopped");
            ExitCode::SUCCESS
        }
        Err(err) => match err.downcast_ref::<GatewayError>() {
            Some(gateway_err @ GatewayError::Bind { .. }) => {
                tracing::error!(
                    error = %gateway_err,
                    hint = gateway_err.bind_hint().unwrap_or_default(),
                    "Failed to bind listener"
                );
                ExitCode::from(2)
            }
            _ => {
                tracing::error!(error = ?err, "Unexpected failure");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(args: Args) -> anyhow::Result<StopReason> {
    let mut settings = match &args.settings {
        Some(path) => {
            tracing::info!("Loading settings from: {}", path.display());
            DaemonSettings::load(path)?
        }
        None => DaemonSettings::default(),
    };
    Overrides {
        address: args.address,
        port: args.port,
        grace_period_secs: args.grace_period,
        shell: args.shell,
    }
    .apply(&mut settings);

    let store = ConfigStore::new(config_path(args.config));

    let mut server = GatewayServer::new(settings.server.clone());
    let config = server.configure(&store)?;

    server
        .mount(
            "/webssh/.*",
            MountedApplication::stream("terminal", TerminalApp::new(settings.terminal)),
        )?
        .mount(
            "/ws/.*",
            MountedApplication::stream("monitor", MonitorApp::new(settings.monitor)),
        )?
        .mount(
            ".*",
            MountedApplication::request_response("admin", AdminApp::new(config)),
        )?;

    let gateway = server.bind().await?;

    tracing::info!("{}", LOGO);
    tracing::info!(
        version = RELEASE,
        addr = %gateway.local_addr(),
        "TaiChi started, listening on http://{}",
        gateway.local_addr()
    );

    Ok(gateway.serve(shutdown_signal()).await?)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
