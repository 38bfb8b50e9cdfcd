use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};

mod config;
mod errors;
mod logs;
mod reconcile;
mod remedy;
mod supervisor;

use config::GuardConfig;
use reconcile::{PortBackend, ProcfsBackend};
use remedy::RemedyEngine;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "portguard",
    version,
    about = "Supervises a local dev server: keeps its port clear, restarts it on crashes, and remediates known failures from its logs."
)]
struct Cli {
    /// Target port the server is expected to bind.
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Working directory for the server process and its log sources.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Reconcile the port, launch the server, and supervise it in the
    /// foreground until SIGINT/SIGTERM.
    Start,
    /// Run one remediation cycle over the log sources and exit.
    Scan,
    /// Clear the target port of any conflicting listener and exit.
    Reconcile,
    /// Report who (if anyone) is listening on the target port.
    Status,
}

fn resolve_config(cli: &Cli) -> GuardConfig {
    let mut cfg = GuardConfig::from_env();
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(cwd) = &cli.cwd {
        cfg.cwd = cwd.clone();
    }
    cfg
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

async fn run_supervised(cfg: GuardConfig) -> anyhow::Result<()> {
    let supervisor = Arc::new(Supervisor::new(cfg.clone()));

    // A failed launch is fatal for the invocation (non-zero exit), but the
    // supervisor itself never panics over it.
    supervisor.start().await?;
    let status = supervisor.status().await;
    tracing::info!(
        port = status.port,
        "server running at http://localhost:{}",
        status.port
    );

    tokio::spawn(supervisor.clone().monitor());

    let engine = Arc::new(RemedyEngine::new(supervisor.clone()).await);
    {
        let engine = engine.clone();
        let interval = cfg.remedy_poll;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.run_cycle().await;
            }
        });
    }

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, stopping server");
    supervisor.stop(cfg.stop_grace).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = resolve_config(&cli);

    match cli.command {
        Cmd::Start => run_supervised(cfg).await,
        Cmd::Scan => {
            let supervisor = Arc::new(Supervisor::new(cfg));
            let engine = RemedyEngine::new(supervisor).await;
            let handled = engine.run_cycle().await;
            println!(
                "{}",
                serde_json::json!({
                    "newly_handled": handled,
                    "ledger_total": engine.ledger_len().await,
                })
            );
            Ok(())
        }
        Cmd::Reconcile => {
            let backend = ProcfsBackend;
            let cleared = reconcile::reconcile(&backend, cfg.port, cfg.settle_delay).await;
            println!(
                "{}",
                serde_json::json!({ "port": cfg.port, "cleared": cleared })
            );
            Ok(())
        }
        Cmd::Status => {
            let backend = ProcfsBackend;
            let owner = backend.find_owner(cfg.port);
            println!(
                "{}",
                serde_json::json!({ "port": cfg.port, "listener_pid": owner })
            );
            Ok(())
        }
    }
}
