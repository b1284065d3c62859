//! anvil CLI - Main entry point

mod cli;
mod commands;
mod console;
mod prompt_ui;

use anvil_foundation::{AbortSignal, AnvilConfig};
use anvil_workspace::WorkspaceService;
use clap::Parser;
use cli::Args;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn resolve_project(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = match arg {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    // canonical so session keys don't depend on how the path was spelled
    std::fs::canonicalize(&path)
        .map_err(|e| anyhow::anyhow!("project directory {}: {}", path.display(), e))
}

/// First Ctrl-C aborts the running operation, the second exits
fn spawn_interrupt_handler(abort: AbortSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\ninterrupted, cleaning up (Ctrl-C again to force)");
        abort.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let project = resolve_project(args.project)?;
    let settings = AnvilConfig::load(&project).unwrap_or_else(|e| {
        warn!("failed to load config, using defaults: {}", e);
        AnvilConfig::new()
    });
    debug!(project = %project.display(), "starting");

    let service = WorkspaceService::open(settings, &project);
    let abort = AbortSignal::new();
    spawn_interrupt_handler(abort.clone());
    let responder = prompt_ui::spawn_responder(service.prompts().clone());

    let result = commands::run(args.command, &service, abort).await;

    service.prompts().dispose();
    responder.abort();
    result
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(args));
    // a prompt reader may still be blocked on stdin
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}
