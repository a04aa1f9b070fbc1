/// exitpool - one worker per exit node
///
/// Connects to the local anonymizing-network daemon's control port, builds a
/// two-hop circuit to every exit relay, pins a worker's traffic to each and
/// restores the daemon's configuration when the run ends.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use exitpool_common::{PoolConfig, PoolError};
use exitpool_core::{PoolController, RunSummary, Shutdown};
use exitpool_daemon::{FetchWorkerFactory, LogStatistics, TorControlLink};

/// Configuration file used when `--config` is not given
const DEFAULT_CONFIG_PATH: &str = "exitpool.toml";

/// Pause between runs in loop mode after a failed run
const LOOP_RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = std::env::args().skip(1);
    let mut command = None;
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("--config needs a file path"))?;
                config_path = Some(PathBuf::from(path));
            }
            _ if command.is_none() => command = Some(arg),
            _ => {
                eprintln!("Unexpected argument: {}", arg);
                eprintln!("Run with 'help' to see available commands");
                std::process::exit(1);
            }
        }
    }

    match command.as_deref().unwrap_or("run") {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-v" => {
            println!("exitpool v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "run" => {
            let config = load_config(config_path.as_deref())?;
            run_once_mode(config).await
        }
        "loop" => {
            let config = load_config(config_path.as_deref())?;
            run_loop_mode(config).await
        }
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PoolConfig> {
    if let Some(path) = path {
        info!("Loading configuration from {:?}", path);
        return Ok(PoolConfig::from_file(path)?);
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        info!("Loading configuration from {:?}", default_path);
        return Ok(PoolConfig::from_file(&default_path)?);
    }

    info!("No configuration file found, using defaults");
    let config = PoolConfig::default();
    if let Err(e) = config.to_file(&default_path) {
        warn!("Failed to save default config: {}", e);
    } else {
        info!("Saved default configuration to {:?}", default_path);
    }
    Ok(config)
}

/// Trigger `shutdown` on Ctrl-C
fn install_interrupt_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.trigger();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });
}

async fn run_pool(config: &PoolConfig, shutdown: &Shutdown) -> Result<RunSummary, PoolError> {
    let link = tokio::select! {
        _ = shutdown.wait() => return Err(PoolError::Cancelled),
        link = TorControlLink::connect(&config.control) => {
            link.map_err(|e| PoolError::control(format!("cannot reach control port: {}", e)))?
        }
    };

    let factory = FetchWorkerFactory::new(config.workers.clone(), shutdown.clone());
    let mut pool = PoolController::new(Arc::new(link), config.clone(), Arc::new(factory))
        .with_statistics(Arc::new(LogStatistics::new(config.stats.interval())))
        .with_shutdown(shutdown.clone());

    pool.run_once().await
}

async fn run_once_mode(config: PoolConfig) -> Result<()> {
    info!("Starting exitpool v{}", env!("CARGO_PKG_VERSION"));
    let shutdown = Shutdown::new();
    install_interrupt_handler(shutdown.clone());

    match run_pool(&config, &shutdown).await {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(PoolError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Repeat runs until interrupted
async fn run_loop_mode(config: PoolConfig) -> Result<()> {
    info!("Starting exitpool v{} in loop mode", env!("CARGO_PKG_VERSION"));
    let shutdown = Shutdown::new();
    install_interrupt_handler(shutdown.clone());

    let mut runs = 0u64;
    while !shutdown.is_triggered() {
        runs += 1;
        info!("Run {} starting", runs);

        match run_pool(&config, &shutdown).await {
            Ok(summary) => print_summary(&summary),
            Err(PoolError::Cancelled) => break,
            Err(e) => {
                warn!("Run {} failed: {}", runs, e);
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(LOOP_RETRY_DELAY) => {}
                }
            }
        }
    }

    info!("exitpool stopped after {} runs", runs);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\n========================================");
    println!("         exitpool Run Summary");
    println!("========================================");
    println!("Exit nodes:       {}", summary.exit_nodes);
    println!("Workers launched: {}", summary.launched.len());
    println!("Nodes skipped:    {}", summary.skipped.len());
    println!("Worker errors:    {}", summary.worker_errors);
    for (fingerprint, reason) in &summary.skipped {
        println!("  {}  {}", fingerprint, reason);
    }
    println!("========================================\n");
}

fn print_help() {
    println!("exitpool - one worker per exit node");
    println!();
    println!("USAGE:");
    println!("    exitpool [COMMAND] [--config <path>]");
    println!();
    println!("COMMANDS:");
    println!("    run         Run one pass over every exit node (default)");
    println!("    loop        Repeat runs until interrupted");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <path>   Configuration file (default: {})", DEFAULT_CONFIG_PATH);
    println!();
    println!("REQUIREMENTS:");
    println!("    Control port: 127.0.0.1:9051 (or a unix socket, see config)");
    println!("    SOCKS proxy:  127.0.0.1:9050 with IsolateSOCKSAuth");
    println!();
    println!("LOGGING:");
    println!("    RUST_LOG=debug exitpool run");
}
