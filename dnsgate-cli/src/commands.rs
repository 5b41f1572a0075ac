use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use dnsgate_config::DnsgateConfig;
use dnsgate_core::{EventsHub, SystemClock};
use dnsgate_engine::PolicyEngine;
use dnsgate_firewall::{BackendKind, FirewallBackend};
use dnsgate_telemetry::metrics::MetricsRecorder;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the policy engine against the host firewall
    Run(RunArgs),
    /// Validate a configuration file, including every profile allow-list
    CheckConfig(CheckConfigArgs),
    /// Report which firewall backend this host would use
    DetectBackend,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Configuration file; when omitted the config/ hierarchy applies
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Use the in-process backend instead of mutating the kernel
    #[arg(long, default_value_t = false)]
    pub memory_backend: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    /// Configuration file; when omitted the config/ hierarchy applies
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

fn load(config: Option<PathBuf>) -> Result<DnsgateConfig, dnsgate_config::ConfigError> {
    match config {
        Some(path) => DnsgateConfig::load_from_path(path),
        None => DnsgateConfig::load(),
    }
}

/// Brings up the engine against the detected backend and holds it until
/// interrupted. VMs are armed and drained by the embedding manager over
/// the engine's API; this process owns the hub, the sweeps and telemetry.
pub async fn run_engine(
    args: RunArgs,
    metrics: MetricsRecorder,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = load(args.config)?;
    let timeout = Duration::from_secs(config.engine.backend_timeout_secs);

    let backend: Arc<dyn FirewallBackend> = if args.memory_backend {
        BackendKind::Memory.build(timeout)
    } else {
        BackendKind::detect(timeout).await?.build(timeout)
    };

    let hub = Arc::new(EventsHub::new(config.engine.hub_capacity)?);
    let mut lifecycle = hub.subscribe_lifecycle();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            info!(vm_id = %event.vm_id, phase = %event.phase, "vm lifecycle");
        }
    });

    let _engine = PolicyEngine::new(
        backend,
        Arc::clone(&hub),
        Arc::new(SystemClock),
        metrics.clone(),
        config.engine,
    );
    info!(profiles = config.profiles.len(), "dnsgate running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if let Ok(text) = metrics.gather_metrics() {
        info!(metrics = %text, "final metrics");
    }
    Ok(())
}

/// Loads and validates a configuration, compiling every profile so that
/// malformed allow-list entries fail here rather than at arm time.
pub fn check_config(
    args: CheckConfigArgs,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = load(args.config)?;
    println!(
        "configuration OK: {} profile(s), sweep every {}s",
        config.profiles.len(),
        config.engine.sweep_interval_secs
    );
    Ok(())
}

/// Probes the host and prints the backend `run` would select.
pub async fn detect_backend() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let kind = BackendKind::detect(Duration::from_secs(5)).await?;
    println!("{:?}", kind);
    Ok(())
}
