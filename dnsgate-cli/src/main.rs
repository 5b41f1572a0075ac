//! ## dnsgate-cli
//! **Unified operational interface**
//! Dnsgate main entrypoint: runs the policy engine against the detected
//! firewall backend, validates configuration, and probes the host for
//! which backend would be selected.

use clap::Parser;
use dnsgate_telemetry::logging::EventLogger;
use dnsgate_telemetry::metrics::MetricsRecorder;

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    EventLogger::init();
    let metrics = MetricsRecorder::new();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => commands::run_engine(run_args, metrics).await,
        Commands::CheckConfig(check_args) => commands::check_config(check_args),
        Commands::DetectBackend => commands::detect_backend().await,
    }
}
