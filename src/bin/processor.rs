//! # Event Source Processor
//!
//! Runs every trigger in a processor configuration against the built-in
//! runtimes until interrupted, then stops them gracefully and prints the
//! checkpoints they returned.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use eventsource_core::config::ConfigLoader;
use eventsource_core::logging::init_structured_logging;
use eventsource_core::processor::Processor;
use eventsource_core::registry::Registries;

#[derive(Parser)]
#[command(name = "eventsource-processor")]
#[command(about = "Dispatch trigger events to function workers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: config/processor.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load and validate the configuration, build every trigger, then exit
    #[arg(long)]
    check: bool,

    /// Log per-trigger statistics at this interval (0 disables)
    #[arg(long, default_value_t = 0)]
    stats_interval_secs: u64,

    /// Abandon in-flight work on shutdown instead of draining it
    #[arg(long)]
    force_stop: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let config = ConfigLoader::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let registries = Registries::with_builtins().context("Failed to register built-in kinds")?;
    let processor =
        Processor::new(&config, &registries).context("Failed to create event sources")?;

    if cli.check {
        for (id, source) in processor.sources() {
            println!("{id}: kind={} class={} workers={}", source.kind(), source.class(), source.workers().len());
        }
        return Ok(());
    }

    processor.start().await.context("Failed to start event sources")?;

    let mut previous = processor.statistics();
    let mut ticker = (cli.stats_interval_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(cli.stats_interval_secs)));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                break;
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let current = processor.statistics();
                for (id, delta) in current.diff(&previous) {
                    info!(
                        source_id = %id,
                        success = delta.events_handled_success_total,
                        failure = delta.events_handled_failure_total,
                        allocation_failures = delta.allocation_failures_total,
                        "📊 SOURCE_STATISTICS"
                    );
                }
                previous = current;
            }
        }
    }

    info!("Shutdown requested, stopping event sources");
    let checkpoints = processor
        .stop(cli.force_stop)
        .await
        .context("Failed to stop event sources")?;

    for (id, checkpoint) in checkpoints {
        if let Some(token) = checkpoint.as_deref() {
            println!("{id}: {token}");
        }
    }
    Ok(())
}
