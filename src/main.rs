#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netlens::analyzer::{NetworkAnalyzer, PacketSink};
use netlens::capture;
use netlens::capture::decode::PacketMetadata;
use netlens::config::EngineConfig;
use netlens::geo::GeoService;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Raise log verbosity to debug
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Capture, attribute, and aggregate live traffic
    Run(Run),
    /// List capturable interfaces and their addresses
    Interfaces,
}

#[derive(Parser, Debug)]
struct Run {
    /// Interface to capture on; repeatable. Defaults to every capturable device
    #[arg(short, long)]
    interface: Vec<String>,

    /// Seconds between registry snapshot emissions
    #[arg(long, default_value_t = 30)]
    snapshot_secs: u64,

    /// Do not print attributed packets, only snapshots
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::filter::Targets::new().with_target("netlens", level))
        .init();

    match cli.command {
        Commands::Run(args) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run(args)),
        Commands::Interfaces => interfaces(),
    }
}

/// Prints each attributed packet as one JSON line on stdout.
struct JsonLineSink {
    quiet: bool,
}

impl PacketSink for JsonLineSink {
    fn deliver(&self, packet: &PacketMetadata) {
        if self.quiet {
            return;
        }
        match serde_json::to_string(packet) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::debug!("Could not serialize packet: {e}"),
        }
    }
}

async fn run(args: Run) -> eyre::Result<()> {
    match GeoService::get_public_ip().await {
        Ok(ip) => tracing::info!(public_ip = %ip, "Resolved public address"),
        Err(e) => tracing::warn!("Could not resolve the public address: {e}"),
    }

    let sink = Arc::new(JsonLineSink { quiet: args.quiet });
    let mut analyzer = NetworkAnalyzer::new(EngineConfig::default(), sink)?;
    analyzer.start(&args.interface).await?;

    let registry = analyzer.registry();
    let snapshot_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.snapshot_secs.max(1)));
        // The first tick fires immediately; skip it so the first snapshot has
        // data behind it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            emit_snapshot(&registry);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    snapshot_task.abort();

    // Sample before stop: registries are not flushed on shutdown.
    emit_snapshot(&analyzer.registry());
    analyzer.stop().await;

    Ok(())
}

fn emit_snapshot(registry: &Arc<netlens::registry::RegistryManager>) {
    match serde_json::to_string(&registry.snapshot()) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!("Could not serialize snapshot: {e}"),
    }
}

fn interfaces() -> eyre::Result<()> {
    let devices = capture::list_devices()?;

    println!("{:<18} Addresses", "Interface");
    for (name, addrs) in devices {
        println!("{name:<18} {}", addrs.join(", "));
    }

    Ok(())
}
