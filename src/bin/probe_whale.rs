//! Probe: fetch one snapshot with the crate fetchers and show the alert it
//! would produce if every record were new.
//!
//! Useful for checking the live response shape of each mode:
//!   probe-whale --address 0x... --mode buys --limit 10

use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;

use polymarket_whale_alert::alert::format_alert;
use polymarket_whale_alert::api::{
    ActivityFetcher, OrderbookFetcher, PositionsFetcher, SnapshotFetcher,
};
use polymarket_whale_alert::config::{AppConfig, WatchMode, WhaleConfig};
use polymarket_whale_alert::detector::{DetectorPolicy, fingerprint_candidates};
use polymarket_whale_alert::types::{ChangeEvent, ChangeReason, TrackedEntity};

#[derive(Parser)]
#[command(name = "probe-whale", about = "Fetch one whale snapshot and render its alert")]
struct Args {
    /// Proxy wallet address, or CLOB token id for orderbook mode
    #[arg(long)]
    address: String,

    /// positions | activity | buys | orderbook
    #[arg(long, default_value = "positions")]
    mode: String,

    /// Activity records to request
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Display name used in the rendered alert
    #[arg(long, default_value = "Probe")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let Some(mode) = WatchMode::parse(&args.mode) else {
        bail!("--mode must be one of positions, activity, buys, orderbook");
    };

    let config = AppConfig::default();
    let timeout = config.settings.fetch_timeout();
    let fetcher: Box<dyn SnapshotFetcher> = match mode {
        WatchMode::Positions => Box::new(PositionsFetcher::new()),
        WatchMode::Activity | WatchMode::Buys => Box::new(ActivityFetcher::new(timeout, args.limit)?),
        WatchMode::Orderbook => Box::new(OrderbookFetcher::new(timeout)?),
    };
    let entity = TrackedEntity::new(&args.name, args.address.trim());
    let policy = config.policy_for(&WhaleConfig {
        name: args.name.clone(),
        address: entity.fetch_key.clone(),
        mode,
        threshold_pct: None,
    });

    println!("=== Probe: {:?} for {} ===", mode, entity.short_key());
    let start = Instant::now();
    let snapshot = fetcher.fetch(&entity).await?;
    println!("Latency: {:?}", start.elapsed());
    println!("Records: {}", snapshot.len());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to encode snapshot")?
    );
    println!();

    let (new_records, reason) = match &policy {
        DetectorPolicy::SnapshotEquality => {
            (snapshot.records.clone(), ChangeReason::PositionsChanged)
        }
        DetectorPolicy::LatestMarker => (snapshot.records.clone(), ChangeReason::NewActivity),
        DetectorPolicy::FingerprintDedup(rule) => (
            fingerprint_candidates(rule, &snapshot.records),
            ChangeReason::NewTrades,
        ),
        DetectorPolicy::VolumeShift { .. } => {
            (snapshot.records.clone(), ChangeReason::VolumeShift(Vec::new()))
        }
    };
    let event = ChangeEvent {
        entity,
        previous: None,
        current: snapshot,
        new_records,
        reason,
    };

    println!("--- Rendered alert ---");
    println!("{}", format_alert(&event));
    Ok(())
}
