use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use polymarket_whale_alert::api::{
    ActivityFetcher, OrderbookFetcher, PositionsFetcher, SnapshotFetcher,
};
use polymarket_whale_alert::config::{AppConfig, CONFIG_PATH, WatchMode};
use polymarket_whale_alert::notifier::{Notifier, StdoutNotifier, TelegramNotifier};
use polymarket_whale_alert::scheduler::{Scheduler, SchedulerSettings, Shutdown, Watch};
use polymarket_whale_alert::store::{FileStore, MemoryStore, StateStore};

#[derive(Parser)]
#[command(name = "whale-alert", about = "Polymarket whale activity alerts over Telegram")]
struct Args {
    /// Config file (defaults to ./config.toml, optional when using env vars)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print alerts to stdout instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Keep state in memory only (nothing written to disk)
    #[arg(long)]
    ephemeral: bool,
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
    dotenvy::dotenv().ok();

    // Load config
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(&PathBuf::from(CONFIG_PATH))?,
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate(!args.dry_run)?;

    let notifier: Arc<dyn Notifier> = if args.dry_run {
        info!("Dry run: alerts go to stdout");
        Arc::new(StdoutNotifier)
    } else {
        let creds = config.credentials()?;
        Arc::new(
            TelegramNotifier::new(&creds.bot_token, &creds.chat_id)
                .context("Failed to build Telegram client")?,
        )
    };

    let store: Arc<dyn StateStore> = if args.ephemeral {
        info!("Ephemeral mode: state is not persisted");
        Arc::new(MemoryStore::new())
    } else {
        let dir = &config.settings.state_dir;
        let store = FileStore::open(dir)
            .with_context(|| format!("Failed to open state dir {}", dir.display()))?;
        info!("State dir: {}", store.dir().display());
        Arc::new(store)
    };

    let watches = build_watches(&config)?;
    for w in &watches {
        info!(
            "[{}] Watching {} ({})",
            w.entity.id,
            w.entity.display_name,
            w.entity.short_key()
        );
    }

    let (tx, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    let mut scheduler = Scheduler::new(
        watches,
        store,
        notifier,
        SchedulerSettings::from_config(&config),
    );
    scheduler.run(shutdown).await;

    info!("Stopped after {} cycle(s)", scheduler.cycle());
    Ok(())
}

/// One fetcher per mode, shared by every whale using it.
fn build_watches(config: &AppConfig) -> Result<Vec<Watch>> {
    let timeout = config.settings.fetch_timeout();
    let mut positions: Option<Arc<dyn SnapshotFetcher>> = None;
    let mut activity: Option<Arc<dyn SnapshotFetcher>> = None;
    let mut orderbook: Option<Arc<dyn SnapshotFetcher>> = None;

    let mut watches = Vec::new();
    for (entity, mode, policy) in config.entities() {
        let fetcher = match mode {
            WatchMode::Positions => positions
                .get_or_insert_with(|| {
                    Arc::new(PositionsFetcher::new()) as Arc<dyn SnapshotFetcher>
                })
                .clone(),
            WatchMode::Activity | WatchMode::Buys => match activity.clone() {
                Some(f) => f,
                None => {
                    let f: Arc<dyn SnapshotFetcher> = Arc::new(
                        ActivityFetcher::new(timeout, config.settings.activity_limit)
                            .context("Failed to build activity client")?,
                    );
                    activity = Some(f.clone());
                    f
                }
            },
            WatchMode::Orderbook => match orderbook.clone() {
                Some(f) => f,
                None => {
                    let f: Arc<dyn SnapshotFetcher> = Arc::new(
                        OrderbookFetcher::new(timeout)
                            .context("Failed to build orderbook client")?,
                    );
                    orderbook = Some(f.clone());
                    f
                }
            },
        };
        watches.push(Watch {
            entity,
            policy,
            fetcher,
        });
    }
    Ok(watches)
}
