use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detector::{DetectorPolicy, FingerprintRule};
use crate::error::ConfigError;
use crate::types::{Side, TrackedEntity};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`, then
/// overlaid with environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub whales: Vec<WhaleConfig>,
}

/// Bot credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Seconds between cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Pause between entities within a cycle, in milliseconds.
    #[serde(default = "default_entity_delay")]
    pub entity_delay_ms: u64,
    /// Upper bound on one entity's fetch.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Page size for the activity feed.
    #[serde(default = "default_activity_limit")]
    pub activity_limit: usize,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_entity_delay() -> u64 {
    1000
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("whale_data")
}

fn default_activity_limit() -> usize {
    100
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            entity_delay_ms: default_entity_delay(),
            fetch_timeout_secs: default_fetch_timeout(),
            state_dir: default_state_dir(),
            activity_limit: default_activity_limit(),
        }
    }
}

impl SettingsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn entity_delay(&self) -> Duration {
        Duration::from_millis(self.entity_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideFilter {
    Buy,
    Sell,
    Any,
}

impl SideFilter {
    pub fn side(self) -> Option<Side> {
        match self {
            SideFilter::Buy => Some(Side::Buy),
            SideFilter::Sell => Some(Side::Sell),
            SideFilter::Any => None,
        }
    }
}

/// Detector constants shared by all whales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: i64,
    #[serde(default = "default_max_records")]
    pub max_records_per_cycle: usize,
    #[serde(default = "default_side_filter")]
    pub side_filter: SideFilter,
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold_pct: f64,
    /// Cycles a fingerprint may go unobserved before it is pruned. 0 keeps
    /// every fingerprint forever.
    #[serde(default = "default_retention")]
    pub fingerprint_retention_cycles: u64,
}

fn default_bucket_secs() -> i64 {
    30
}

fn default_max_records() -> usize {
    2
}

fn default_side_filter() -> SideFilter {
    SideFilter::Buy
}

fn default_volume_threshold() -> f64 {
    10.0
}

fn default_retention() -> u64 {
    10_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            bucket_secs: default_bucket_secs(),
            max_records_per_cycle: default_max_records(),
            side_filter: default_side_filter(),
            volume_threshold_pct: default_volume_threshold(),
            fingerprint_retention_cycles: default_retention(),
        }
    }
}

impl DetectorConfig {
    pub fn retention(&self) -> Option<u64> {
        (self.fingerprint_retention_cycles > 0).then_some(self.fingerprint_retention_cycles)
    }
}

/// What to watch for one whale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Open positions, snapshot equality.
    #[default]
    Positions,
    /// Activity feed, latest-marker comparison.
    Activity,
    /// Activity feed, fingerprint dedup of (by default) buys.
    Buys,
    /// CLOB orderbook for a token, volume-shift threshold.
    Orderbook,
}

impl WatchMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positions" => Some(WatchMode::Positions),
            "activity" => Some(WatchMode::Activity),
            "buys" => Some(WatchMode::Buys),
            "orderbook" => Some(WatchMode::Orderbook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleConfig {
    pub name: String,
    /// Proxy wallet address, or CLOB token id in orderbook mode.
    pub address: String,
    #[serde(default)]
    pub mode: WatchMode,
    /// Orderbook mode only; overrides `detector.volume_threshold_pct`.
    #[serde(default)]
    pub threshold_pct: Option<f64>,
}

/// Validated credentials, present unless running dry.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    /// Like `load`, but a missing file yields the defaults (env-only setups).
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay environment variables.
    ///
    /// `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID` and `CHECK_INTERVAL` replace
    /// file values; `WHALE_{i}_NAME` / `WHALE_{i}_ADDRESS` (and optional
    /// `WHALE_{i}_MODE`) for i = 1, 2, ... are appended until the first gap.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(chat) = non_empty("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = Some(chat);
        }
        if let Some(raw) = non_empty("CHECK_INTERVAL") {
            self.settings.poll_interval_secs = raw.trim().parse().map_err(|_| {
                ConfigError::InvalidSetting(format!("CHECK_INTERVAL must be seconds, got {raw:?}"))
            })?;
        }

        for i in 1.. {
            let (Some(name), Some(address)) = (
                non_empty(&format!("WHALE_{i}_NAME")),
                non_empty(&format!("WHALE_{i}_ADDRESS")),
            ) else {
                break;
            };
            let mode = match non_empty(&format!("WHALE_{i}_MODE")) {
                Some(raw) => WatchMode::parse(&raw).ok_or_else(|| ConfigError::InvalidEntity {
                    name: name.clone(),
                    reason: format!("unknown mode {raw:?}"),
                })?,
                None => WatchMode::default(),
            };
            self.whales.push(WhaleConfig {
                name,
                address: address.trim().to_string(),
                mode,
                threshold_pct: None,
            });
        }
        Ok(())
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self, require_credentials: bool) -> Result<(), ConfigError> {
        if require_credentials {
            self.credentials()?;
        }
        if self.settings.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.settings.fetch_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "fetch_timeout_secs must be positive".to_string(),
            ));
        }
        if self.detector.bucket_secs <= 0 {
            return Err(ConfigError::InvalidSetting(
                "bucket_secs must be positive".to_string(),
            ));
        }
        if self.detector.max_records_per_cycle == 0 {
            return Err(ConfigError::InvalidSetting(
                "max_records_per_cycle must be positive".to_string(),
            ));
        }
        if self.detector.volume_threshold_pct < 0.0 {
            return Err(ConfigError::InvalidSetting(
                "volume_threshold_pct must not be negative".to_string(),
            ));
        }
        if self.whales.is_empty() {
            return Err(ConfigError::NoEntities);
        }

        let mut ids = HashSet::new();
        for whale in &self.whales {
            validate_whale(whale)?;
            let entity = TrackedEntity::new(&whale.name, &whale.address);
            if !ids.insert(entity.id.clone()) {
                return Err(ConfigError::DuplicateEntity(entity.id));
            }
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let bot_token = self
            .telegram
            .bot_token
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingCredential("TELEGRAM_BOT_TOKEN"))?;
        let chat_id = self
            .telegram
            .chat_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingCredential("TELEGRAM_CHAT_ID"))?;
        Ok(Credentials { bot_token, chat_id })
    }

    /// Detector policy for a whale under the shared detector constants.
    pub fn policy_for(&self, whale: &WhaleConfig) -> DetectorPolicy {
        match whale.mode {
            WatchMode::Positions => DetectorPolicy::SnapshotEquality,
            WatchMode::Activity => DetectorPolicy::LatestMarker,
            WatchMode::Buys => DetectorPolicy::FingerprintDedup(FingerprintRule {
                bucket_secs: self.detector.bucket_secs,
                max_records: self.detector.max_records_per_cycle,
                side: self.detector.side_filter.side(),
            }),
            WatchMode::Orderbook => DetectorPolicy::VolumeShift {
                threshold_pct: whale
                    .threshold_pct
                    .unwrap_or(self.detector.volume_threshold_pct),
            },
        }
    }

    /// Entities with their policies, in config order.
    pub fn entities(&self) -> Vec<(TrackedEntity, WatchMode, DetectorPolicy)> {
        self.whales
            .iter()
            .map(|w| {
                (
                    TrackedEntity::new(&w.name, &w.address),
                    w.mode,
                    self.policy_for(w),
                )
            })
            .collect()
    }
}

fn validate_whale(whale: &WhaleConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidEntity {
        name: whale.name.clone(),
        reason: reason.to_string(),
    };
    if whale.name.trim().is_empty() || crate::types::slugify(&whale.name).is_empty() {
        return Err(invalid("name must contain at least one letter or digit"));
    }
    if whale.address.trim().is_empty() {
        return Err(invalid("address is empty"));
    }
    match whale.mode {
        WatchMode::Orderbook => {
            if !whale.address.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid("orderbook mode expects a numeric CLOB token id"));
            }
        }
        _ => {
            if !is_hex_address(&whale.address) {
                return Err(invalid("address must be 0x followed by 40 hex digits"));
            }
        }
    }
    if whale.threshold_pct.is_some_and(|t| t < 0.0) {
        return Err(invalid("threshold_pct must not be negative"));
    }
    Ok(())
}

fn is_hex_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
