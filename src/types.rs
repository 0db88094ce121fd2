use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A whale being watched. Built once from config and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    /// Stable unique id, used as the state file name and fingerprint prefix.
    pub id: String,
    pub display_name: String,
    /// Proxy wallet address, or CLOB token id for orderbook watches.
    pub fetch_key: String,
}

impl TrackedEntity {
    pub fn new(display_name: &str, fetch_key: &str) -> Self {
        Self {
            id: slugify(display_name),
            display_name: display_name.to_string(),
            fetch_key: fetch_key.to_string(),
        }
    }

    /// Last six characters of the fetch key, for compact log lines.
    pub fn short_key(&self) -> &str {
        let start = self.fetch_key.len().saturating_sub(6);
        self.fetch_key.get(start..).unwrap_or(&self.fetch_key)
    }
}

/// Lowercase ASCII alphanumerics, every other run collapsed to a single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Position,
    ActivityEvent,
    VolumeSample,
}

/// Trade direction. For a `VolumeSample`, bids are `Buy` and asks are `Sell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Case-insensitive parse of the venue's `"BUY"` / `"SELL"` strings.
    pub fn from_venue(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("buy") {
            Some(Side::Buy)
        } else if raw.eq_ignore_ascii_case("sell") {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// One element of a snapshot: a position, an activity event, or a book level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub category: RecordCategory,
    /// Market title (or question).
    pub market: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    /// Shares held, traded, or resting at a price level.
    pub amount: f64,
    pub price: f64,
    /// Unix seconds. `None` when the feed omitted it or sent garbage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

impl Record {
    /// Timestamp for ordering; missing sorts as the epoch.
    pub fn sort_timestamp(&self) -> i64 {
        self.timestamp.unwrap_or(0)
    }

    /// `amount × price` rounded to cents.
    pub fn notional(&self) -> f64 {
        (self.amount * self.price * 100.0).round() / 100.0
    }
}

/// One fetched observation of an entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<Record>,
}

impl Snapshot {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            fetched_at: Utc::now(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum record timestamp, the "latest marker" of an activity feed.
    pub fn latest_marker(&self) -> Option<i64> {
        self.records.iter().filter_map(|r| r.timestamp).max()
    }
}

/// Sort records newest first. Missing timestamps count as 0 and sort last.
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by_key(|r| std::cmp::Reverse(r.sort_timestamp()));
}

/// Which rule fired, with enough detail for the alert headline.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeReason {
    PositionsChanged,
    NewActivity,
    NewTrades,
    VolumeShift(Vec<VolumeShift>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeShift {
    pub side: Side,
    pub before: f64,
    pub after: f64,
    pub change_pct: f64,
}

/// A confirmed change, consumed once by the formatter and notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub entity: TrackedEntity,
    pub previous: Option<Snapshot>,
    pub current: Snapshot,
    /// The subset of `current` the alert body should lead with.
    pub new_records: Vec<Record>,
    pub reason: ChangeReason,
}

/// Rendered alert body (Telegram HTML).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AlertText(pub String);

impl AlertText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AlertText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn entity(name: &str) -> TrackedEntity {
        TrackedEntity::new(name, "0x589222a5124a96765443b97a3498d89ffd824ad2")
    }

    pub fn position(market: &str, outcome: &str, amount: f64, price: f64) -> Record {
        Record {
            category: RecordCategory::Position,
            market: market.to_string(),
            outcome: outcome.to_string(),
            side: None,
            amount,
            price,
            timestamp: None,
            slug: None,
        }
    }

    pub fn activity(market: &str, side: Side, price: f64, timestamp: Option<i64>) -> Record {
        Record {
            category: RecordCategory::ActivityEvent,
            market: market.to_string(),
            outcome: "Yes".to_string(),
            side: Some(side),
            amount: 100.0,
            price,
            timestamp,
            slug: None,
        }
    }

    pub fn level(side: Side, price: f64, amount: f64) -> Record {
        Record {
            category: RecordCategory::VolumeSample,
            market: "book".to_string(),
            outcome: String::new(),
            side: Some(side),
            amount,
            price,
            timestamp: None,
            slug: None,
        }
    }
}
