use std::time::Duration;

use async_trait::async_trait;
use polymarket_client_sdk::data::Client;
use polymarket_client_sdk::data::types::request::PositionsRequest;
use polymarket_client_sdk::types::Address;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::types::{Record, RecordCategory, Side, Snapshot, TrackedEntity};
use crate::{CLOB_API_BASE, DATA_API_BASE};

/// Retrieves the current observable state of one entity.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, entity: &TrackedEntity) -> Result<Snapshot, FetchError>;
}

fn transport_error(entity: &TrackedEntity, e: impl std::fmt::Display) -> FetchError {
    FetchError::Transport {
        entity: entity.id.clone(),
        cause: e.to_string(),
    }
}

/// Active (unresolved) positions via the data API SDK client.
#[derive(Default)]
pub struct PositionsFetcher {
    client: Client,
}

impl PositionsFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotFetcher for PositionsFetcher {
    async fn fetch(&self, entity: &TrackedEntity) -> Result<Snapshot, FetchError> {
        let addr: Address = entity
            .fetch_key
            .parse()
            .map_err(|e| transport_error(entity, format!("invalid address: {e}")))?;

        let mut records = Vec::new();
        let mut offset: i32 = 0;
        let page_size: i32 = 100;

        loop {
            let req = PositionsRequest::builder()
                .user(addr)
                .limit(page_size)
                .map_err(|e| transport_error(entity, e))?
                .offset(offset)
                .map_err(|e| transport_error(entity, e))?
                .build();
            let page = self.client.positions(&req).await.map_err(|e| transport_error(entity, e))?;
            let count = page.len() as i32;

            for pos in page {
                if pos.current_value > Decimal::ZERO
                    && pos.cur_price > Decimal::ZERO
                    && pos.cur_price < Decimal::ONE
                {
                    records.push(Record {
                        category: RecordCategory::Position,
                        market: pos.title.clone(),
                        outcome: pos.outcome.clone(),
                        side: None,
                        amount: pos.size.to_f64().unwrap_or(0.0),
                        price: pos.cur_price.to_f64().unwrap_or(0.0),
                        timestamp: None,
                        slug: Some(pos.event_slug.clone()).filter(|s| !s.is_empty()),
                    });
                }
            }

            if count < page_size {
                break;
            }
            offset += page_size;
        }

        debug!("[{}] Fetched {} active positions", entity.id, records.len());
        Ok(Snapshot::new(records))
    }
}

/// Build the shared reqwest client used by the JSON fetchers.
fn http_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("polymarket-whale-alert/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FetchError::Transport {
            entity: String::new(),
            cause: e.to_string(),
        })
}

/// GET a URL and decode its JSON body, mapping every failure to `FetchError`.
async fn get_json(
    http: &reqwest::Client,
    entity: &TrackedEntity,
    url: &str,
    query: &[(&str, String)],
) -> Result<Value, FetchError> {
    let resp = http
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(&entity.id, e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            entity: entity.id.clone(),
            status: status.as_u16(),
        });
    }
    let body = resp
        .text()
        .await
        .map_err(|e| FetchError::from_reqwest(&entity.id, e))?;
    serde_json::from_str(&body).map_err(|e| FetchError::Decode {
        entity: entity.id.clone(),
        cause: e.to_string(),
    })
}

/// Number or numeric string.
fn parse_f64(val: &Value, field: &str) -> Option<f64> {
    val.get(field).and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
    })
}

/// Non-negative epoch seconds as an integer, float, or numeric string.
/// Anything else, including out-of-range floats, is `None`.
fn parse_timestamp(val: &Value, field: &str) -> Option<i64> {
    val.get(field)
        .and_then(|v| {
            v.as_i64()
                .or_else(|| {
                    v.as_f64()
                        .filter(|f| f.is_finite() && *f >= 0.0 && *f < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
        })
        .filter(|ts| *ts >= 0)
}

fn parse_str(val: &Value, field: &str) -> Option<String> {
    val.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

/// Map one `/activity` element to a record.
pub fn activity_record(item: &Value) -> Record {
    Record {
        category: RecordCategory::ActivityEvent,
        market: parse_str(item, "title").unwrap_or_else(|| "Unknown Market".to_string()),
        outcome: parse_str(item, "outcome").unwrap_or_else(|| "?".to_string()),
        side: parse_str(item, "side").and_then(|s| Side::from_venue(&s)),
        amount: parse_f64(item, "size").unwrap_or(0.0),
        price: parse_f64(item, "price").unwrap_or(0.0),
        timestamp: parse_timestamp(item, "timestamp"),
        slug: parse_str(item, "eventSlug").filter(|s| !s.is_empty()),
    }
}

/// Recent account activity from `GET /activity?user=`.
pub struct ActivityFetcher {
    http: reqwest::Client,
    base_url: String,
    limit: usize,
}

impl ActivityFetcher {
    pub fn new(timeout: Duration, limit: usize) -> Result<Self, FetchError> {
        Self::with_base(DATA_API_BASE, timeout, limit)
    }

    pub fn with_base(base: &str, timeout: Duration, limit: usize) -> Result<Self, FetchError> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: format!("{}/activity", base.trim_end_matches('/')),
            limit,
        })
    }
}

#[async_trait]
impl SnapshotFetcher for ActivityFetcher {
    async fn fetch(&self, entity: &TrackedEntity) -> Result<Snapshot, FetchError> {
        let query = [
            ("user", entity.fetch_key.clone()),
            ("limit", self.limit.to_string()),
        ];
        let body = get_json(&self.http, entity, &self.base_url, &query).await?;
        let items = body.as_array().ok_or_else(|| FetchError::Decode {
            entity: entity.id.clone(),
            cause: "activity response is not an array".to_string(),
        })?;
        let records: Vec<Record> = items.iter().map(activity_record).collect();
        debug!("[{}] Fetched {} activity events", entity.id, records.len());
        Ok(Snapshot::new(records))
    }
}

/// Map a CLOB `/book` response to one `VolumeSample` per level.
pub fn book_records(body: &Value, market: &str) -> Option<Vec<Record>> {
    let obj = body.as_object()?;
    let mut records = Vec::new();
    for (field, side) in [("bids", Side::Buy), ("asks", Side::Sell)] {
        let Some(levels) = obj.get(field).and_then(|v| v.as_array()) else {
            continue;
        };
        for level in levels {
            records.push(Record {
                category: RecordCategory::VolumeSample,
                market: market.to_string(),
                outcome: String::new(),
                side: Some(side),
                amount: parse_f64(level, "size").unwrap_or(0.0),
                price: parse_f64(level, "price").unwrap_or(0.0),
                timestamp: None,
                slug: None,
            });
        }
    }
    Some(records)
}

/// Orderbook depth for one CLOB token from `GET /book?token_id=`.
pub struct OrderbookFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl OrderbookFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Self::with_base(CLOB_API_BASE, timeout)
    }

    pub fn with_base(base: &str, timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: format!("{}/book", base.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for OrderbookFetcher {
    async fn fetch(&self, entity: &TrackedEntity) -> Result<Snapshot, FetchError> {
        let query = [("token_id", entity.fetch_key.clone())];
        let body = get_json(&self.http, entity, &self.base_url, &query).await?;
        let records =
            book_records(&body, &entity.display_name).ok_or_else(|| FetchError::Decode {
                entity: entity.id.clone(),
                cause: "book response is not an object".to_string(),
            })?;
        debug!("[{}] Fetched {} book levels", entity.id, records.len());
        Ok(Snapshot::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn activity_record_full() {
        let item = json!({
            "proxyWallet": "0x589222a5124a96765443b97a3498d89ffd824ad2",
            "timestamp": 1_700_000_000,
            "conditionId": "0xcond",
            "type": "TRADE",
            "size": 120.5,
            "usdcSize": 60.25,
            "price": 0.5,
            "side": "BUY",
            "title": "Will it rain?",
            "eventSlug": "rain",
            "outcome": "Yes"
        });
        let r = activity_record(&item);
        assert_eq!(r.category, RecordCategory::ActivityEvent);
        assert_eq!(r.market, "Will it rain?");
        assert_eq!(r.outcome, "Yes");
        assert_eq!(r.side, Some(Side::Buy));
        assert_eq!(r.amount, 120.5);
        assert_eq!(r.price, 0.5);
        assert_eq!(r.timestamp, Some(1_700_000_000));
        assert_eq!(r.slug.as_deref(), Some("rain"));
    }

    #[test]
    fn activity_record_string_numbers() {
        let item = json!({"timestamp": "1700000000", "size": "10", "price": "0.25", "side": "sell"});
        let r = activity_record(&item);
        assert_eq!(r.timestamp, Some(1_700_000_000));
        assert_eq!(r.amount, 10.0);
        assert_eq!(r.price, 0.25);
        assert_eq!(r.side, Some(Side::Sell));
    }

    #[test]
    fn activity_record_malformed_fields_degrade() {
        let item = json!({"timestamp": "yesterday", "side": "", "price": null});
        let r = activity_record(&item);
        assert_eq!(r.timestamp, None);
        assert_eq!(r.side, None);
        assert_eq!(r.price, 0.0);
        assert_eq!(r.market, "Unknown Market");
        assert_eq!(r.outcome, "?");
    }

    #[test]
    fn out_of_range_timestamps_degrade_to_none() {
        for ts in [json!(-1e30), json!(1e30), json!(-5), json!("-5")] {
            let item = json!({"timestamp": ts, "title": "M", "side": "BUY", "price": 0.5});
            let r = activity_record(&item);
            assert_eq!(r.timestamp, None, "timestamp {ts}");
            let fp = crate::fingerprint::Fingerprint::of("whale", &r, 30);
            assert!(fp.as_str().ends_with("|0"));
        }
    }

    #[test]
    fn book_records_both_sides() {
        let body = json!({
            "market": "0xcond",
            "asset_id": "123",
            "bids": [{"price": "0.48", "size": "100"}, {"price": "0.47", "size": "50"}],
            "asks": [{"price": "0.52", "size": "75"}]
        });
        let records = book_records(&body, "Book").unwrap();
        assert_eq!(records.len(), 3);
        let bids: f64 = records
            .iter()
            .filter(|r| r.side == Some(Side::Buy))
            .map(|r| r.amount)
            .sum();
        assert_eq!(bids, 150.0);
        assert_eq!(records[2].side, Some(Side::Sell));
        assert_eq!(records[2].price, 0.52);
    }

    #[test]
    fn book_records_rejects_non_object() {
        assert!(book_records(&json!([1, 2]), "Book").is_none());
        assert_eq!(book_records(&json!({}), "Book").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unreachable_host_is_fetch_error() {
        let fetcher =
            ActivityFetcher::with_base("http://127.0.0.1:9", Duration::from_secs(2), 10).unwrap();
        let entity = TrackedEntity::new("Whale", "0xabc");
        let err = fetcher.fetch(&entity).await.unwrap_err();
        assert!(err.to_string().starts_with("[whale]"));
    }
}
