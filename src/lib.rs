pub mod alert;
pub mod api;
pub mod config;
pub mod detector;
pub mod error;
pub mod fingerprint;
pub mod notifier;
pub mod scheduler;
pub mod store;
pub mod types;

/// Polymarket data API base URL (public, no auth required)
pub const DATA_API_BASE: &str = "https://data-api.polymarket.com";

/// CLOB REST API base URL (Central Limit Order Book)
pub const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// Telegram Bot API base URL
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Public Polymarket profile page, used for alert footers.
pub const PROFILE_URL_BASE: &str = "https://polymarket.com/profile";
