use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A failed snapshot fetch. Transient: the entity is skipped for this cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("[{entity}] request failed: {cause}")]
    Transport { entity: String, cause: String },

    #[error("[{entity}] unexpected status {status}")]
    Status { entity: String, status: u16 },

    #[error("[{entity}] malformed response: {cause}")]
    Decode { entity: String, cause: String },

    #[error("[{entity}] timed out after {after:?}")]
    Timeout { entity: String, after: Duration },
}

impl FetchError {
    /// Classify a reqwest error raised while sending or reading a body.
    pub fn from_reqwest(entity: &str, err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode {
                entity: entity.to_string(),
                cause: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            FetchError::Status {
                entity: entity.to_string(),
                status: status.as_u16(),
            }
        } else {
            FetchError::Transport {
                entity: entity.to_string(),
                cause: err.to_string(),
            }
        }
    }
}

/// A failed alert delivery. The alert is dropped, never retried.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier transport error: {0}")]
    Transport(String),

    #[error("notifier rejected alert with status {status}: {body}")]
    Status { status: u16, body: String },
}

/// A failed state read or write. In-memory state stays authoritative.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state for {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt state file {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid startup configuration. Fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing credential: {0} (set it in config.toml or the environment)")]
    MissingCredential(&'static str),

    #[error("no whales configured; add a [[whales]] entry or WHALE_1_NAME / WHALE_1_ADDRESS")]
    NoEntities,

    #[error("invalid whale \"{name}\": {reason}")]
    InvalidEntity { name: String, reason: String },

    #[error("duplicate whale id \"{0}\"; whale names must be unique")]
    DuplicateEntity(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}
