use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::TELEGRAM_API_BASE;
use crate::error::NotifyError;
use crate::types::AlertText;

/// Bound on a single delivery attempt.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort alert sink. A failure loses the alert; callers log and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &AlertText) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

/// Delivers alerts through the Telegram Bot API `sendMessage` method.
pub struct TelegramNotifier {
    http: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        Self::with_base(TELEGRAM_API_BASE, bot_token, chat_id)
    }

    /// Point at a different API host (self-hosted Bot API server).
    pub fn with_base(base: &str, bot_token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/bot{bot_token}/sendMessage", base.trim_end_matches('/')),
            chat_id: chat_id.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, alert: &AlertText) -> Result<(), NotifyError> {
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text: alert.as_str(),
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            // Strip the URL: it embeds the bot token.
            .map_err(|e| NotifyError::Transport(e.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!("Delivered alert ({} bytes)", alert.as_str().len());
        Ok(())
    }
}

/// `--dry-run` sink: one JSON line per alert on stdout.
#[derive(Default)]
pub struct StdoutNotifier;

#[derive(Serialize)]
struct DryRunAlert<'a> {
    timestamp: String,
    alert: &'a AlertText,
}

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn send(&self, alert: &AlertText) -> Result<(), NotifyError> {
        let line = DryRunAlert {
            timestamp: chrono::Utc::now().to_rfc3339(),
            alert,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            println!("{json}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_embeds_token() {
        let n = TelegramNotifier::with_base("https://example.org/", "123:abc", "-100").unwrap();
        assert_eq!(n.endpoint, "https://example.org/bot123:abc/sendMessage");
        assert_eq!(n.chat_id, "-100");
    }

    #[test]
    fn payload_shape() {
        let payload = SendMessage {
            chat_id: "-100",
            text: "<b>hi</b>",
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["chat_id"], "-100");
        assert_eq!(v["text"], "<b>hi</b>");
        assert_eq!(v["parse_mode"], "HTML");
        assert_eq!(v["disable_web_page_preview"], true);
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let n = TelegramNotifier::with_base("http://127.0.0.1:9", "t", "c").unwrap();
        let err = n.send(&AlertText("x".to_string())).await.unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)));
        assert!(!err.to_string().contains("/bott/"));
    }

    #[tokio::test]
    async fn stdout_notifier_never_fails() {
        StdoutNotifier
            .send(&AlertText("hello".to_string()))
            .await
            .unwrap();
    }
}
