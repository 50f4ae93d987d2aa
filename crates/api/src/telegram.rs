//! Telegram Bot API notifier.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::notifier::{Event, Notifier};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Sends events as HTML messages to one chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("base_url", &self.base_url)
            .field("token", &mask_token(&self.token))
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build telegram http client")?;

        Ok(Self {
            client,
            base_url: TELEGRAM_API.to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
        })
    }

    /// Point at a different Bot API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send one HTML message and wait for the API answer.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("telegram request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram API error: {} - {}", status, body);
        }

        debug!(chat_id = %self.chat_id, "Telegram message sent");
        Ok(())
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, event: Event) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, dropping telegram notification");
            return;
        };

        let notifier = self.clone();
        let text = event.to_html();
        handle.spawn(async move {
            if let Err(e) = notifier.send_message(&text).await {
                warn!(error = %e, "Failed to deliver telegram notification");
            }
        });
    }
}

/// Keep the bot id, hide the secret half of the token.
pub fn mask_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, _)) => format!("{id}:***"),
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("12345:ABCdef"), "12345:***");
        assert_eq!(mask_token("garbage"), "***");
    }

    #[test]
    fn test_debug_hides_token() {
        let notifier = TelegramNotifier::new("999:secret", "42").unwrap();
        let debug = format!("{notifier:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("999:***"));
    }

    #[tokio::test]
    #[ignore] // Requires network and a real bot token
    async fn test_send_message() {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap();
        let chat = std::env::var("TELEGRAM_CHAT_ID").unwrap();
        let notifier = TelegramNotifier::new(token, chat).unwrap();
        notifier.send_message("<b>test</b>").await.unwrap();
    }
}
