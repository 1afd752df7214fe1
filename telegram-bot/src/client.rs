//! Telegram Bot API client.
//!
//! A thin typed wrapper over the HTTP API: sending messages, long-polling for
//! updates, and checking group membership. The bot token is part of the URL
//! path, so it must never appear in logs or error messages.

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::update::Update;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Extra slack on top of the long-poll timeout so the HTTP client does not
/// give up before Telegram responds to an empty poll.
const POLL_HTTP_SLACK_SECS: u64 = 10;

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    token: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest {
    offset: i64,
    timeout: u64,
}

#[derive(Debug, Serialize)]
struct GetChatMemberRequest {
    chat_id: i64,
    user_id: i64,
}

/// Telegram's uniform response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMemberResponse {
    status: String,
}

impl TelegramClient {
    pub fn new(token: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self { client, token }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", TELEGRAM_API_BASE, self.token, method)
    }

    /// Send a plain-text message to a chat.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let request = SendMessageRequest { chat_id, text };

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&request)
            .send()
            .await
            .context("sendMessage request failed")?;

        let status = response.status();
        let body: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .context("sendMessage response was not valid JSON")?;

        if !body.ok {
            return Err(anyhow!(
                "sendMessage rejected (HTTP {}): {}",
                status,
                body.description.unwrap_or_else(|| "no description".to_string())
            ));
        }

        Ok(())
    }

    /// Long-poll for updates after `offset`.
    ///
    /// Returns an empty vector when the poll times out with nothing new.
    /// The caller advances the offset past the highest `update_id` it has seen.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout_secs,
        };

        let response = self
            .client
            .post(self.method_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs + POLL_HTTP_SLACK_SECS))
            .json(&request)
            .send()
            .await
            .context("getUpdates request failed")?;

        let body: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .context("getUpdates response was not valid JSON")?;

        if !body.ok {
            return Err(anyhow!(
                "getUpdates rejected: {}",
                body.description.unwrap_or_else(|| "no description".to_string())
            ));
        }

        Ok(body.result.unwrap_or_default())
    }

    /// Check whether a user belongs to the given group chat.
    ///
    /// Errors (unknown chat, user never seen) are treated as "not a member" by
    /// callers; membership gates are advisory, not security boundaries.
    pub async fn is_chat_member(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        let request = GetChatMemberRequest { chat_id, user_id };

        let response = self
            .client
            .post(self.method_url("getChatMember"))
            .json(&request)
            .send()
            .await
            .context("getChatMember request failed")?;

        let body: ApiResponse<ChatMemberResponse> = response
            .json()
            .await
            .context("getChatMember response was not valid JSON")?;

        if !body.ok {
            return Ok(false);
        }

        let status = body.result.map(|m| m.status).unwrap_or_default();
        Ok(matches!(
            status.as_str(),
            "member" | "administrator" | "creator"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_url_embeds_token() {
        let client = TelegramClient::new("123:abc".to_string());
        assert_eq!(
            client.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn test_api_response_envelope_parses_failure() {
        let json = r#"{"ok": false, "error_code": 403, "description": "Forbidden: bot was blocked"}"#;
        let body: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        assert!(!body.ok);
        assert!(body.result.is_none());
        assert_eq!(body.description.as_deref(), Some("Forbidden: bot was blocked"));
    }

    #[test]
    fn test_api_response_envelope_parses_updates() {
        let json = r#"{"ok": true, "result": [{"update_id": 1}]}"#;
        let body: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        assert!(body.ok);
        assert_eq!(body.result.unwrap().len(), 1);
    }
}
