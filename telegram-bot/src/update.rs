//! Wire types for the Telegram Bot API's `getUpdates` payloads.
//!
//! Only the fields the dispatcher actually reads are modelled. Everything is
//! optional where Telegram makes it optional, and unknown fields are ignored
//! so that API additions never break deserialization.

use serde::Deserialize;

/// One incoming update from `getUpdates`.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    /// Present for ordinary chat messages; absent for update kinds we ignore
    /// (edited messages, channel posts, and so on).
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub first_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    /// "private", "group", "supergroup", or "channel".
    #[serde(rename = "type")]
    pub kind: String,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.kind == "private"
    }

    pub fn is_group(&self) -> bool {
        self.kind == "group" || self.kind == "supergroup"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_update() {
        let json = r#"{
            "update_id": 42,
            "message": {
                "message_id": 7,
                "from": {"id": 1001, "first_name": "Jane", "is_bot": false},
                "chat": {"id": 1001, "type": "private", "first_name": "Jane"},
                "text": "/tasks"
            }
        }"#;

        let update: Update = serde_json::from_str(json).unwrap();
        assert_eq!(update.update_id, 42);
        let message = update.message.unwrap();
        assert_eq!(message.text.as_deref(), Some("/tasks"));
        assert!(message.chat.is_private());
        assert_eq!(message.from.unwrap().id, 1001);
    }

    #[test]
    fn test_non_message_update_is_tolerated() {
        // Update kinds we don't handle (here: an edited message) must still
        // deserialize, with `message` simply absent.
        let json = r#"{
            "update_id": 43,
            "edited_message": {"message_id": 8}
        }"#;

        let update: Update = serde_json::from_str(json).unwrap();
        assert!(update.message.is_none());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{
            "update_id": 44,
            "message": {
                "message_id": 9,
                "chat": {"id": -500, "type": "supergroup", "title": "RPWC DKL"},
                "text": "/register jane@example.com",
                "entities": [{"type": "bot_command", "offset": 0, "length": 9}]
            }
        }"#;

        let update: Update = serde_json::from_str(json).unwrap();
        let message = update.message.unwrap();
        assert!(message.chat.is_group());
        assert!(message.from.is_none());
    }
}
