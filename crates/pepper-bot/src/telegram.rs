//! Minimal Telegram Bot API client over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::BotConfig;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("TELEGRAM_BOT_TOKEN is not set")]
    MissingToken,
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram api error in {method}: {description}")]
    Api { method: String, description: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl InlineKeyboardMarkup {
    /// One button per row.
    pub fn column(buttons: Vec<InlineKeyboardButton>) -> Option<Self> {
        if buttons.is_empty() {
            return None;
        }
        Some(Self {
            inline_keyboard: buttons.into_iter().map(|b| vec![b]).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineKeyboardButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub markdown: bool,
    pub disable_preview: bool,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

/// The subset of the Bot API the bot talks through.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<(), TelegramError>;

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), TelegramError>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>)
        -> Result<(), TelegramError>;
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    endpoint: String,
    poll_timeout: Duration,
}

impl TelegramClient {
    pub fn new(config: &BotConfig) -> Result<Self, TelegramError> {
        let token = config.token.as_deref().ok_or(TelegramError::MissingToken)?;
        let poll_timeout = config.poll_timeout();
        let http = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
            poll_timeout,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &JsonValue,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{}", self.endpoint, method);
        let envelope: ApiEnvelope<T> = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await?
            .json()
            .await?;
        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TelegramError::Api {
                method: method.to_string(),
                description: envelope
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, TelegramError> {
        let mut body = json!({
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        let updates: Vec<Update> = self.call("getUpdates", &body).await?;
        if !updates.is_empty() {
            debug!(count = updates.len(), "updates received");
        }
        Ok(updates)
    }
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<(), TelegramError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if options.markdown {
            body["parse_mode"] = json!("Markdown");
        }
        if options.disable_preview {
            body["disable_web_page_preview"] = json!(true);
        }
        if let Some(keyboard) = options.keyboard {
            body["reply_markup"] = json!(keyboard);
        }
        let _: JsonValue = self.call("sendMessage", &body).await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), TelegramError> {
        let mut body = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = json!(keyboard);
        }
        let _: JsonValue = self.call("editMessageText", &body).await?;
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: JsonValue = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_deserialize_from_bot_api_shape() {
        let raw = r#"{"ok":true,"result":[
            {"update_id":10,"message":{"message_id":1,"chat":{"id":42,"type":"private"},"text":"/start"}},
            {"update_id":11,"callback_query":{"id":"cb1","from":{"id":42},"data":"view_list:3",
             "message":{"message_id":2,"chat":{"id":42}}}}
        ]}"#;
        let envelope: ApiEnvelope<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let updates = envelope.result.unwrap();
        assert_eq!(updates[0].message.as_ref().unwrap().text.as_deref(), Some("/start"));
        let callback = updates[1].callback_query.as_ref().unwrap();
        assert_eq!(callback.data.as_deref(), Some("view_list:3"));
        assert_eq!(callback.message.as_ref().unwrap().chat.id, 42);
    }

    #[test]
    fn error_envelope_has_no_result() {
        let raw = r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#;
        let envelope: ApiEnvelope<Vec<Update>> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.ok);
        assert!(envelope.result.is_none());
        assert_eq!(envelope.description.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn keyboard_serializes_as_rows() {
        let markup = InlineKeyboardMarkup::column(vec![
            InlineKeyboardButton::new("View Tech", "view_list:1"),
            InlineKeyboardButton::new("View Food", "view_list:2"),
        ])
        .unwrap();
        let value = serde_json::to_value(&markup).unwrap();
        assert_eq!(value["inline_keyboard"][1][0]["callback_data"], "view_list:2");
        assert!(InlineKeyboardMarkup::column(Vec::new()).is_none());
    }

    #[test]
    fn client_requires_a_token() {
        let config = BotConfig::from_lookup(|_| None);
        assert!(matches!(TelegramClient::new(&config), Err(TelegramError::MissingToken)));
    }
}
