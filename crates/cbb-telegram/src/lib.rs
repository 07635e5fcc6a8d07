//! Telegram adapter.
//!
//! Implements the `cbb-core` [`UpdateSource`] and [`MessagingPort`] over the Bot
//! HTTP API. Every call goes through [`rpc::RpcClient`], so rate-limit hints and
//! transient failures are handled in one place.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

pub mod rpc;
pub mod wire;

use cbb_core::{
    config::Config,
    domain::{ChatId, Cursor, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, Update},
    },
    ports::UpdateSource,
    utils::truncate_text,
    Result,
};

use crate::rpc::{HttpTransport, RetryPolicy, RpcClient};

/// Provider limit on message text, in characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

const ALLOWED_UPDATES: [&str; 2] = ["message", "callback_query"];

pub struct TelegramApi {
    rpc: RpcClient,
    max_retries: u32,
}

impl TelegramApi {
    pub fn new(rpc: RpcClient, max_retries: u32) -> Self {
        Self { rpc, max_retries }
    }

    /// Build the HTTP-backed client from configuration.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let transport = HttpTransport::new(&cfg.api_base, &cfg.bot_token)
            .map_err(|e| Error::External(e.to_string()))?;
        let rpc = RpcClient::new(
            std::sync::Arc::new(transport),
            RetryPolicy::from_config(cfg),
        );
        Ok(Self::new(rpc, cfg.rpc_max_retries))
    }

    async fn call(&self, method: &str, params: Value, is_write: bool) -> Result<Value> {
        Ok(self
            .rpc
            .call(method, params, is_write, self.max_retries)
            .await?)
    }

    /// Bot identity; used once at startup to validate the token.
    pub async fn get_me(&self) -> Result<Value> {
        self.call("getMe", json!({}), false).await
    }
}

fn clamp_text(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_LEN {
        text.to_string()
    } else {
        truncate_text(text, MAX_MESSAGE_LEN - 3)
    }
}

#[async_trait]
impl UpdateSource for TelegramApi {
    async fn fetch(&self, cursor: Cursor, timeout: Duration) -> Result<Vec<Update>> {
        let result = self
            .call(
                "getUpdates",
                json!({
                    "offset": cursor.0,
                    "timeout": timeout.as_secs(),
                    "allowed_updates": ALLOWED_UPDATES,
                }),
                false,
            )
            .await?;
        Ok(wire::parse_updates(result))
    }
}

#[async_trait]
impl MessagingPort for TelegramApi {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        let mut params = json!({ "chat_id": chat_id.0, "text": clamp_text(text) });
        if let Some(kb) = keyboard.filter(|kb| !kb.is_empty()) {
            params["reply_markup"] = wire::keyboard_markup(kb);
        }

        let result = self.call("sendMessage", params, true).await?;
        wire::parse_sent(&result).ok_or_else(|| {
            Error::External("sendMessage returned no message reference".to_string())
        })
    }

    async fn edit_text(
        &self,
        msg: MessageRef,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        let mut params = json!({
            "chat_id": msg.chat_id.0,
            "message_id": msg.message_id.0,
            "text": clamp_text(text),
        });
        if let Some(kb) = keyboard.filter(|kb| !kb.is_empty()) {
            params["reply_markup"] = wire::keyboard_markup(kb);
        }

        match self.call("editMessageText", params, true).await {
            Ok(_) => Ok(()),
            // Re-rendering an unchanged menu is not a failure.
            Err(Error::Rpc(e)) if e.description.contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut params = json!({ "callback_query_id": callback_id });
        if let Some(t) = text {
            params["text"] = json!(t);
        }
        self.call("answerCallbackQuery", params, true).await?;
        Ok(())
    }
}
