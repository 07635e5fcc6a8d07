//! Provider wire shapes and their mapping onto the core messaging model.

use serde::Deserialize;
use serde_json::{json, Value};

use cbb_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    messaging::types::{CallbackAction, Event, InlineKeyboard, TextMessage, Update},
};

#[derive(Debug, Deserialize)]
struct WireUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    callback_query: Option<WireCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    message_id: i32,
    chat: WireChat,
    #[serde(default)]
    from: Option<WireUser>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCallbackQuery {
    id: String,
    from: WireUser,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    data: Option<String>,
}

/// Decode a `getUpdates` result array.
///
/// Each entry is decoded on its own so one odd update cannot poison the batch.
/// Entries that carry an `update_id` but nothing the bot handles come back with
/// `event: None`; entries without a usable `update_id` are dropped.
pub fn parse_updates(result: Value) -> Vec<Update> {
    let Value::Array(items) = result else {
        tracing::warn!("getUpdates result is not an array");
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|raw| {
            let id = raw.get("update_id").and_then(Value::as_i64);
            match serde_json::from_value::<WireUpdate>(raw) {
                Ok(u) => Some(to_update(u)),
                Err(e) => {
                    let id = id?;
                    tracing::warn!(update_id = id, "undecodable update skipped: {e}");
                    Some(Update { id, event: None })
                }
            }
        })
        .collect()
}

fn to_update(u: WireUpdate) -> Update {
    let event = if let Some(q) = u.callback_query {
        Some(Event::Callback(CallbackAction {
            callback_id: q.id,
            user_id: UserId(q.from.id),
            username: q.from.username,
            message: q.message.map(|m| MessageRef {
                chat_id: ChatId(m.chat.id),
                message_id: MessageId(m.message_id),
            }),
            data: q.data.unwrap_or_default(),
        }))
    } else {
        u.message.and_then(|m| {
            let from = m.from?;
            let text = m.text?;
            Some(Event::Text(TextMessage {
                chat_id: ChatId(m.chat.id),
                user_id: UserId(from.id),
                username: from.username,
                text,
            }))
        })
    };

    Update {
        id: u.update_id,
        event,
    }
}

/// `reply_markup` for an inline keyboard.
pub fn keyboard_markup(kb: &InlineKeyboard) -> Value {
    let rows: Vec<Vec<Value>> = kb
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.callback_data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

/// Decode the message reference returned by `sendMessage`.
pub fn parse_sent(result: &Value) -> Option<MessageRef> {
    let message_id = result.get("message_id")?.as_i64()?;
    let chat_id = result.get("chat")?.get("id")?.as_i64()?;
    Some(MessageRef {
        chat_id: ChatId(chat_id),
        message_id: MessageId(i32::try_from(message_id).ok()?),
    })
}
