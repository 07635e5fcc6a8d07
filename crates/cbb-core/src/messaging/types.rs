use crate::domain::{ChatId, MessageRef, UserId};

/// One entry of the provider's update feed.
///
/// `event` is `None` for update kinds the bot does not handle; the cursor still
/// moves past them.
#[derive(Clone, Debug)]
pub struct Update {
    pub id: i64,
    pub event: Option<Event>,
}

/// Inbound event handed from the ingestion loop to exactly one handler.
#[derive(Clone, Debug)]
pub enum Event {
    Text(TextMessage),
    Callback(CallbackAction),
}

impl Event {
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Event::Text(m) => Some(m.chat_id),
            Event::Callback(c) => c.chat_id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Text(_) => "text",
            Event::Callback(_) => "callback",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TextMessage {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub text: String,
}

/// Inline-button press. `callback_id` must be acknowledged exactly once.
#[derive(Clone, Debug)]
pub struct CallbackAction {
    pub callback_id: String,
    pub user_id: UserId,
    pub username: Option<String>,
    pub message: Option<MessageRef>,
    pub data: String,
}

impl CallbackAction {
    pub fn chat_id(&self) -> Option<ChatId> {
        self.message.map(|m| m.chat_id)
    }
}

/// Inline keyboard, one `Vec` per row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback_data: callback_data.into(),
        }
    }
}

impl InlineKeyboard {
    pub fn new(rows: Vec<Vec<InlineButton>>) -> Self {
        Self { rows }
    }

    /// Convenience for "one button per row" layouts.
    pub fn one_per_row(buttons: Vec<InlineButton>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.is_empty())
    }
}

/// Outbound payload produced by a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Send {
        chat_id: ChatId,
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
    Edit {
        message: MessageRef,
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
}

impl Reply {
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Reply::Send {
            chat_id,
            text: text.into(),
            keyboard: None,
        }
    }
}

/// What a handler wants done after it ran.
///
/// `toast` is only meaningful for callbacks: it becomes the text of the
/// acknowledgment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub replies: Vec<Reply>,
    pub toast: Option<String>,
}

impl Outcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(reply: Reply) -> Self {
        Self {
            replies: vec![reply],
            toast: None,
        }
    }

    pub fn with_toast(mut self, toast: impl Into<String>) -> Self {
        self.toast = Some(toast.into());
        self
    }
}
