//! Port fakes shared by the unit tests.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Mutex,
};

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{CallbackAction, Event, InlineKeyboard, Outcome, Reply, TextMessage},
    },
    ports::{CallbackHandler, MessageHandler},
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Text {
        chat_id: ChatId,
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
    Edit {
        msg: MessageRef,
        text: String,
    },
    Answer {
        callback_id: String,
        text: Option<String>,
    },
}

#[derive(Default)]
pub struct FakeMessenger {
    next_id: AtomicI32,
    calls: Mutex<Vec<Sent>>,
    fail_sends: AtomicBool,
}

impl FakeMessenger {
    pub fn failing() -> Self {
        let m = Self::default();
        m.fail_sends.store(true, Ordering::SeqCst);
        m
    }

    pub fn calls(&self) -> Vec<Sent> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<(ChatId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Sent::Text { chat_id, text, .. } => Some((chat_id, text)),
                _ => None,
            })
            .collect()
    }

    pub fn answers(&self) -> Vec<(String, Option<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Sent::Answer { callback_id, text } => Some((callback_id, text)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::External("outbound channel down".to_string()));
        }
        self.calls.lock().unwrap().push(Sent::Text {
            chat_id,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(id),
        })
    }

    async fn edit_text(
        &self,
        msg: MessageRef,
        text: &str,
        _keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::External("outbound channel down".to_string()));
        }
        self.calls.lock().unwrap().push(Sent::Edit {
            msg,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        // Recorded even when sends fail, so tests can count attempts.
        self.calls.lock().unwrap().push(Sent::Answer {
            callback_id: callback_id.to_string(),
            text: text.map(str::to_string),
        });
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::External("outbound channel down".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    Echo,
    Fail,
    Panic,
}

/// Handler that records what it saw and then echoes, fails or panics.
pub struct RecordingHandler {
    behaviour: Behaviour,
    seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn record(&self, what: &str) -> Result<()> {
        self.seen.lock().unwrap().push(what.to_string());
        match self.behaviour {
            Behaviour::Echo => Ok(()),
            Behaviour::Fail => Err(Error::Handler(format!("boom on {what}"))),
            Behaviour::Panic => panic!("handler panicked on {what}"),
        }
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(
        &self,
        msg: &TextMessage,
    ) -> Result<Outcome> {
        self.record(&msg.text)?;
        Ok(Outcome::reply(
            Reply::text(msg.chat_id, format!("echo: {}", msg.text)),
        ))
    }
}

#[async_trait]
impl CallbackHandler for RecordingHandler {
    async fn on_callback(
        &self,
        action: &CallbackAction,
    ) -> Result<Outcome> {
        self.record(&action.data)?;
        Ok(Outcome::none().with_toast("ok"))
    }
}

pub fn text_event(chat: i64, text: &str) -> Event {
    Event::Text(TextMessage {
        chat_id: ChatId(chat),
        user_id: UserId(chat),
        username: Some("tester".to_string()),
        text: text.to_string(),
    })
}

pub fn callback_event(chat: i64, id: &str, data: &str) -> Event {
    Event::Callback(CallbackAction {
        callback_id: id.to_string(),
        user_id: UserId(chat),
        username: None,
        message: Some(MessageRef {
            chat_id: ChatId(chat),
            message_id: MessageId(77),
        }),
        data: data.to_string(),
    })
}
