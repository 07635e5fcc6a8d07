//! Default application logic: a small menu bot over the state store.
//!
//! Content generation is out of scope; this responder answers commands, keeps
//! the profile and history up to date and drives the inline menus.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    classifier::{Classifier, Intent},
    domain::{ChatId, UserId},
    messaging::types::{
        CallbackAction, InlineButton, InlineKeyboard, Outcome, Reply, TextMessage,
    },
    ports::{CallbackHandler, MessageHandler},
    profile::{Profile, Role},
    state::StateStore,
    utils::truncate_text,
    Result,
};

pub const UNAUTHORIZED_TEXT: &str = "Unauthorized. Contact the bot owner for access.";

const HELP_TEXT: &str = "Commands:\n/start - main menu\n/status - your settings\n/reset - forget settings and history\n/help - this message";

pub struct Responder {
    store: Arc<StateStore>,
    classifier: Arc<dyn Classifier>,
    allowed_users: Vec<i64>,
}

impl Responder {
    /// An empty `allowed_users` list lets everyone in.
    pub fn new(
        store: Arc<StateStore>,
        classifier: Arc<dyn Classifier>,
        allowed_users: Vec<i64>,
    ) -> Self {
        Self {
            store,
            classifier,
            allowed_users,
        }
    }

    fn is_authorized(&self, user: UserId) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&user.0)
    }

    async fn reset(&self, chat_id: ChatId) {
        self.store.reset(chat_id).await;
        // Resets must survive a crash before the next autosave.
        if let Err(e) = self.store.flush().await {
            tracing::warn!(chat_id = chat_id.0, "flush after reset failed: {e}");
        }
    }

    async fn answer(&self, chat_id: ChatId, text: String, keyboard: Option<InlineKeyboard>) -> Outcome {
        self.store
            .push_history(chat_id, Role::Assistant, text.clone())
            .await;
        self.store
            .update(chat_id, |p| p.last_answer = Some(text.clone()))
            .await;
        Outcome::reply(Reply::Send {
            chat_id,
            text,
            keyboard,
        })
    }
}

#[async_trait]
impl MessageHandler for Responder {
    async fn on_message(&self, msg: &TextMessage) -> Result<Outcome> {
        let chat_id = msg.chat_id;
        if !self.is_authorized(msg.user_id) {
            tracing::info!(user_id = msg.user_id.0, "rejected message from unauthorized user");
            return Ok(Outcome::reply(Reply::text(chat_id, UNAUTHORIZED_TEXT)));
        }

        self.store
            .push_history(chat_id, Role::User, msg.text.clone())
            .await;
        let count = self.store.update(chat_id, |p| p.bump("messages")).await;

        let outcome = match self.classifier.classify(&msg.text) {
            Intent::Start => {
                let profile = self
                    .store
                    .update(chat_id, |p| {
                        p.page = "main".to_string();
                        p.clone()
                    })
                    .await;
                let name = msg.username.as_deref().unwrap_or("there");
                self.answer(
                    chat_id,
                    format!("Hi {name}! Pick an option below."),
                    Some(menu_keyboard(&profile)),
                )
                .await
            }
            Intent::Help => self.answer(chat_id, HELP_TEXT.to_string(), None).await,
            Intent::Status => {
                let profile = self.store.get(chat_id).await;
                let turns = self.store.history(chat_id).await.len();
                self.answer(chat_id, status_text(&profile, turns), None)
                    .await
            }
            Intent::Reset => {
                self.reset(chat_id).await;
                Outcome::reply(Reply::text(
                    chat_id,
                    "Done. Your settings and history were reset.",
                ))
            }
            Intent::Chat => {
                let text = format!(
                    "Noted: \"{}\" (message #{count}). Send /help for commands.",
                    truncate_text(msg.text.trim(), 80)
                );
                self.answer(chat_id, text, None).await
            }
        };
        Ok(outcome)
    }
}

#[async_trait]
impl CallbackHandler for Responder {
    async fn on_callback(&self, action: &CallbackAction) -> Result<Outcome> {
        if !self.is_authorized(action.user_id) {
            return Ok(Outcome::none().with_toast("Unauthorized"));
        }
        let (Some(message), Some(chat_id)) = (action.message, action.chat_id()) else {
            return Ok(Outcome::none().with_toast("This menu has expired"));
        };

        let mut parts = action.data.splitn(3, ':');
        let verb = parts.next().unwrap_or_default();
        let arg = parts.next();
        let value = parts.next();

        let toast = match (verb, arg, value) {
            ("page", Some(page), None) => {
                self.store
                    .update(chat_id, |p| p.page = page.to_string())
                    .await;
                None
            }
            ("toggle", Some(name), None) => {
                let on = self.store.update(chat_id, |p| p.flip(name)).await;
                Some(format!("{name}: {}", if on { "on" } else { "off" }))
            }
            ("set", Some(field), Some(v)) => {
                let ok = self.store.update(chat_id, |p| p.set_field(field, v)).await;
                if !ok {
                    return Ok(Outcome::none().with_toast("Unknown setting"));
                }
                Some(format!("{field} = {v}"))
            }
            ("reset", None, None) => {
                self.reset(chat_id).await;
                Some("Reset done".to_string())
            }
            _ => return Ok(Outcome::none().with_toast("Unknown action")),
        };

        let profile = self.store.get(chat_id).await;
        let turns = self.store.history(chat_id).await.len();
        let mut out = Outcome::reply(Reply::Edit {
            message,
            text: page_text(&profile, turns),
            keyboard: Some(menu_keyboard(&profile)),
        });
        out.toast = toast;
        Ok(out)
    }
}

fn status_text(p: &Profile, turns: usize) -> String {
    let toggles = if p.toggles.is_empty() {
        "none".to_string()
    } else {
        p.toggles
            .iter()
            .map(|(k, v)| format!("{k}={}", if *v { "on" } else { "off" }))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "Status\npage: {}\ngame: {}\npersona: {}\nmode: {}\nverbosity: {}\ntoggles: {}\nmessages: {}\nhistory: {} turns",
        p.page,
        p.game.as_deref().unwrap_or("-"),
        p.persona,
        p.mode,
        p.verbosity,
        toggles,
        p.counters.get("messages").copied().unwrap_or(0),
        turns
    )
}

fn page_text(p: &Profile, turns: usize) -> String {
    match p.page.as_str() {
        "settings" => format!(
            "Settings\nverbosity: {}\nhints: {}",
            p.verbosity,
            if p.toggle("hints") { "on" } else { "off" }
        ),
        "status" => status_text(p, turns),
        _ => "Main menu".to_string(),
    }
}

fn menu_keyboard(p: &Profile) -> InlineKeyboard {
    match p.page.as_str() {
        "settings" => InlineKeyboard::new(vec![
            vec![InlineButton::new("Toggle hints", "toggle:hints")],
            vec![
                InlineButton::new("Brief", "set:verbosity:brief"),
                InlineButton::new("Normal", "set:verbosity:normal"),
                InlineButton::new("Detailed", "set:verbosity:detailed"),
            ],
            vec![InlineButton::new("Reset everything", "reset")],
            vec![InlineButton::new("« Back", "page:main")],
        ]),
        "status" => InlineKeyboard::one_per_row(vec![InlineButton::new("« Back", "page:main")]),
        _ => InlineKeyboard::one_per_row(vec![
            InlineButton::new("Settings", "page:settings"),
            InlineButton::new("Status", "page:status"),
        ]),
    }
}
