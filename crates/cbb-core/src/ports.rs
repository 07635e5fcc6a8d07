use std::time::Duration;

use async_trait::async_trait;

use crate::{
    domain::Cursor,
    messaging::types::{CallbackAction, Outcome, TextMessage, Update},
    Result,
};

/// Inbound side of the provider: the long-poll update feed.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Fetch updates with id >= `cursor`. Blocks server-side for at most
    /// `timeout` when nothing is pending.
    ///
    /// Conflicts (another poller bound to the same feed) surface as an error for
    /// which [`crate::Error::is_conflict`] returns true.
    async fn fetch(&self, cursor: Cursor, timeout: Duration) -> Result<Vec<Update>>;
}

/// Application logic for plain text messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, msg: &TextMessage) -> Result<Outcome>;
}

/// Application logic for inline-button presses.
///
/// Implementations must not acknowledge the callback themselves; the dispatch
/// supervisor does that exactly once, using [`Outcome::toast`] as the text.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn on_callback(&self, action: &CallbackAction) -> Result<Outcome>;
}
