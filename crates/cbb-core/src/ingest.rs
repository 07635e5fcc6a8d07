//! The long-poll ingestion loop.
//!
//! Cursor policy: the in-memory cursor is moved past an update *before* its
//! handler runs. A handler that crashes the process therefore does not get the
//! same poisoned update redelivered forever; in exchange an update can be lost
//! if the process dies mid-handler after a cursor save. Delivery is otherwise
//! at-least-once: the saved cursor lags the in-memory one by at most the save
//! interval, and everything after it is replayed on restart.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    cursor::CursorStore,
    dispatch::Dispatcher,
    domain::Cursor,
    messaging::types::Update,
    ports::UpdateSource,
    utils::random_between,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Dispatching,
    Backoff,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub poll_timeout: Duration,
    pub conflict_backoff_min: Duration,
    pub conflict_backoff_max: Duration,
    pub fetch_error_delay: Duration,
    pub cursor_save_interval: Duration,
}

impl IngestConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            poll_timeout: cfg.poll_timeout,
            conflict_backoff_min: cfg.conflict_backoff_min,
            conflict_backoff_max: cfg.conflict_backoff_max,
            fetch_error_delay: cfg.fetch_error_delay,
            cursor_save_interval: cfg.cursor_save_interval,
        }
    }
}

#[derive(Debug)]
struct Position {
    cursor: Cursor,
    persisted: Cursor,
    last_save: Instant,
}

pub struct IngestionLoop {
    source: Arc<dyn UpdateSource>,
    dispatcher: Arc<Dispatcher>,
    cursors: CursorStore,
    cfg: IngestConfig,
    position: Mutex<Position>,
    state: std::sync::Mutex<LoopState>,
}

impl IngestionLoop {
    /// Build the loop, resuming from the last saved cursor.
    pub fn new(
        source: Arc<dyn UpdateSource>,
        dispatcher: Arc<Dispatcher>,
        cursors: CursorStore,
        cfg: IngestConfig,
    ) -> Self {
        let cursor = cursors.load();
        tracing::info!(%cursor, path = %cursors.path().display(), "resuming update feed");
        Self {
            source,
            dispatcher,
            cursors,
            cfg,
            position: Mutex::new(Position {
                cursor,
                persisted: cursor,
                last_save: Instant::now(),
            }),
            state: std::sync::Mutex::new(LoopState::Idle),
        }
    }

    pub async fn cursor(&self) -> Cursor {
        self.position.lock().await.cursor
    }

    pub fn state(&self) -> LoopState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(LoopState::Stopped)
    }

    fn set_state(&self, next: LoopState) {
        if let Ok(mut s) = self.state.lock() {
            *s = next;
        }
    }

    /// Poll and dispatch until `shutdown` fires, then save the cursor.
    ///
    /// An in-flight dispatch batch is always finished; only the fetch and the
    /// backoff sleeps are cut short by shutdown.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<()> {
        while !shutdown.is_cancelled() {
            self.set_state(LoopState::Idle);
            self.cycle(shutdown).await;
        }

        let res = self.checkpoint().await;
        self.set_state(LoopState::Stopped);
        let cursor = self.cursor().await;
        tracing::info!(%cursor, "ingestion stopped");
        res
    }

    async fn cycle(&self, shutdown: &CancellationToken) {
        self.set_state(LoopState::Fetching);
        let cursor = self.cursor().await;

        let fetched = tokio::select! {
          res = self.source.fetch(cursor, self.cfg.poll_timeout) => res,
          _ = shutdown.cancelled() => return,
        };

        match fetched {
            Ok(updates) if updates.is_empty() => {
                self.save_if_due().await;
            }
            Ok(updates) => {
                self.set_state(LoopState::Dispatching);
                self.dispatch_batch(updates).await;
            }
            Err(e) if e.is_conflict() => {
                let wait = random_between(self.cfg.conflict_backoff_min, self.cfg.conflict_backoff_max);
                tracing::warn!(
                    backoff_ms = wait.as_millis() as u64,
                    "another poller is consuming this bot's updates: {e}"
                );
                self.pause(wait, shutdown).await;
            }
            Err(e) => {
                tracing::warn!(
                    retry_in_ms = self.cfg.fetch_error_delay.as_millis() as u64,
                    "fetching updates failed: {e}"
                );
                self.pause(self.cfg.fetch_error_delay, shutdown).await;
            }
        }
    }

    async fn dispatch_batch(&self, updates: Vec<Update>) {
        for update in updates {
            {
                let mut pos = self.position.lock().await;
                if update.id < pos.cursor.0 {
                    tracing::debug!(update_id = update.id, cursor = %pos.cursor, "skipping already consumed update");
                    continue;
                }
                pos.cursor.advance_past(update.id);
            }

            match update.event {
                Some(event) => {
                    tracing::debug!(
                        update_id = update.id,
                        chat_id = event.chat_id().map(|c| c.0),
                        kind = event.kind(),
                        "dispatching update"
                    );
                    self.dispatcher.dispatch(event).await;
                }
                None => tracing::debug!(update_id = update.id, "ignoring unsupported update"),
            }

            self.save_if_due().await;
        }
    }

    async fn pause(&self, wait: Duration, shutdown: &CancellationToken) {
        self.set_state(LoopState::Backoff);
        tokio::select! {
          _ = tokio::time::sleep(wait) => {}
          _ = shutdown.cancelled() => {}
        }
    }

    async fn save_if_due(&self) {
        let mut pos = self.position.lock().await;
        if pos.cursor == pos.persisted || pos.last_save.elapsed() < self.cfg.cursor_save_interval {
            return;
        }
        if let Err(e) = self.save_locked(&mut pos) {
            tracing::warn!(cursor = %pos.cursor, "cursor save failed (will retry): {e}");
        }
    }

    /// Save the in-memory cursor now if it moved since the last save.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut pos = self.position.lock().await;
        if pos.cursor == pos.persisted {
            return Ok(());
        }
        self.save_locked(&mut pos)
    }

    fn save_locked(&self, pos: &mut Position) -> Result<()> {
        pos.last_save = Instant::now();
        self.cursors.save(pos.cursor)?;
        pos.persisted = pos.cursor;
        tracing::debug!(cursor = %pos.cursor, "cursor saved");
        Ok(())
    }
}
