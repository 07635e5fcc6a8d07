use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::ChatId,
    errors::Error,
    persist::write_atomic,
    profile::{Profile, Role, Turn},
    utils::iso_timestamp_utc,
    Result,
};

const STATE_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ChatState {
    profile: Profile,
    #[serde(deserialize_with = "lenient_turns")]
    history: VecDeque<Turn>,
}

/// Unreadable turns are dropped one by one instead of failing the whole chat.
fn lenient_turns<'de, D>(de: D) -> std::result::Result<VecDeque<Turn>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Value>::deserialize(de)?;
    Ok(raw
        .into_iter()
        .filter_map(|v| match serde_json::from_value::<Turn>(v) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!("dropping unreadable history turn: {e}");
                None
            }
        })
        .collect())
}

#[derive(Debug, Serialize)]
struct StateFile {
    version: u32,
    saved_at: Option<String>,
    chats: BTreeMap<i64, ChatState>,
}

/// Read side of [`StateFile`]: chats stay raw so each one is decoded on its own.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStateFile {
    chats: BTreeMap<i64, Value>,
}

#[derive(Debug, Default)]
struct Inner {
    chats: BTreeMap<i64, ChatState>,
    /// Bumped on every mutation; compared against `flushed` to skip no-op writes.
    generation: u64,
    flushed: u64,
}

impl Inner {
    fn chat(&mut self, chat_id: ChatId) -> &mut ChatState {
        if !self.chats.contains_key(&chat_id.0) {
            self.generation += 1;
        }
        self.chats.entry(chat_id.0).or_default()
    }
}

/// Per-chat profiles and rolling history, held in memory behind one lock and
/// checkpointed to a single JSON file.
///
/// Mutations are visible immediately and durable after the next [`flush`].
/// Handlers that need durability right away (e.g. a reset) call `flush` themselves.
///
/// [`flush`]: StateStore::flush
pub struct StateStore {
    path: Option<PathBuf>,
    history_cap: usize,
    inner: Mutex<Inner>,
    flush_lock: Mutex<()>,
}

impl StateStore {
    /// Open the store backed by `path`, loading whatever was last committed.
    ///
    /// An unreadable file is moved aside (`<name>.corrupt`) and the store starts
    /// empty rather than refusing to start.
    pub fn open(path: impl Into<PathBuf>, history_cap: usize) -> Self {
        let path = path.into();
        let chats = load_state_file(&path);
        Self {
            path: Some(path),
            history_cap: history_cap.max(1),
            inner: Mutex::new(Inner {
                chats,
                ..Inner::default()
            }),
            flush_lock: Mutex::new(()),
        }
    }

    /// Store without a backing file; `flush` is a no-op. Used by tests.
    pub fn in_memory(history_cap: usize) -> Self {
        Self {
            path: None,
            history_cap: history_cap.max(1),
            inner: Mutex::new(Inner::default()),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Profile for `chat_id`, created with defaults on first contact.
    pub async fn get(&self, chat_id: ChatId) -> Profile {
        self.inner.lock().await.chat(chat_id).profile.clone()
    }

    pub async fn set(&self, chat_id: ChatId, profile: Profile) {
        let mut st = self.inner.lock().await;
        st.chat(chat_id).profile = profile;
        st.generation += 1;
    }

    /// Read-modify-write a profile under the store lock.
    pub async fn update<R>(&self, chat_id: ChatId, f: impl FnOnce(&mut Profile) -> R) -> R {
        let mut st = self.inner.lock().await;
        let out = f(&mut st.chat(chat_id).profile);
        st.generation += 1;
        out
    }

    /// Append a turn, evicting the oldest ones beyond the cap.
    pub async fn push_history(&self, chat_id: ChatId, role: Role, text: impl Into<String>) {
        let cap = self.history_cap;
        let mut st = self.inner.lock().await;
        let chat = st.chat(chat_id);
        chat.history.push_back(Turn {
            role,
            text: text.into(),
            at: Some(iso_timestamp_utc()),
        });
        while chat.history.len() > cap {
            chat.history.pop_front();
        }
        st.generation += 1;
    }

    pub async fn history(&self, chat_id: ChatId) -> Vec<Turn> {
        let st = self.inner.lock().await;
        st.chats
            .get(&chat_id.0)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear_history(&self, chat_id: ChatId) {
        let mut st = self.inner.lock().await;
        st.chat(chat_id).history.clear();
        st.generation += 1;
    }

    /// Recreate the chat's profile with defaults and drop its history.
    pub async fn reset(&self, chat_id: ChatId) {
        let mut st = self.inner.lock().await;
        st.chats.insert(chat_id.0, ChatState::default());
        st.generation += 1;
    }

    pub async fn chat_count(&self) -> usize {
        self.inner.lock().await.chats.len()
    }

    /// Atomically write the whole store. Returns `Ok(false)` when there was
    /// nothing new to write (or no backing file).
    pub async fn flush(&self) -> Result<bool> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };
        let _serial = self.flush_lock.lock().await;

        let (generation, bytes) = {
            let st = self.inner.lock().await;
            if st.generation == st.flushed && path.exists() {
                return Ok(false);
            }
            let file = StateFile {
                version: STATE_VERSION,
                saved_at: Some(iso_timestamp_utc()),
                chats: st.chats.clone(),
            };
            (st.generation, serde_json::to_vec_pretty(&file)?)
        };

        // fsync and rename block; keep them off the async workers.
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| Error::External(format!("state write task failed: {e}")))??;

        let mut st = self.inner.lock().await;
        st.flushed = st.flushed.max(generation);
        Ok(true)
    }

    /// Flush every `every` until `cancel` fires, then flush once more.
    ///
    /// Write failures are logged and retried on the next tick.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + every, every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  _ = tick.tick() => {
                    if let Err(e) = store.flush().await {
                      tracing::warn!("state autosave failed: {e}");
                    }
                  }
                }
            }

            match store.flush().await {
                Ok(_) => tracing::info!("state flushed on shutdown"),
                Err(e) => tracing::error!("final state flush failed: {e}"),
            }
        })
    }
}

fn load_state_file(path: &Path) -> BTreeMap<i64, ChatState> {
    let txt = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "state file unreadable, starting empty: {e}");
            return BTreeMap::new();
        }
    };
    if txt.trim().is_empty() {
        return BTreeMap::new();
    }

    let raw = match serde_json::from_str::<RawStateFile>(&txt) {
        Ok(raw) => raw,
        Err(e) => {
            let aside = path.with_extension("corrupt");
            tracing::warn!(
                path = %path.display(),
                aside = %aside.display(),
                "state file corrupt, starting empty: {e}"
            );
            if let Err(e) = std::fs::rename(path, &aside) {
                tracing::warn!(path = %path.display(), "could not move corrupt state file aside: {e}");
            }
            return BTreeMap::new();
        }
    };

    let chats: BTreeMap<i64, ChatState> = raw
        .chats
        .into_iter()
        .filter_map(|(id, v)| match serde_json::from_value::<ChatState>(v) {
            Ok(chat) => Some((id, chat)),
            Err(e) => {
                tracing::warn!(chat_id = id, "dropping unreadable chat state: {e}");
                None
            }
        })
        .collect();
    tracing::info!(chats = chats.len(), "state loaded");
    chats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::temp_path_for;

    #[tokio::test]
    async fn get_creates_defaults_on_miss() {
        let store = StateStore::in_memory(5);
        assert_eq!(store.chat_count().await, 0);
        let p = store.get(ChatId(1)).await;
        assert_eq!(p, Profile::default());
        assert_eq!(store.chat_count().await, 1);
    }

    #[tokio::test]
    async fn history_keeps_most_recent_turns_in_order() {
        let cap = 4;
        let store = StateStore::in_memory(cap);
        let chat = ChatId(9);
        for i in 0..(cap + 3) {
            store.push_history(chat, Role::User, format!("t{i}")).await;
        }
        let texts: Vec<String> = store
            .history(chat)
            .await
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(texts, vec!["t3", "t4", "t5", "t6"]);

        store.clear_history(chat).await;
        assert!(store.history(chat).await.is_empty());
    }

    #[tokio::test]
    async fn flush_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path, 10);
        store
            .update(ChatId(555), |p| p.persona = "pirate".to_string())
            .await;
        store.push_history(ChatId(555), Role::User, "hello").await;
        assert!(store.flush().await.unwrap());
        // Nothing changed since.
        assert!(!store.flush().await.unwrap());

        let reopened = StateStore::open(&path, 10);
        assert_eq!(reopened.get(ChatId(555)).await.persona, "pirate");
        assert_eq!(reopened.history(ChatId(555)).await[0].text, "hello");
    }

    #[tokio::test]
    async fn truncated_temp_file_does_not_affect_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path, 10);
        store.update(ChatId(1), |p| p.mode = "quiz".to_string()).await;
        store.flush().await.unwrap();

        // A crash mid-write leaves a half-written temp file next to the real one.
        let full = std::fs::read(&path).unwrap();
        std::fs::write(temp_path_for(&path), &full[..full.len() / 2]).unwrap();

        let reopened = StateStore::open(&path, 10);
        assert_eq!(reopened.get(ChatId(1)).await.mode, "quiz");

        // The next flush simply overwrites the stale temp file.
        reopened.update(ChatId(1), |p| p.mode = "chat".to_string()).await;
        reopened.flush().await.unwrap();
        assert_eq!(StateStore::open(&path, 10).get(ChatId(1)).await.mode, "chat");
    }

    #[tokio::test]
    async fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"chats\": {\"1\": ").unwrap();

        let store = StateStore::open(&path, 10);
        assert_eq!(store.chat_count().await, 0);
        assert!(path.with_extension("corrupt").exists());
    }

    #[tokio::test]
    async fn reads_files_with_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"version":7,"future":true,"chats":{"42":{"profile":{"game":"chess","extra":1},"history":[{"role":"user","text":"hi"}],"pins":[]}}}"#,
        )
        .unwrap();

        let store = StateStore::open(&path, 10);
        let p = store.get(ChatId(42)).await;
        assert_eq!(p.game.as_deref(), Some("chess"));
        assert_eq!(p.page, "main");
        assert_eq!(store.history(ChatId(42)).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_quarantine_still_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        // A non-empty directory where the quarantine copy should go makes the rename fail.
        let aside = path.with_extension("corrupt");
        std::fs::create_dir(&aside).unwrap();
        std::fs::write(aside.join("keep"), "x").unwrap();

        let store = StateStore::open(&path, 10);
        assert_eq!(store.chat_count().await, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");

        // The next flush replaces the unreadable file.
        store.update(ChatId(1), |p| p.mode = "quiz".to_string()).await;
        assert!(store.flush().await.unwrap());
        assert_eq!(StateStore::open(&path, 10).get(ChatId(1)).await.mode, "quiz");
    }

    #[tokio::test]
    async fn incomplete_turns_do_not_discard_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"chats":{
                "1":{"profile":{"persona":"pirate"},"history":[{"role":"user"},{"role":"robot","text":"x"},{"role":"assistant","text":"ok"}]},
                "2":{"profile":{"persona":17}},
                "3":{"profile":{"mode":"quiz"}}
            }}"#,
        )
        .unwrap();

        let store = StateStore::open(&path, 10);
        assert!(!path.with_extension("corrupt").exists());
        assert_eq!(store.get(ChatId(1)).await.persona, "pirate");
        let history = store.history(ChatId(1)).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "");
        assert_eq!(history[1].text, "ok");
        // A chat that cannot be read at all is dropped alone.
        assert_eq!(store.get(ChatId(3)).await.mode, "quiz");
        assert_eq!(store.get(ChatId(2)).await, Profile::default());
    }

    #[tokio::test]
    async fn set_replaces_the_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::open(&path, 10);

        let mut profile = store.get(ChatId(8)).await;
        profile.persona = "bard".to_string();
        profile.toggles.insert("hints".to_string(), true);
        store.set(ChatId(8), profile.clone()).await;
        assert_eq!(store.get(ChatId(8)).await, profile);

        assert!(store.flush().await.unwrap());
        assert_eq!(StateStore::open(&path, 10).get(ChatId(8)).await, profile);
    }

    #[tokio::test]
    async fn reset_recreates_defaults() {
        let store = StateStore::in_memory(3);
        store.update(ChatId(2), |p| p.flip("hints")).await;
        store.push_history(ChatId(2), Role::User, "x").await;
        store.reset(ChatId(2)).await;
        assert_eq!(store.get(ChatId(2)).await, Profile::default());
        assert!(store.history(ChatId(2)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_writes_on_interval_and_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(StateStore::open(&path, 10));
        let cancel = CancellationToken::new();
        let handle = store.spawn_autosave(Duration::from_secs(60), cancel.clone());

        store.update(ChatId(1), |p| p.bump("messages")).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(path.exists());

        store.update(ChatId(1), |p| p.bump("messages")).await;
        cancel.cancel();
        handle.await.unwrap();

        let reopened = StateStore::open(&path, 10);
        assert_eq!(reopened.get(ChatId(1)).await.counters["messages"], 2);
    }
}
