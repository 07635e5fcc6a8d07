use std::path::{Path, PathBuf};

use crate::{domain::Cursor, persist::write_atomic, Result};

/// Durable home of the update cursor: a single integer in a text file.
#[derive(Clone, Debug)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved cursor, or 0 when the file is missing or unreadable.
    ///
    /// A corrupt file must never block startup: the worst case is replaying
    /// whatever the provider still holds.
    pub fn load(&self) -> Cursor {
        let txt = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Cursor(0),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "cursor file unreadable, starting at 0: {e}");
                return Cursor(0);
            }
        };

        match txt.trim().parse::<i64>() {
            Ok(v) if v >= 0 => Cursor(v),
            _ => {
                tracing::warn!(path = %self.path.display(), "cursor file corrupt, starting at 0");
                Cursor(0)
            }
        }
    }

    /// Atomically replace the saved cursor.
    ///
    /// Failures are returned for logging only; the in-memory cursor stays
    /// authoritative until a later save succeeds.
    pub fn save(&self, cursor: Cursor) -> Result<()> {
        write_atomic(&self.path, format!("{}\n", cursor.0).as_bytes())
    }
}
