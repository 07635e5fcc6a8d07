use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-chat settings and scratch state.
///
/// Every field has a serde default so older state files (or files written by a
/// newer build with extra fields) still load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub page: String,
    pub game: Option<String>,
    pub persona: String,
    pub mode: String,
    pub verbosity: String,
    pub toggles: BTreeMap<String, bool>,
    pub last_answer: Option<String>,
    pub counters: BTreeMap<String, i64>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            page: "main".to_string(),
            game: None,
            persona: "default".to_string(),
            mode: "chat".to_string(),
            verbosity: "normal".to_string(),
            toggles: BTreeMap::new(),
            last_answer: None,
            counters: BTreeMap::new(),
        }
    }
}

impl Profile {
    pub fn toggle(&self, name: &str) -> bool {
        self.toggles.get(name).copied().unwrap_or(false)
    }

    /// Flip a feature toggle and return the new value.
    pub fn flip(&mut self, name: &str) -> bool {
        let v = !self.toggle(name);
        self.toggles.insert(name.to_string(), v);
        v
    }

    pub fn bump(&mut self, counter: &str) -> i64 {
        let c = self.counters.entry(counter.to_string()).or_insert(0);
        *c += 1;
        *c
    }

    /// Set one of the named string settings. Returns false for unknown fields.
    pub fn set_field(&mut self, field: &str, value: &str) -> bool {
        let value = value.to_string();
        match field {
            "page" => self.page = value,
            "game" => self.game = Some(value),
            "persona" => self.persona = value,
            "mode" => self.mode = value,
            "verbosity" => self.verbosity = value,
            _ => return false,
        }
        true
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Assistant,
}

/// One dialogue turn. Missing fields default like the rest of the state file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}
