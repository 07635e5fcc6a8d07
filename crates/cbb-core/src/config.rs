use std::{env, fs, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, Result};

/// Typed configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    // Provider
    pub bot_token: String,
    pub api_base: String,
    pub allowed_users: Vec<i64>,

    // Polling / RPC
    pub poll_timeout: Duration,
    pub request_timeout: Duration,
    pub rpc_max_retries: u32,
    pub rpc_base_delay: Duration,
    pub retry_after_cap: Duration,

    // Ingestion policy
    pub conflict_backoff_min: Duration,
    pub conflict_backoff_max: Duration,
    pub fetch_error_delay: Duration,
    pub restart_cooldown: Duration,

    // Persistence
    pub cursor_file: PathBuf,
    pub cursor_save_interval: Duration,
    pub state_file: PathBuf,
    pub state_flush_interval: Duration,
    pub history_cap: usize,

    // Health endpoint
    pub health_addr: Option<SocketAddr>,
}

impl Config {
    /// Load from the process environment (plus `.env`, which never overrides
    /// variables that are already set).
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_str = |key: &str| get(key).and_then(non_empty);
        let env_u64 = |key: &str| env_str(key).and_then(|s| s.trim().parse::<u64>().ok());

        // Required
        let bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let api_base = env_str("TELEGRAM_API_BASE")
            .unwrap_or_else(|| "https://api.telegram.org".to_string())
            .trim_end_matches('/')
            .to_string();
        let allowed_users = parse_csv_i64(env_str("ALLOWED_USERS"));

        // Timeouts and retry policy
        let poll_timeout = Duration::from_secs(env_u64("POLL_TIMEOUT_SECS").unwrap_or(25));
        let request_timeout = Duration::from_secs(env_u64("REQUEST_TIMEOUT_SECS").unwrap_or(15));
        let rpc_max_retries = env_u64("RPC_MAX_RETRIES").unwrap_or(3).clamp(1, 20) as u32;
        let rpc_base_delay = Duration::from_millis(env_u64("RPC_BASE_DELAY_MS").unwrap_or(800));
        let retry_after_cap = Duration::from_secs(env_u64("RETRY_AFTER_CAP_SECS").unwrap_or(60));

        // Conflict backoff (bounds swapped when inverted)
        let a = Duration::from_millis(env_u64("CONFLICT_BACKOFF_MIN_MS").unwrap_or(5_000));
        let b = Duration::from_millis(env_u64("CONFLICT_BACKOFF_MAX_MS").unwrap_or(15_000));
        let (conflict_backoff_min, conflict_backoff_max) = if a <= b { (a, b) } else { (b, a) };

        let fetch_error_delay =
            Duration::from_millis(env_u64("FETCH_ERROR_DELAY_MS").unwrap_or(2_000));
        let restart_cooldown = Duration::from_secs(env_u64("RESTART_COOLDOWN_SECS").unwrap_or(3));

        // Persistence
        let cursor_file =
            PathBuf::from(env_str("CURSOR_FILE").unwrap_or("data/cursor.txt".to_string()));
        let cursor_save_interval =
            Duration::from_secs(env_u64("CURSOR_SAVE_INTERVAL_SECS").unwrap_or(5));
        let state_file =
            PathBuf::from(env_str("STATE_FILE").unwrap_or("data/state.json".to_string()));
        let state_flush_interval =
            Duration::from_secs(env_u64("STATE_FLUSH_INTERVAL_SECS").unwrap_or(60).max(1));
        let history_cap = env_u64("HISTORY_CAP").unwrap_or(20).max(1) as usize;

        // Health endpoint: explicit address wins, otherwise PORT (PaaS convention).
        let health_addr = match env_str("HEALTH_ADDR") {
            Some(raw) => Some(raw.trim().parse::<SocketAddr>().map_err(|e| {
                Error::Config(format!("HEALTH_ADDR is not a socket address ({raw}): {e}"))
            })?),
            None => env_u64("PORT").map(|p| SocketAddr::from(([0, 0, 0, 0], p as u16))),
        };

        Ok(Self {
            bot_token,
            api_base,
            allowed_users,
            poll_timeout,
            request_timeout,
            rpc_max_retries,
            rpc_base_delay,
            retry_after_cap,
            conflict_backoff_min,
            conflict_backoff_max,
            fetch_error_delay,
            restart_cooldown,
            cursor_file,
            cursor_save_interval,
            state_file,
            state_flush_interval,
            history_cap,
            health_addr,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
