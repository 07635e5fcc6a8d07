use std::time::Duration;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the ingestion loop
/// and the dispatch supervisor can handle failures consistently.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// The provider reported that another consumer holds the same update feed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Rpc(e) if e.is_conflict())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a provider call after the retry budget was spent (or a
/// non-retryable provider answer).
#[derive(Clone, Debug, thiserror::Error)]
#[error("{method} failed: {description}")]
pub struct RpcError {
    pub method: String,
    pub description: String,
    pub error_code: Option<i64>,
    pub retry_after: Option<Duration>,
}

impl RpcError {
    pub fn new(method: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            description: description.into(),
            error_code: None,
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: Option<i64>) -> Self {
        self.error_code = code;
        self
    }

    /// The provider has no dedicated status for a competing poller, so this is
    /// matched on the description text.
    pub fn is_conflict(&self) -> bool {
        let lower = self.description.to_lowercase();
        lower.contains("conflict") || lower.contains("terminated by other getupdates request")
    }
}
