use thiserror::Error;

pub type Result<T> = std::result::Result<T, WardenError>;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("content store error: {0}")]
    Store(String),

    #[error("hash {0} is not pinned")]
    NotPinned(String),

    #[error(
        "quota exceeded for {principal}: requested={requested} used={used} limit={limit}"
    )]
    QuotaExceeded {
        principal: String,
        requested: String,
        used: String,
        limit: String,
    },

    #[error("{lane} task for {hash} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        lane: String,
        hash: String,
        attempts: u32,
        last_error: String,
    },

    #[error("workflow for {0} abandoned: record no longer tracked")]
    Abandoned(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    /// Whether the throttler should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WardenError::Http(_) | WardenError::Store(_) | WardenError::Io(_)
        )
    }
}

impl From<reqwest::Error> for WardenError {
    fn from(error: reqwest::Error) -> Self {
        WardenError::Http(error.to_string())
    }
}
