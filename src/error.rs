//! Crate-wide error kinds. Library code returns typed [`Error`]s so
//! `PollerCore` can classify failures; binary-boundary code (CLI, admin API)
//! wraps them in `anyhow::Result` with `.context(...)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad URL, missing token, negative timeout. Fatal at construction.
    #[error("validation error: {0}")]
    Validation(String),

    /// 401/403 from a provider. Non-retryable.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// 404 on a repository or branch. Non-retryable.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// 429 or a zero-remaining rate limit window.
    #[error("rate limit exceeded, resets at {reset_time}")]
    RateLimitExceeded {
        reset_time: chrono::DateTime<chrono::Utc>,
    },

    /// Connection errors, timeouts, 5xx. Retried inside `GitClient`.
    #[error("network or server error: {0}")]
    Network(String),

    /// 4xx (other than 408/429) from the dispatcher target. Terminal.
    #[error("dispatcher rejected event ({status}): {body}")]
    DispatcherClient { status: u16, body: String },

    /// 5xx/connection/timeout from the dispatcher target. Retryable.
    #[error("dispatcher delivery failed: {0}")]
    DispatcherServer(String),

    /// Benign: an event with this id already exists.
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    /// Any database error. Propagated without partial mutation.
    #[error("storage error: {0}")]
    Storage(String),

    /// Config file failed to parse or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The calling context was canceled (shutdown in progress).
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// Only network/5xx classes are retryable from the caller's
    /// perspective.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::DispatcherServer(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::Network(e.to_string())
        } else if let Some(status) = e.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                Error::Authentication(e.to_string())
            } else if status.as_u16() == 404 {
                Error::RepositoryNotFound(e.to_string())
            } else if status.is_server_error() {
                Error::Network(e.to_string())
            } else {
                Error::Validation(e.to_string())
            }
        } else {
            Error::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
