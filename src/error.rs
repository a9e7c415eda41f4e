use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScrapeError>;

/// Everything that can go wrong between a task descriptor and its stored rows.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid input: {0}")]
    Validation(String),

    /// Network failure or timeout. The only retryable kind.
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("upstream rejected {verb}: {message}")]
    Upstream { verb: String, message: String },

    #[error("could not extract {verb} ({mode} {tense}): {reason}")]
    Extraction {
        verb: String,
        mode: String,
        tense: String,
        reason: String,
    },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ScrapeError {
    /// Stable label stored alongside failed batch tasks.
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::Validation(_) => "validation",
            ScrapeError::Transport { .. } => "transport",
            ScrapeError::Upstream { .. } => "upstream",
            ScrapeError::Extraction { .. } => "extraction",
            ScrapeError::Persistence(_) => "persistence",
            ScrapeError::NotFound(_) => "not_found",
            ScrapeError::Timeout(_) => "timeout",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ScrapeError::Transport { .. })
    }
}

impl From<rusqlite::Error> for ScrapeError {
    fn from(e: rusqlite::Error) -> Self {
        ScrapeError::Persistence(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ScrapeError {
    fn from(e: tokio::task::JoinError) -> Self {
        ScrapeError::Persistence(format!("blocking task aborted: {}", e))
    }
}
