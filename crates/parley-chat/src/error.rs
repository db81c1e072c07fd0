use thiserror::Error;
use tracing::error;

/// Errors surfaced by the chat flow. Each variant maps to one HTTP status
/// class in the API layer; the message is safe to show to the caller.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing thread, model, settings or usage record
    #[error("{0}")]
    NotFound(String),

    /// Thread is in the wrong state for the request
    #[error("{0}")]
    Conflict(String),

    /// Ownership violation or exhausted credits
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Internal(String),
}

impl ChatError {
    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{what} not found"))
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(e: anyhow::Error) -> Self {
        // Keep the full chain in the logs; callers only see the summary.
        error!(error = ?e, "internal chat error");
        ChatError::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        error!("spawn_blocking join error: {}", e);
        ChatError::Internal("background task failed".into())
    }
}
