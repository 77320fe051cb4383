use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for the engine core.
///
/// Validation/NotFound/Conflict/Disabled are terminal and surfaced to the
/// caller immediately. Execution errors on the queue path are retried by the
/// queue provider; on the webhook path they become a 500 envelope.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("disabled: {0}")]
    Disabled(String),
    #[error("cannot classify payload: {0}")]
    Classification(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("queue error: {0}")]
    Queue(String),
}

impl EngineError {
    /// Status used when the error escapes through the webhook dispatch path.
    pub fn http_status(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) | EngineError::Classification(_) => StatusCode::CONFLICT,
            EngineError::Disabled(_) => StatusCode::GONE,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Execution(_) | EngineError::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Queue-side retry policy: only execution and queue failures are worth
    /// another delivery attempt, the rest will fail identically every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Execution(_) | EngineError::Queue(_))
    }
}
