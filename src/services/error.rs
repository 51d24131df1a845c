//! Typed errors for the agent contract and the run service.
//!
//! Everything else in the crate propagates `anyhow::Error`.

/// Failure of a single external agent call.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The model answered with nothing usable.
    #[error("{context}: empty response")]
    EmptyResponse { context: String },

    /// The response could not be decoded into the expected schema.
    #[error("{context}: response does not match schema: {message}")]
    Schema { context: String, message: String },

    #[error("{context}: request timed out")]
    Timeout { context: String },

    /// The upstream service answered with an error status.
    #[error("upstream error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisting an agent's output failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl AgentError {
    pub fn schema(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn empty(context: impl Into<String>) -> Self {
        Self::EmptyResponse {
            context: context.into(),
        }
    }

    pub fn storage(e: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", e))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AgentError::Timeout {
                context: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if let Some(status) = e.status() {
            AgentError::Upstream {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            AgentError::Transport(e.to_string())
        }
    }
}

impl From<image::ImageError> for AgentError {
    fn from(e: image::ImageError) -> Self {
        AgentError::Transport(format!("image processing failed: {}", e))
    }
}

/// Rejections surfaced to whatever front end drives the run service.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is valid but conflicts with the run's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
