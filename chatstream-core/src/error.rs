use thiserror::Error;

use crate::model::StreamStatus;

/// Core error type for chatstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatStreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("stream for message {message_id} is already active")]
    AlreadyActive { message_id: String },

    #[error("no stream for message {message_id}")]
    NotFound { message_id: String },

    #[error("cannot {op} stream {message_id} while {status}")]
    InvalidState {
        message_id: String,
        op: &'static str,
        status: StreamStatus,
    },

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    /// Network read failed mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("snapshot storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatStreamError {
    /// Short, stable kind label used in telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AlreadyActive { .. } => "already_active",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::Transport(_) => "transport",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatStreamError>;
