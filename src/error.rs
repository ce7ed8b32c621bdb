//! Caller-facing error taxonomy.
//!
//! Every variant means the command did not commit anything. Event delivery
//! failures never appear here; they stay inside the queue.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{EntityRef, StoreError};

/// Why a command invocation failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// A blocking pre-hook, the parameter schema or the registry rejected
    /// the request.
    #[error("{reason}")]
    ValidationBlocked { hook: String, reason: String },

    #[error("Rate limit exceeded for {category}")]
    RateLimited {
        category: String,
        reset_at: DateTime<Utc>,
    },

    /// Circuit breaker open.
    #[error("Command {command} is temporarily unavailable")]
    CommandUnavailable {
        command: String,
        retry_at: Option<DateTime<Utc>>,
    },

    #[error("{0}")]
    HandlerError(String),

    #[error("Deadline of {deadline_ms}ms exceeded")]
    TimeoutError { deadline_ms: u64 },

    #[error("Concurrent modification of {entity}: {detail}")]
    ConflictError { entity: EntityRef, detail: String },
}

impl CommandError {
    /// Stable wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationBlocked { .. } => "ValidationBlocked",
            Self::RateLimited { .. } => "RateLimited",
            Self::CommandUnavailable { .. } => "CommandUnavailable",
            Self::HandlerError(_) => "HandlerError",
            Self::TimeoutError { .. } => "TimeoutError",
            Self::ConflictError { .. } => "ConflictError",
        }
    }

    /// Map a store failure hit while committing.
    pub fn from_store(err: StoreError, deadline_ms: u64) -> Self {
        match err {
            StoreError::VersionConflict { ref entity, .. }
            | StoreError::RetriesExhausted { ref entity, .. } => Self::ConflictError {
                entity: entity.clone(),
                detail: err.to_string(),
            },
            StoreError::DeadlineExceeded { .. } => Self::TimeoutError { deadline_ms },
            other => Self::HandlerError(format!("State store failure: {other}")),
        }
    }

    pub fn body(&self) -> ErrorBody {
        let reset_at = match self {
            Self::RateLimited { reset_at, .. } => Some(*reset_at),
            Self::CommandUnavailable { retry_at, .. } => *retry_at,
            _ => None,
        };
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
            reset_at,
        }
    }
}

/// Serialized form of a [`CommandError`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}
