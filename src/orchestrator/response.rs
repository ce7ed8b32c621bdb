//! Caller-facing request and response shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::state::ExecutionState;
use crate::error::{CommandError, ErrorBody};

/// One command invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub parameters: Value,
    pub subject: String,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, parameters: Value, subject: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters,
            subject: subject.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub execution_time_ms: u64,
    pub hooks_run: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<Uuid>,
    pub invocation_id: Uuid,
    /// Terminal state of the invocation.
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Structured outcome of a command invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub metadata: ResponseMetadata,
    #[serde(skip)]
    pub cause: Option<CommandError>,
}

impl CommandResponse {
    pub(crate) fn completed(result: Value, metadata: ResponseMetadata) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            metadata,
            cause: None,
        }
    }

    pub(crate) fn failed(err: CommandError, metadata: ResponseMetadata) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(err.body()),
            metadata,
            cause: Some(err),
        }
    }

    /// Wire name of the error kind, if the command failed.
    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}
