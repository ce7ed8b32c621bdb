//! Per-invocation execution context.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

/// Ambient data for one command invocation.
///
/// Built once by the orchestrator and handed by reference to hooks and the
/// handler. There are no setters.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    invocation_id: Uuid,
    subject: String,
    command: String,
    parameters: Value,
    started_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
    deadline: Instant,
}

impl ExecutionContext {
    /// New context whose deadline is `budget` from now.
    pub fn new(
        command: impl Into<String>,
        subject: impl Into<String>,
        parameters: Value,
        budget: Duration,
    ) -> Self {
        let started_at = Utc::now();
        let deadline_at = chrono::Duration::from_std(budget)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let now = Instant::now();
        let deadline = now.checked_add(budget).unwrap_or_else(|| far_future(now));

        Self {
            invocation_id: Uuid::new_v4(),
            subject: subject.into(),
            command: command.into(),
            parameters,
            started_at,
            deadline_at,
            deadline,
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Parameter by key, if parameters are an object containing it.
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock deadline, for reporting.
    pub fn deadline_at(&self) -> DateTime<Utc> {
        self.deadline_at
    }

    /// Monotonic deadline used for timeouts.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before the deadline, zero once passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

fn far_future(now: Instant) -> Instant {
    // ~30 years; Instant has no MAX.
    now + Duration::from_secs(86_400 * 365 * 30)
}
