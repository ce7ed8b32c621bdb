//! Dead-letter sinks.
//!
//! An event whose handlers still fail on its final attempt is wrapped in a
//! [`DeadLetter`] and handed to the configured [`DeadLetterSink`]. It is
//! never retried again.
//!
//! Sinks:
//! - [`MemoryDeadLetterLog`]: keeps entries in process for inspection
//! - [`ChannelDeadLetterSink`]: forwards entries to an mpsc receiver
//! - [`LoggingDeadLetterSink`]: only logs

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::QueuedEvent;

/// Errors that can occur while recording a dead letter.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Dead-letter sink closed")]
    Closed,

    #[error("Failed to publish dead letter: {0}")]
    PublishFailed(String),
}

/// Terminal record of an undeliverable event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: QueuedEvent,
    /// Handlers that failed on the final attempt.
    pub failed_handlers: Vec<String>,
    pub last_error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        event: QueuedEvent,
        failed_handlers: Vec<String>,
        last_error: impl Into<String>,
    ) -> Self {
        let attempts = event.attempt_count;
        Self {
            event,
            failed_handlers,
            last_error: last_error.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Whether entries are retained anywhere beyond the log line.
    fn is_durable(&self) -> bool {
        true
    }
}

/// Sink that only logs.
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        error!(
            event_id = %dead_letter.event.id,
            event_type = %dead_letter.event.event_type,
            attempts = dead_letter.attempts,
            handlers = ?dead_letter.failed_handlers,
            error = %dead_letter.last_error,
            "Event dead-lettered"
        );
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Sink forwarding dead letters over a channel.
pub struct ChannelDeadLetterSink {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    /// Returns the sink and the receiver consuming its entries.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            event_id = %dead_letter.event.id,
            event_type = %dead_letter.event.event_type,
            "Publishing to channel dead-letter sink"
        );
        self.sender.send(dead_letter).map_err(|_| DlqError::Closed)
    }
}

/// In-process dead-letter log.
#[derive(Default)]
pub struct MemoryDeadLetterLog {
    entries: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries in arrival order.
    pub fn entries(&self) -> Vec<DeadLetter> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterLog {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            event_id = %dead_letter.event.id,
            event_type = %dead_letter.event.event_type,
            attempts = dead_letter.attempts,
            error = %dead_letter.last_error,
            "Event moved to dead-letter log"
        );
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;
        entries.push(dead_letter);
        Ok(())
    }
}
