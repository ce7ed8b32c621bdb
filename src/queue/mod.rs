//! Asynchronous event queue.
//!
//! `enqueue` is a synchronous push onto a bounded in-memory queue and
//! returns immediately. A fixed pool of worker tasks drains the queue and
//! delivers each event to every handler routed for its type:
//!
//! - each handler call runs in its own task, bounded by the per-attempt
//!   timeout
//! - handlers that fail are retried with exponential backoff; handlers that
//!   already succeeded for the event are not invoked again
//! - after `max_attempts` the event goes to the dead-letter sink
//!
//! When the queue is full the configured overflow policy drops either the
//! oldest ready event or the new one. Drops are counted, logged and
//! broadcast; `enqueue` never fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::utils::bootstrap::default_worker_count;
use crate::utils::retry::BackoffPolicy;

pub mod dlq;
mod worker;

pub use dlq::{
    ChannelDeadLetterSink, DeadLetter, DeadLetterSink, DlqError, LoggingDeadLetterSink,
    MemoryDeadLetterLog,
};
pub use worker::EventQueue;

/// Capacity of the delivery outcome broadcast channel.
const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Failure of a single handler invocation. Never reaches a command caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventDeliveryError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler timed out after {0}ms")]
    Timeout(u64),

    #[error("Handler panicked")]
    Panicked,

    #[error("Event queue shut down before delivery")]
    ShutDown,
}

// ============================================================================
// Events
// ============================================================================

/// A deferred, non-critical unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    /// Delivery attempts started so far.
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        attempt_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            attempt_count: 0,
            next_retry_at: now,
            attempt_timeout_ms: attempt_timeout.as_millis() as u64,
            max_attempts: max_attempts.max(1),
            enqueued_at: now,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Consumer of queued events.
///
/// The returned future must be `'static`; it runs in its own task so that a
/// panicking or hung handler cannot take a worker down with it.
pub trait EventHandler: Send + Sync {
    /// Stable name, used to track per-handler delivery and in dead letters.
    fn name(&self) -> &str;

    fn handle(&self, event: Arc<QueuedEvent>)
        -> BoxFuture<'static, Result<(), EventDeliveryError>>;
}

/// Event type → handlers table, fixed once the queue starts.
#[derive(Default, Clone)]
pub struct EventRoutes {
    routes: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl EventRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        let handlers = self.routes.entry(event_type.clone()).or_default();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            warn!(
                event_type = %event_type,
                handler = %handler.name(),
                "Duplicate handler name for event type"
            );
        }
        handlers.push(handler);
    }

    pub fn handlers(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.routes
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// What to drop when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    DropNewest,
}

/// Event queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum events waiting for delivery (ready plus scheduled retries).
    pub capacity: usize,
    /// Worker tasks; CPU count when unset.
    pub workers: Option<usize>,
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            workers: None,
            attempt_timeout_ms: 5_000,
            max_attempts: 3,
            base_backoff_ms: 1_000,
            backoff_factor: 2.0,
            max_backoff_ms: 60_000,
            jitter: true,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl QueueConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count).max(1)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_backoff_ms),
            factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_backoff_ms),
            max_retries: self.max_attempts.saturating_sub(1),
            jitter: if self.jitter { 0.25 } else { 0.0 },
        }
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Final fate of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        event_id: Uuid,
        event_type: String,
        attempts: u32,
    },
    DeadLettered {
        event_id: Uuid,
        event_type: String,
        attempts: u32,
    },
    Dropped {
        event_id: Uuid,
        event_type: String,
    },
    /// No handler is routed for the event type.
    Unrouted {
        event_id: Uuid,
        event_type: String,
    },
}

impl DeliveryOutcome {
    pub fn event_id(&self) -> Uuid {
        match self {
            Self::Delivered { event_id, .. }
            | Self::DeadLettered { event_id, .. }
            | Self::Dropped { event_id, .. }
            | Self::Unrouted { event_id, .. } => *event_id,
        }
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped_events: u64,
    pub unrouted: u64,
    /// Events waiting or in flight.
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    unrouted: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, pending: u64) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped_events: self.dropped.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            pending,
        }
    }
}

fn outcome_channel() -> broadcast::Sender<DeliveryOutcome> {
    broadcast::channel(OUTCOME_CHANNEL_CAPACITY).0
}
