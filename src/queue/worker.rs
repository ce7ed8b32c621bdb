//! Queue storage and the worker pool that drains it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    outcome_channel, Counters, DeadLetter, DeadLetterSink, DeliveryOutcome, EventDeliveryError,
    EventHandler, EventRoutes, OverflowPolicy, QueueConfig, QueueStats, QueuedEvent,
};
use crate::utils::retry::BackoffPolicy;

/// Idle workers re-check the queue at least this often.
const IDLE_POLL: Duration = Duration::from_secs(60);

/// An event waiting for (re)delivery.
struct Pending {
    event: QueuedEvent,
    /// Indices of handlers still owed a successful delivery; `None` means all.
    remaining: Option<Vec<usize>>,
}

impl Pending {
    fn new(event: QueuedEvent) -> Self {
        Self {
            event,
            remaining: None,
        }
    }
}

/// A retry parked until `due`. Ordered so the heap pops the earliest first.
struct Scheduled {
    due: Instant,
    seq: u64,
    pending: Pending,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    delayed: BinaryHeap<Scheduled>,
    in_flight: usize,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn waiting(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|s| s.due <= now) {
            if let Some(scheduled) = self.delayed.pop() {
                self.ready.push_back(scheduled.pending);
            }
        }
    }
}

enum Next {
    Deliver(Pending),
    WaitUntil(Instant),
}

struct Shared {
    config: QueueConfig,
    backoff: BackoffPolicy,
    routes: EventRoutes,
    sink: Arc<dyn DeadLetterSink>,
    state: Mutex<QueueState>,
    notify: Notify,
    counters: Counters,
    outcomes: broadcast::Sender<DeliveryOutcome>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, outcome: DeliveryOutcome) {
        // No subscribers is the normal case.
        let _ = self.outcomes.send(outcome);
    }

    fn push(&self, event: QueuedEvent) {
        Counters::bump(&self.counters.enqueued);
        let capacity = self.config.capacity.max(1);

        const FULL: &str = "Event queue full, dropping event";
        let (accepted, dropped) = {
            let mut state = self.lock();
            if state.closed {
                (false, Some((event, "Event queue shut down, dropping event")))
            } else if state.waiting() < capacity {
                state.ready.push_back(Pending::new(event));
                (true, None)
            } else {
                match self.config.overflow {
                    OverflowPolicy::DropNewest => (false, Some((event, FULL))),
                    OverflowPolicy::DropOldest => match state.ready.pop_front() {
                        Some(oldest) => {
                            state.ready.push_back(Pending::new(event));
                            (true, Some((oldest.event, FULL)))
                        }
                        // Only scheduled retries left; keep them.
                        None => (false, Some((event, FULL))),
                    },
                }
            }
        };

        if let Some((event, reason)) = dropped {
            self.record_drop(event, reason);
        }
        if accepted {
            self.notify.notify_one();
        }
    }

    fn record_drop(&self, event: QueuedEvent, reason: &str) {
        Counters::bump(&self.counters.dropped);
        warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            policy = ?self.config.overflow,
            "{reason}"
        );
        self.publish(DeliveryOutcome::Dropped {
            event_id: event.id,
            event_type: event.event_type,
        });
    }

    fn next(&self) -> Next {
        let mut state = self.lock();
        let now = Instant::now();
        state.promote_due(now);
        match state.ready.pop_front() {
            Some(pending) => {
                state.in_flight += 1;
                Next::Deliver(pending)
            }
            None => Next::WaitUntil(
                state
                    .delayed
                    .peek()
                    .map(|s| s.due)
                    .unwrap_or(now + IDLE_POLL),
            ),
        }
    }

    /// Mark one in-flight delivery as settled.
    fn finish(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    async fn deliver(&self, mut pending: Pending) {
        let handlers = self.routes.handlers(&pending.event.event_type);
        if handlers.is_empty() {
            Counters::bump(&self.counters.unrouted);
            debug!(
                event_id = %pending.event.id,
                event_type = %pending.event.event_type,
                "No handler routed for event type"
            );
            self.finish();
            self.publish(DeliveryOutcome::Unrouted {
                event_id: pending.event.id,
                event_type: pending.event.event_type,
            });
            return;
        }

        pending.event.attempt_count += 1;
        let targets = pending
            .remaining
            .take()
            .unwrap_or_else(|| (0..handlers.len()).collect());
        let event = Arc::new(pending.event.clone());
        let timeout = event.attempt_timeout();

        let calls = targets.into_iter().map(|idx| {
            let handler = Arc::clone(&handlers[idx]);
            let event = Arc::clone(&event);
            async move {
                // Building the future happens inside the task too, so a
                // handler that panics before returning one is contained.
                let task = tokio::spawn(async move {
                    tokio::time::timeout(timeout, handler.handle(event)).await
                });
                let result = match task.await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(EventDeliveryError::Timeout(timeout.as_millis() as u64)),
                    Err(_) => Err(EventDeliveryError::Panicked),
                };
                (idx, result)
            }
        });

        let failed: Vec<(usize, EventDeliveryError)> = join_all(calls)
            .await
            .into_iter()
            .filter_map(|(idx, result)| result.err().map(|e| (idx, e)))
            .collect();

        let attempts = pending.event.attempt_count;
        if failed.is_empty() {
            Counters::bump(&self.counters.delivered);
            self.finish();
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                attempts,
                "Event delivered"
            );
            self.publish(DeliveryOutcome::Delivered {
                event_id: event.id,
                event_type: event.event_type.clone(),
                attempts,
            });
            return;
        }

        for (idx, err) in &failed {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                handler = %handlers[*idx].name(),
                attempt = attempts,
                max_attempts = event.max_attempts,
                error = %err,
                "Event handler failed"
            );
        }

        if pending.event.attempts_exhausted() {
            self.finish();
            self.dead_letter(pending.event, handlers, failed).await;
        } else {
            self.schedule_retry(pending.event, failed.into_iter().map(|(i, _)| i).collect());
        }
    }

    async fn dead_letter(
        &self,
        event: QueuedEvent,
        handlers: &[Arc<dyn EventHandler>],
        failed: Vec<(usize, EventDeliveryError)>,
    ) {
        let last_error = failed
            .last()
            .map(|(_, e)| e.to_string())
            .unwrap_or_default();
        let failed_handlers = failed
            .iter()
            .map(|(idx, _)| handlers[*idx].name().to_string())
            .collect();
        let (event_id, event_type, attempts) =
            (event.id, event.event_type.clone(), event.attempt_count);

        if let Err(e) = self
            .sink
            .publish(DeadLetter::new(event, failed_handlers, last_error))
            .await
        {
            error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Failed to record dead letter"
            );
        }

        Counters::bump(&self.counters.dead_lettered);
        self.publish(DeliveryOutcome::DeadLettered {
            event_id,
            event_type,
            attempts,
        });
    }

    fn schedule_retry(&self, mut event: QueuedEvent, remaining: Vec<usize>) {
        let delay = self
            .backoff
            .delay_for_attempt(event.attempt_count.saturating_sub(1));
        event.next_retry_at = chrono::Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = event.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling event retry"
        );
        Counters::bump(&self.counters.retried);

        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.delayed.push(Scheduled {
                due: Instant::now() + delay,
                seq,
                pending: Pending {
                    event,
                    remaining: Some(remaining),
                },
            });
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        // An idle worker may be sleeping toward a later deadline.
        self.notify.notify_one();
    }

    /// Take every event still waiting, ready or scheduled.
    fn take_waiting(&self) -> Vec<Pending> {
        let mut state = self.lock();
        let delayed = std::mem::take(&mut state.delayed);
        state
            .ready
            .drain(..)
            .chain(delayed.into_iter().map(|s| s.pending))
            .collect()
    }

    /// Dead-letter an event the workers will never reach.
    async fn abandon(&self, mut pending: Pending) {
        let handlers = self.routes.handlers(&pending.event.event_type);
        let targets = pending
            .remaining
            .take()
            .unwrap_or_else(|| (0..handlers.len()).collect());
        let failed: Vec<_> = targets
            .into_iter()
            .map(|idx| (idx, EventDeliveryError::ShutDown))
            .collect();
        if failed.is_empty() {
            Counters::bump(&self.counters.unrouted);
            self.publish(DeliveryOutcome::Unrouted {
                event_id: pending.event.id,
                event_type: pending.event.event_type,
            });
            return;
        }
        warn!(
            event_id = %pending.event.id,
            event_type = %pending.event.event_type,
            attempts = pending.event.attempt_count,
            "Event abandoned at shutdown"
        );
        self.dead_letter(pending.event, handlers, failed).await;
    }
}

async fn run_worker(worker_id: usize, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!(worker_id, "Event queue worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match shared.next() {
            Next::Deliver(pending) => shared.deliver(pending).await,
            Next::WaitUntil(due) => {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep_until(due) => {}
                }
            }
        }
    }
    debug!(worker_id, "Event queue worker stopped");
}

/// Bounded asynchronous event queue with a fixed worker pool.
pub struct EventQueue {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventQueue {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn start(
        config: QueueConfig,
        routes: EventRoutes,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker_count = config.worker_count();
        let shared = Arc::new(Shared {
            backoff: config.backoff(),
            config,
            routes,
            sink,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            counters: Counters::default(),
            outcomes: outcome_channel(),
        });

        let workers = (0..worker_count)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&shared), shutdown_rx.clone())))
            .collect();

        info!(
            workers = worker_count,
            capacity = shared.config.capacity,
            max_attempts = shared.config.max_attempts,
            event_types = ?shared.routes.event_types(),
            "Event queue started"
        );

        Self {
            shared,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Queue an event for asynchronous delivery.
    ///
    /// Never blocks and never fails; an event dropped by the overflow
    /// policy is reported through [`stats`](Self::stats) and
    /// [`subscribe`](Self::subscribe). Returns the event id.
    pub fn enqueue(&self, event_type: impl Into<String>, payload: Value) -> Uuid {
        let event = QueuedEvent::new(
            event_type,
            payload,
            self.shared.config.attempt_timeout(),
            self.shared.config.max_attempts,
        );
        let id = event.id;
        self.shared.push(event);
        id
    }

    pub fn stats(&self) -> QueueStats {
        let pending = {
            let state = self.shared.lock();
            (state.waiting() + state.in_flight) as u64
        };
        self.shared.counters.snapshot(pending)
    }

    /// Stream of final delivery outcomes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.shared.outcomes.subscribe()
    }

    pub fn routes(&self) -> &EventRoutes {
        &self.shared.routes
    }

    /// Stop accepting events and wait for workers to finish their current
    /// delivery. Events still waiting, including scheduled retries, are
    /// dead-lettered with [`EventDeliveryError::ShutDown`].
    pub async fn shutdown(&self) {
        self.shared.lock().closed = true;
        self.shutdown.send_replace(true);
        self.shared.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Event queue worker ended abnormally");
            }
        }

        let abandoned = self.shared.take_waiting();
        let count = abandoned.len();
        for pending in abandoned {
            self.shared.abandon(pending).await;
        }

        info!(abandoned = count, "Event queue stopped");
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
