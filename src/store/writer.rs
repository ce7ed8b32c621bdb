//! Optimistic write loop.
//!
//! read → mutate → compare-and-swap, retried on lost races with
//! exponential backoff plus jitter. The mutation closure is re-applied to
//! the freshly read value on every attempt, so a retried writer always
//! builds on the state that beat it.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CommitReceipt, EntityRef, Result, StateStore, StoreError, WriteMeta};
use crate::utils::retry::BackoffPolicy;

/// Runs the optimistic concurrency protocol against a [`StateStore`].
#[derive(Clone)]
pub struct OptimisticWriter {
    store: Arc<dyn StateStore>,
    backoff: BackoffPolicy,
}

impl OptimisticWriter {
    pub fn new(store: Arc<dyn StateStore>, backoff: BackoffPolicy) -> Self {
        Self { store, backoff }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Apply `mutate` to an entity.
    ///
    /// With `expected_version: None` the write retries lost CAS races up to
    /// the policy's `max_retries`, then fails with
    /// `StoreError::RetriesExhausted`. With `Some(v)` exactly one CAS is
    /// attempted against `v` and a mismatch is returned as
    /// `StoreError::VersionConflict` without retrying.
    ///
    /// If `deadline` passes before an attempt starts, the write is abandoned
    /// with `StoreError::DeadlineExceeded`; nothing is committed.
    pub async fn write<F>(
        &self,
        entity: &EntityRef,
        expected_version: Option<u64>,
        meta: &WriteMeta,
        deadline: Option<Instant>,
        mutate: F,
    ) -> Result<CommitReceipt>
    where
        F: Fn(&Value) -> Value + Send + Sync,
    {
        if let Some(expected) = expected_version {
            return self
                .attempt(entity, Some(expected), meta, deadline, &mutate)
                .await;
        }

        let result = (|| async { self.attempt(entity, None, meta, deadline, &mutate).await })
            .retry(self.backoff.to_backon())
            .sleep(move |delay| tokio::time::sleep(until_deadline(delay, deadline)))
            .when(StoreError::is_conflict)
            .notify(|err, delay| {
                warn!(
                    entity = %entity,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "CAS conflict, retrying with fresh state"
                );
            })
            .await;

        match result {
            Err(StoreError::VersionConflict { entity, .. }) => {
                warn!(
                    entity = %entity,
                    attempts = self.backoff.max_retries + 1,
                    "CAS retries exhausted"
                );
                Err(StoreError::RetriesExhausted {
                    entity,
                    attempts: self.backoff.max_retries + 1,
                })
            }
            other => other,
        }
    }

    async fn attempt<F>(
        &self,
        entity: &EntityRef,
        expected_version: Option<u64>,
        meta: &WriteMeta,
        deadline: Option<Instant>,
        mutate: &F,
    ) -> Result<CommitReceipt>
    where
        F: Fn(&Value) -> Value + Send + Sync,
    {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::DeadlineExceeded {
                entity: entity.clone(),
            });
        }

        let current = self.store.read(entity).await?;
        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(StoreError::VersionConflict {
                    entity: entity.clone(),
                    expected,
                    actual: current.version,
                });
            }
        }

        let next = mutate(&current.value);
        let receipt = self
            .store
            .compare_and_swap(entity, current.version, next, meta)
            .await?;

        debug!(
            entity = %entity,
            before = current.version,
            after = receipt.entry.version,
            "Optimistic write committed"
        );
        Ok(receipt)
    }
}

/// Never sleep past `deadline`; the next attempt then reports it.
fn until_deadline(delay: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
        None => delay,
    }
}
