//! Shared utilities for integration tests.
//!
//! Fakes for the engine's trait seams: a store that lines up concurrent
//! readers, scripted command and event handlers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Barrier, Semaphore};

use conductor::config::Config;
use conductor::queue::{DeliveryOutcome, EventDeliveryError, EventHandler, QueuedEvent};
use conductor::registry::{CommandHandler, HandlerError, HandlerOutput, Mutation, StateView};
use conductor::store::{
    AuditRecord, CommitReceipt, EntityRef, InMemoryStateStore, OptimisticWriter, StateEntry,
    StateStore, StoreError, Versioned, WriteMeta,
};
use conductor::ExecutionContext;

/// Config with millisecond backoffs and two queue workers.
pub fn fast_config() -> Config {
    let mut config = Config::for_test();
    config.queue.attempt_timeout_ms = 500;
    config
}

/// Commit `count` increments so the entity sits at version `count`.
pub async fn seed_versions(store: &dyn StateStore, entity: &EntityRef, count: u64) {
    for version in 0..count {
        store
            .compare_and_swap(entity, version, json!(version + 1), &WriteMeta::new("seed", "test"))
            .await
            .unwrap();
    }
}

pub fn increment(value: &Value) -> Value {
    json!(value.as_i64().unwrap_or(0) + 1)
}

pub async fn next_outcome(rx: &mut broadcast::Receiver<DeliveryOutcome>) -> DeliveryOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("outcome within 5s")
        .expect("outcome channel open")
}

// ============================================================================
// Stores
// ============================================================================

/// In-memory store whose first `parties` reads wait for each other, so
/// that many writers observe the same version before any of them commits.
pub struct LockstepStore {
    inner: InMemoryStateStore,
    barrier: Barrier,
    gated_reads: AtomicUsize,
    parties: usize,
}

impl LockstepStore {
    pub fn new(parties: usize) -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            barrier: Barrier::new(parties),
            gated_reads: AtomicUsize::new(0),
            parties,
        }
    }

    /// Seed through the inner store without touching the barrier.
    pub async fn seed(&self, entity: &EntityRef, count: u64) {
        seed_versions(&self.inner, entity, count).await;
    }
}

#[async_trait]
impl StateStore for LockstepStore {
    async fn read(&self, entity: &EntityRef) -> conductor::store::Result<Versioned> {
        let current = self.inner.read(entity).await?;
        if self.gated_reads.fetch_add(1, Ordering::SeqCst) < self.parties {
            self.barrier.wait().await;
        }
        Ok(current)
    }

    async fn entry(&self, entity: &EntityRef) -> conductor::store::Result<Option<StateEntry>> {
        self.inner.entry(entity).await
    }

    async fn compare_and_swap(
        &self,
        entity: &EntityRef,
        expected_version: u64,
        value: Value,
        meta: &WriteMeta,
    ) -> conductor::store::Result<CommitReceipt> {
        self.inner
            .compare_and_swap(entity, expected_version, value, meta)
            .await
    }

    async fn list(&self, entity_type: &str) -> conductor::store::Result<Vec<StateEntry>> {
        self.inner.list(entity_type).await
    }

    async fn audit_log(&self, entity: &EntityRef) -> conductor::store::Result<Vec<AuditRecord>> {
        self.inner.audit_log(entity).await
    }

    async fn audit_records(&self) -> conductor::store::Result<Vec<AuditRecord>> {
        self.inner.audit_records().await
    }
}

/// Store that loses every CAS race and counts the attempts.
#[derive(Default)]
pub struct AlwaysConflictingStore {
    inner: InMemoryStateStore,
    pub attempts: AtomicU32,
}

#[async_trait]
impl StateStore for AlwaysConflictingStore {
    async fn read(&self, entity: &EntityRef) -> conductor::store::Result<Versioned> {
        self.inner.read(entity).await
    }

    async fn entry(&self, entity: &EntityRef) -> conductor::store::Result<Option<StateEntry>> {
        self.inner.entry(entity).await
    }

    async fn compare_and_swap(
        &self,
        entity: &EntityRef,
        expected_version: u64,
        _value: Value,
        _meta: &WriteMeta,
    ) -> conductor::store::Result<CommitReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::VersionConflict {
            entity: entity.clone(),
            expected: expected_version,
            actual: expected_version + 1,
        })
    }

    async fn list(&self, entity_type: &str) -> conductor::store::Result<Vec<StateEntry>> {
        self.inner.list(entity_type).await
    }

    async fn audit_log(&self, entity: &EntityRef) -> conductor::store::Result<Vec<AuditRecord>> {
        self.inner.audit_log(entity).await
    }

    async fn audit_records(&self) -> conductor::store::Result<Vec<AuditRecord>> {
        self.inner.audit_records().await
    }
}

/// In-memory store with a fixed pause between a writer's read and its CAS,
/// widening the window in which concurrent writers collide.
pub struct SlowCasStore {
    inner: InMemoryStateStore,
    delay: Duration,
}

impl SlowCasStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl StateStore for SlowCasStore {
    async fn read(&self, entity: &EntityRef) -> conductor::store::Result<Versioned> {
        self.inner.read(entity).await
    }

    async fn entry(&self, entity: &EntityRef) -> conductor::store::Result<Option<StateEntry>> {
        self.inner.entry(entity).await
    }

    async fn compare_and_swap(
        &self,
        entity: &EntityRef,
        expected_version: u64,
        value: Value,
        meta: &WriteMeta,
    ) -> conductor::store::Result<CommitReceipt> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .compare_and_swap(entity, expected_version, value, meta)
            .await
    }

    async fn list(&self, entity_type: &str) -> conductor::store::Result<Vec<StateEntry>> {
        self.inner.list(entity_type).await
    }

    async fn audit_log(&self, entity: &EntityRef) -> conductor::store::Result<Vec<AuditRecord>> {
        self.inner.audit_log(entity).await
    }

    async fn audit_records(&self) -> conductor::store::Result<Vec<AuditRecord>> {
        self.inner.audit_records().await
    }
}

pub fn writer(store: Arc<dyn StateStore>, max_retries: u32) -> OptimisticWriter {
    let mut config = Config::for_test().store;
    config.max_retries = max_retries;
    OptimisticWriter::new(store, config.backoff())
}

// ============================================================================
// Command handlers
// ============================================================================

/// Sleeps, then sets `entity` to `"late"`. Flags when the sleep finished.
pub struct SleepyHandler {
    pub delay: Duration,
    pub entity: EntityRef,
    pub finished: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler for SleepyHandler {
    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        _state: StateView<'_>,
    ) -> Result<HandlerOutput, HandlerError> {
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutput::mutate(Mutation::set(
            self.entity.clone(),
            json!("late"),
        )))
    }
}

// ============================================================================
// Event handlers
// ============================================================================

/// Fails its first `fail_first` attempts. Each attempt waits for a permit
/// from `gate` first, and records when it started.
pub struct GatedFlaky {
    pub name: String,
    pub fail_first: u32,
    pub gate: Arc<Semaphore>,
    pub calls: Arc<AtomicU32>,
    pub started: Arc<Mutex<Vec<Instant>>>,
}

impl GatedFlaky {
    pub fn new(name: &str, fail_first: u32, open: bool) -> Self {
        Self {
            name: name.to_string(),
            fail_first,
            gate: Arc::new(Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 })),
            calls: Arc::new(AtomicU32::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventHandler for GatedFlaky {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, _event: Arc<QueuedEvent>) -> BoxFuture<'static, Result<(), EventDeliveryError>> {
        let gate = self.gate.clone();
        let calls = self.calls.clone();
        let started = self.started.clone();
        let fail_first = self.fail_first;
        Box::pin(async move {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| EventDeliveryError::Failed(e.to_string()))?;
            started.lock().unwrap().push(Instant::now());
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= fail_first {
                Err(EventDeliveryError::Failed(format!("smtp refused attempt {call}")))
            } else {
                Ok(())
            }
        })
    }
}

/// Panics on every call.
pub struct Panicking;

impl EventHandler for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn handle(&self, _event: Arc<QueuedEvent>) -> BoxFuture<'static, Result<(), EventDeliveryError>> {
        Box::pin(async move {
            let broken: Option<()> = None;
            broken.expect("handler bug");
            Ok(())
        })
    }
}
