//! Versioned state store with optimistic concurrency and an audit trail.
//!
//! This module contains:
//! - `StateStore` trait: read + compare-and-swap primitive every backend implements
//! - `OptimisticWriter`: the read → mutate → CAS → retry loop built on top
//! - `InMemoryStateStore`: per-entity slot implementation
//!
//! Every successful CAS bumps the entity version by exactly one and appends
//! one `AuditRecord` in the same atomic unit. Entries are never deleted,
//! only superseded.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::utils::retry::BackoffPolicy;

pub mod memory;
pub mod writer;

pub use memory::InMemoryStateStore;
pub use writer::OptimisticWriter;

// ============================================================================
// Errors
// ============================================================================

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict on {entity}: expected {expected}, found {actual}")]
    VersionConflict {
        entity: EntityRef,
        expected: u64,
        actual: u64,
    },

    #[error("Conflict retries exhausted on {entity} after {attempts} attempts")]
    RetriesExhausted { entity: EntityRef, attempts: u32 },

    #[error("Deadline exceeded before committing {entity}")]
    DeadlineExceeded { entity: EntityRef },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for a lost CAS race (the only retryable store error).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

// ============================================================================
// Data model
// ============================================================================

/// Identity of one piece of shared state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Current value and version of an entity.
///
/// An entity that was never written reads as `Value::Null` at version 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
}

impl Versioned {
    pub fn absent() -> Self {
        Self {
            value: Value::Null,
            version: 0,
        }
    }
}

/// One committed version of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub value: Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    /// SHA-256 of the superseded version; `None` for version 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_version_hash: Option<String>,
}

impl StateEntry {
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(&self.entity_type, &self.entity_id)
    }

    pub fn versioned(&self) -> Versioned {
        Versioned {
            value: self.value.clone(),
            version: self.version,
        }
    }
}

/// Immutable record of one committed state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub audit_id: Uuid,
    pub command: String,
    pub subject: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before_version: u64,
    pub after_version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Who is writing, recorded on the entry and its audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMeta {
    pub command: String,
    pub subject: String,
}

impl WriteMeta {
    pub fn new(command: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            subject: subject.into(),
        }
    }
}

/// Outcome of a successful compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    pub entry: StateEntry,
    pub audit: AuditRecord,
}

/// Hash of a committed version, chained into its successor.
pub fn version_hash(version: u64, value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.to_be_bytes());
    // serde_json maps are ordered, so this encoding is canonical.
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Trait
// ============================================================================

/// Interface for versioned state persistence.
///
/// Implementations:
/// - `InMemoryStateStore`: in-process store with per-entity slots
///
/// Backends must make `compare_and_swap` atomic per entity: the version
/// check, the entry write and the audit append either all happen or none do.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current value and version of an entity.
    async fn read(&self, entity: &EntityRef) -> Result<Versioned>;

    /// Fetch the full current entry, if the entity was ever written.
    async fn entry(&self, entity: &EntityRef) -> Result<Option<StateEntry>>;

    /// Write `value` as version `expected_version + 1`.
    ///
    /// Fails with `StoreError::VersionConflict` if the stored version is no
    /// longer `expected_version`.
    async fn compare_and_swap(
        &self,
        entity: &EntityRef,
        expected_version: u64,
        value: Value,
        meta: &WriteMeta,
    ) -> Result<CommitReceipt>;

    /// Current entries of one entity type, ordered by id.
    async fn list(&self, entity_type: &str) -> Result<Vec<StateEntry>>;

    /// Audit trail of one entity in version order.
    async fn audit_log(&self, entity: &EntityRef) -> Result<Vec<AuditRecord>>;

    /// Every audit record, ordered by timestamp.
    async fn audit_records(&self) -> Result<Vec<AuditRecord>>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Optimistic write retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retries after the first CAS attempt before `ConflictError`.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff multiplier.
    pub factor: f64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Randomize delays to avoid lockstep retries.
    pub jitter: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            factor: 2.0,
            max_delay_ms: 1000,
            jitter: true,
        }
    }
}

impl StoreConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: std::time::Duration::from_millis(self.base_delay_ms),
            factor: self.factor,
            max_delay: std::time::Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
            jitter: if self.jitter { 0.25 } else { 0.0 },
        }
    }
}
