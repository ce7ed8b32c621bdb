//! In-memory state store.
//!
//! Each entity owns a slot behind its own mutex. The outer map lock is only
//! held long enough to find or create a slot, so writers to unrelated
//! entities never wait on each other for the CAS itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::{
    version_hash, AuditRecord, CommitReceipt, EntityRef, Result, StateEntry, StateStore,
    StoreError, Versioned, WriteMeta,
};

/// Current entry plus the entity's audit trail.
///
/// Both live in the slot so one lock covers the version bump and the audit
/// append.
#[derive(Default)]
struct EntitySlot {
    entry: Option<StateEntry>,
    audit: Vec<AuditRecord>,
}

/// In-process state store.
#[derive(Default)]
pub struct InMemoryStateStore {
    slots: RwLock<HashMap<EntityRef, Arc<Mutex<EntitySlot>>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn existing_slot(&self, entity: &EntityRef) -> Option<Arc<Mutex<EntitySlot>>> {
        self.slots.read().await.get(entity).cloned()
    }

    async fn slot(&self, entity: &EntityRef) -> Arc<Mutex<EntitySlot>> {
        if let Some(slot) = self.existing_slot(entity).await {
            return slot;
        }
        let mut slots = self.slots.write().await;
        slots.entry(entity.clone()).or_default().clone()
    }

    async fn all_slots(&self) -> Vec<(EntityRef, Arc<Mutex<EntitySlot>>)> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read(&self, entity: &EntityRef) -> Result<Versioned> {
        match self.existing_slot(entity).await {
            Some(slot) => Ok(slot
                .lock()
                .await
                .entry
                .as_ref()
                .map(StateEntry::versioned)
                .unwrap_or_else(Versioned::absent)),
            None => Ok(Versioned::absent()),
        }
    }

    async fn entry(&self, entity: &EntityRef) -> Result<Option<StateEntry>> {
        match self.existing_slot(entity).await {
            Some(slot) => Ok(slot.lock().await.entry.clone()),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        entity: &EntityRef,
        expected_version: u64,
        value: Value,
        meta: &WriteMeta,
    ) -> Result<CommitReceipt> {
        let slot = self.slot(entity).await;
        let mut slot = slot.lock().await;

        let actual = slot.entry.as_ref().map(|e| e.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                entity: entity.clone(),
                expected: expected_version,
                actual,
            });
        }

        let now = Utc::now();
        let prior_version_hash = slot
            .entry
            .as_ref()
            .map(|prior| version_hash(prior.version, &prior.value));
        let entry = StateEntry {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            value,
            version: actual + 1,
            updated_at: now,
            updated_by: meta.subject.clone(),
            prior_version_hash,
        };
        let audit = AuditRecord {
            audit_id: Uuid::new_v4(),
            command: meta.command.clone(),
            subject: meta.subject.clone(),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            before_version: actual,
            after_version: entry.version,
            timestamp: now,
        };

        slot.entry = Some(entry.clone());
        slot.audit.push(audit.clone());

        debug!(
            entity = %entity,
            version = entry.version,
            command = %meta.command,
            "Committed state entry"
        );

        Ok(CommitReceipt { entry, audit })
    }

    async fn list(&self, entity_type: &str) -> Result<Vec<StateEntry>> {
        let mut entries = Vec::new();
        for (key, slot) in self.all_slots().await {
            if key.entity_type != entity_type {
                continue;
            }
            if let Some(entry) = slot.lock().await.entry.clone() {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(entries)
    }

    async fn audit_log(&self, entity: &EntityRef) -> Result<Vec<AuditRecord>> {
        match self.existing_slot(entity).await {
            Some(slot) => Ok(slot.lock().await.audit.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn audit_records(&self) -> Result<Vec<AuditRecord>> {
        let mut records = Vec::new();
        for (_, slot) in self.all_slots().await {
            records.extend(slot.lock().await.audit.iter().cloned());
        }
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.entity_type.cmp(&b.entity_type))
                .then_with(|| a.entity_id.cmp(&b.entity_id))
                .then_with(|| a.after_version.cmp(&b.after_version))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> WriteMeta {
        WriteMeta::new("test.command", "tester")
    }

    #[tokio::test]
    async fn test_read_absent_entity() {
        let store = InMemoryStateStore::new();
        let read = store.read(&EntityRef::new("user", "1")).await.unwrap();
        assert_eq!(read, Versioned::absent());
        assert!(store
            .entry(&EntityRef::new("user", "1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_first_write_lands_at_version_one() {
        let store = InMemoryStateStore::new();
        let user = EntityRef::new("user", "1");

        let receipt = store
            .compare_and_swap(&user, 0, json!({"name": "ada"}), &meta())
            .await
            .unwrap();

        assert_eq!(receipt.entry.version, 1);
        assert_eq!(receipt.entry.updated_by, "tester");
        assert!(receipt.entry.prior_version_hash.is_none());
        assert_eq!(receipt.audit.before_version, 0);
        assert_eq!(receipt.audit.after_version, 1);
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let store = InMemoryStateStore::new();
        let user = EntityRef::new("user", "1");
        store.compare_and_swap(&user, 0, json!(1), &meta()).await.unwrap();

        let err = store
            .compare_and_swap(&user, 0, json!(2), &meta())
            .await
            .unwrap_err();

        match err {
            StoreError::VersionConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // Losing writer left nothing behind
        assert_eq!(store.read(&user).await.unwrap().value, json!(1));
        assert_eq!(store.audit_log(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prior_version_hash_chains() {
        let store = InMemoryStateStore::new();
        let user = EntityRef::new("user", "1");
        store.compare_and_swap(&user, 0, json!("a"), &meta()).await.unwrap();
        let second = store
            .compare_and_swap(&user, 1, json!("b"), &meta())
            .await
            .unwrap();

        assert_eq!(
            second.entry.prior_version_hash,
            Some(version_hash(1, &json!("a")))
        );
    }

    #[tokio::test]
    async fn test_audit_log_in_version_order() {
        let store = InMemoryStateStore::new();
        let user = EntityRef::new("user", "1");
        for version in 0..4 {
            store
                .compare_and_swap(&user, version, json!(version), &meta())
                .await
                .unwrap();
        }

        let log = store.audit_log(&user).await.unwrap();
        let versions: Vec<u64> = log.iter().map(|r| r.after_version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_list_filters_by_entity_type() {
        let store = InMemoryStateStore::new();
        store
            .compare_and_swap(&EntityRef::new("user", "b"), 0, json!(1), &meta())
            .await
            .unwrap();
        store
            .compare_and_swap(&EntityRef::new("user", "a"), 0, json!(1), &meta())
            .await
            .unwrap();
        store
            .compare_and_swap(&EntityRef::new("order", "x"), 0, json!(1), &meta())
            .await
            .unwrap();

        let users = store.list("user").await.unwrap();
        let ids: Vec<&str> = users.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.audit_records().await.unwrap().len(), 3);
    }
}
