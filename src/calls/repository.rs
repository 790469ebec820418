//! # Call Repository
//!
//! Storage seam for call records. The service layer only talks to the
//! trait, so the in-memory map can be swapped for a real database without
//! touching call handling.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::calls::record::CallRecord;

#[async_trait]
pub trait CallRepository: Send + Sync {
    /// Persist a new record. Fails if the provider SID is already known.
    async fn create(&self, record: CallRecord) -> Result<CallRecord>;

    async fn get_by_sid(&self, sid: &str) -> Result<Option<CallRecord>>;

    /// Replace the stored record with this one. Returns `None` when the
    /// identifier is unknown.
    async fn update(&self, id: Uuid, record: CallRecord) -> Result<Option<CallRecord>>;

    /// Whether the backing store is reachable.
    async fn health_check(&self) -> bool;
}

#[derive(Default)]
struct Store {
    records: HashMap<Uuid, CallRecord>,
    sid_index: HashMap<String, Uuid>,
}

/// Map-backed repository used by the default deployment.
pub struct InMemoryCallRepository {
    store: RwLock<Store>,
}

impl InMemoryCallRepository {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCallRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallRepository for InMemoryCallRepository {
    async fn create(&self, record: CallRecord) -> Result<CallRecord> {
        let mut store = self.store.write().unwrap();

        if store.sid_index.contains_key(&record.sid) {
            return Err(anyhow!("call with SID {} already exists", record.sid));
        }

        store.sid_index.insert(record.sid.clone(), record.id);
        store.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_by_sid(&self, sid: &str) -> Result<Option<CallRecord>> {
        let store = self.store.read().unwrap();
        let record = store
            .sid_index
            .get(sid)
            .and_then(|id| store.records.get(id))
            .cloned();
        Ok(record)
    }

    async fn update(&self, id: Uuid, record: CallRecord) -> Result<Option<CallRecord>> {
        let mut store = self.store.write().unwrap();

        if !store.records.contains_key(&id) {
            return Ok(None);
        }

        store.sid_index.insert(record.sid.clone(), id);
        store.records.insert(id, record.clone());
        Ok(Some(record))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::record::CallStatus;

    #[tokio::test]
    async fn test_create_and_get_by_sid() {
        let repo = InMemoryCallRepository::new();
        let record = CallRecord::new("CA123", "+1555", "+1777");

        repo.create(record.clone()).await.unwrap();

        let found = repo.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.from_number, "+1555");
    }

    #[tokio::test]
    async fn test_duplicate_sid_is_rejected() {
        let repo = InMemoryCallRepository::new();
        repo.create(CallRecord::new("CA123", "+1", "+2")).await.unwrap();

        let result = repo.create(CallRecord::new("CA123", "+3", "+4")).await;

        assert!(result.is_err());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_record() {
        let repo = InMemoryCallRepository::new();
        let mut record = repo
            .create(CallRecord::new("CA123", "+1555", "+1777"))
            .await
            .unwrap();

        record.set_status(CallStatus::Streaming).unwrap();
        let updated = repo.update(record.id, record.clone()).await.unwrap();

        assert!(updated.is_some());
        let stored = repo.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Streaming);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_none() {
        let repo = InMemoryCallRepository::new();
        let record = CallRecord::new("CA123", "+1", "+2");

        let updated = repo.update(record.id, record).await.unwrap();

        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_unknown_sid_is_none() {
        let repo = InMemoryCallRepository::new();
        assert!(repo.is_empty());
        assert!(repo.get_by_sid("CA404").await.unwrap().is_none());
    }
}
