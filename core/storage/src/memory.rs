//! In-memory store adapter for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::adapter::StoreAdapter;
use mirrorsync_common::{Change, ChangeSet, Error, RecordId, Result, SchemaMapping};

/// In-memory store adapter.
///
/// Useful for testing and dry runs. Every upsert is also appended to a write
/// log so callers can see exactly what a sync pass wrote. All data is lost
/// on drop.
pub struct MemoryStore {
    name: String,
    schema: SchemaMapping,
    records: Arc<RwLock<HashMap<RecordId, Change>>>,
    writes: Arc<RwLock<Vec<Change>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new(name: impl Into<String>, schema: SchemaMapping) -> Self {
        Self {
            name: name.into(),
            schema,
            records: Arc::new(RwLock::new(HashMap::new())),
            writes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Insert a record directly, bypassing the write log.
    pub fn seed(&self, change: Change) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))?;
        records.insert(change.id().clone(), change);
        Ok(())
    }

    /// Get the stored version of a record.
    pub fn get(&self, id: &RecordId) -> Option<Change> {
        self.records.read().ok()?.get(id).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every change written through [`StoreAdapter::upsert`], in order.
    pub fn writes(&self) -> Vec<Change> {
        self.writes.read().map(|w| w.clone()).unwrap_or_default()
    }

    /// Forget the write log, keeping the stored records.
    pub fn clear_writes(&self) {
        if let Ok(mut writes) = self.writes.write() {
            writes.clear();
        }
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &SchemaMapping {
        &self.schema
    }

    async fn fetch_changes_since(&self, cutoff: DateTime<Utc>) -> Result<ChangeSet> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::fetch_fatal(&self.name, "Memory store lock poisoned"))?;

        let mut changes: Vec<Change> = records
            .values()
            .filter(|c| c.modified_at() > cutoff)
            .cloned()
            .collect();
        // HashMap order is random; keep passes reproducible.
        changes.sort_by(|a, b| a.id().cmp(b.id()));

        debug!(store = %self.name, count = changes.len(), "Fetched changes from memory");
        Ok(changes.into())
    }

    async fn upsert(&self, change: &Change) -> Result<()> {
        {
            let mut records = self.records.write().map_err(|_| {
                Error::write_fatal(&self.name, change.id().as_str(), "Memory store lock poisoned")
            })?;
            records.insert(change.id().clone(), change.clone());
        }

        let mut writes = self.writes.write().map_err(|_| {
            Error::write_fatal(&self.name, change.id().as_str(), "Memory store lock poisoned")
        })?;
        writes.push(change.clone());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 5, 8, 23, minute, 0).unwrap()
    }

    fn record(id: &str, minute: u32) -> Change {
        Change::new(RecordId::new(id).unwrap(), at(minute))
    }

    #[tokio::test]
    async fn test_fetch_is_strictly_after_cutoff() {
        let store = MemoryStore::new("memory", SchemaMapping::default());
        store.seed(record("1", 5)).unwrap();
        store.seed(record("2", 10)).unwrap();
        store.seed(record("3", 15)).unwrap();

        let changes = store.fetch_changes_since(at(10)).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes.get(&RecordId::new("3").unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_logs() {
        let store = MemoryStore::new("memory", SchemaMapping::default());
        store.seed(record("1", 5).with_field("title", "old")).unwrap();

        store
            .upsert(&record("1", 9).with_field("title", "new"))
            .await
            .unwrap();

        let stored = store.get(&RecordId::new("1").unwrap()).unwrap();
        assert_eq!(stored.modified_at(), at(9));
        assert_eq!(stored.field("title"), Some(&"new".into()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new("memory", SchemaMapping::default());
        let change = record("1", 9).with_field("title", "same");

        store.upsert(&change).await.unwrap();
        store.upsert(&change).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get(change.id()).unwrap();
        assert_eq!(stored.fields(), change.fields());
    }

    #[tokio::test]
    async fn test_seed_is_not_logged() {
        let store = MemoryStore::new("memory", SchemaMapping::default());
        store.seed(record("1", 5)).unwrap();
        assert!(store.writes().is_empty());

        store.upsert(&record("2", 5)).await.unwrap();
        store.clear_writes();
        assert!(store.writes().is_empty());
        assert_eq!(store.len(), 2);
    }
}
