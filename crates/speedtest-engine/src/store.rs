//! Persistence collaborator for completed results.

use std::sync::Mutex;

use async_trait::async_trait;

use speedtest_common::ids;
use speedtest_common::models::{SpeedTestRecord, StoredSpeedTest};

use crate::error::StoreError;

/// Insert/list store for speed test records. Records are never updated.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// All stored records, newest first.
    async fn list(&self) -> Result<Vec<StoredSpeedTest>, StoreError>;
    /// Store a record and return it with its assigned ID.
    async fn insert(&self, record: SpeedTestRecord) -> Result<StoredSpeedTest, StoreError>;
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredSpeedTest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn list(&self) -> Result<Vec<StoredSpeedTest>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".into()))?;
        let mut newest_first: Vec<StoredSpeedTest> = records.iter().rev().cloned().collect();
        newest_first.sort_by(|a, b| b.record.timestamp.cmp(&a.record.timestamp));
        Ok(newest_first)
    }

    async fn insert(&self, record: SpeedTestRecord) -> Result<StoredSpeedTest, StoreError> {
        record.validate().map_err(StoreError::Invalid)?;
        let stored = StoredSpeedTest {
            id: ids::speed_test_id(),
            record,
        };
        self.records
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".into()))?
            .push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_id_and_lists_newest_first() {
        let store = MemoryStore::new();
        let first = store.insert(SpeedTestRecord::new(10.0, 5.0, Some(20.0))).await.unwrap();
        let second = store.insert(SpeedTestRecord::new(11.0, 6.0, None)).await.unwrap();
        assert!(first.id.starts_with("spt_"));
        assert_ne!(first.id, second.id);

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![second, first]);
    }

    #[tokio::test]
    async fn rejects_invalid_record() {
        let store = MemoryStore::new();
        let err = store
            .insert(SpeedTestRecord::new(f64::NAN, 1.0, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(store.list().await.unwrap().is_empty());
    }
}
