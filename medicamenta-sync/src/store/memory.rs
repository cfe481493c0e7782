//! Volatile store, for tests and for hosts that bring their own durability.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{IndexField, RecordStore, StoredRecord};
use crate::error::SyncResult;

pub struct InMemoryStore<R> {
    records: RwLock<HashMap<Uuid, R>>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: StoredRecord> InMemoryStore<R> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            _kind: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl<R: StoredRecord> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: StoredRecord> RecordStore<R> for InMemoryStore<R> {
    async fn put(&self, record: &R) -> SyncResult<()> {
        self.records.write().insert(record.record_id(), record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SyncResult<Option<R>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn get_all(&self) -> SyncResult<Vec<R>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn get_by_index(&self, field: IndexField, value: &str) -> SyncResult<Vec<R>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| record.index_value(field).as_deref() == Some(value))
            .cloned()
            .collect())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> SyncResult<usize> {
        let mut records = self.records.write();
        Ok(ids.iter().filter(|id| records.remove(id).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        id: Uuid,
        collection: String,
        status: String,
    }

    impl StoredRecord for Reading {
        const KIND: &'static str = "readings";

        fn record_id(&self) -> Uuid {
            self.id
        }

        fn index_value(&self, field: IndexField) -> Option<String> {
            match field {
                IndexField::Status => Some(self.status.clone()),
                IndexField::Collection => Some(self.collection.clone()),
                IndexField::DocumentKey => None,
            }
        }
    }

    fn reading(collection: &str, status: &str) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            collection: collection.to_string(),
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_get_and_overwrite() {
        let store = InMemoryStore::new();
        let mut record = reading("vitals", "pending");
        store.put(&record).await.unwrap();

        record.status = "completed".to_string();
        store.put(&record).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(record.id).await.unwrap(), Some(record));
        assert_eq!(store.get(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_by_index_and_delete_batch() {
        let store = InMemoryStore::new();
        let a = reading("vitals", "pending");
        let b = reading("vitals", "completed");
        let c = reading("doses", "pending");
        for record in [&a, &b, &c] {
            store.put(record).await.unwrap();
        }

        let pending = store.get_by_index(IndexField::Status, "pending").await.unwrap();
        assert_eq!(pending.len(), 2);
        let vitals = store.get_by_index(IndexField::Collection, "vitals").await.unwrap();
        assert_eq!(vitals.len(), 2);
        assert!(store
            .get_by_index(IndexField::DocumentKey, "vitals/1")
            .await
            .unwrap()
            .is_empty());

        let removed = store.delete_batch(&[a.id, c.id, Uuid::new_v4()]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get_all().await.unwrap(), vec![b]);
    }
}
