//! Persistence seam for queued operations and conflict records
//!
//! The engine only needs a crash-consistent key-value store keyed by record
//! id: a completed `put` must survive a restart. No transactions across
//! multiple puts are assumed.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::SyncResult;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::{SqliteDatabase, SqliteStore, SqliteStoreConfig};

/// Secondary indexes a store must be able to look records up by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexField {
    Status,
    Collection,
    /// `collection/document_id`
    DocumentKey,
}

impl IndexField {
    pub fn column(&self) -> &'static str {
        match self {
            IndexField::Status => "status",
            IndexField::Collection => "collection",
            IndexField::DocumentKey => "document_key",
        }
    }
}

/// A record the engine persists
pub trait StoredRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Namespace (table) the records live in
    const KIND: &'static str;

    fn record_id(&self) -> Uuid;

    fn index_value(&self, field: IndexField) -> Option<String>;
}

/// Key-value persistence collaborator
#[async_trait]
pub trait RecordStore<R: StoredRecord>: Send + Sync {
    /// Insert or replace a record
    async fn put(&self, record: &R) -> SyncResult<()>;

    async fn get(&self, id: Uuid) -> SyncResult<Option<R>>;

    async fn get_all(&self) -> SyncResult<Vec<R>>;

    async fn get_by_index(&self, field: IndexField, value: &str) -> SyncResult<Vec<R>>;

    /// Delete the given ids, returning how many existed
    async fn delete_batch(&self, ids: &[Uuid]) -> SyncResult<usize>;
}
