//! Offline-first synchronization engine for Medicamenta
//!
//! Provides:
//! - Durable, priority-ordered operation queue with retry and backoff
//! - Pluggable handlers performing the remote effect per collection
//! - Conflict registry with document holds and auditable resolutions
//! - Sync orchestrator draining the queue whenever the device is online
//! - Local SQLite persistence (or an in-memory store for tests)
//!
//! A SQLite file is owned by one engine at a time: queue and conflict state
//! live in memory and are written through, so a second engine on the same
//! file would diverge. `open_sqlite` fails with [`SyncError::DatabaseLocked`]
//! while another engine holds the file.
//!
//! ```no_run
//! use medicamenta_sync::{SyncConfig, SyncEngine, SqliteStoreConfig};
//!
//! # async fn run() -> medicamenta_sync::SyncResult<()> {
//! let engine = SyncEngine::builder()
//!     .config(SyncConfig::load(None)?)
//!     .open_sqlite(&SqliteStoreConfig::at("medicamenta_sync.db"))
//!     .await?;
//! engine.orchestrator().start();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod error;
pub mod handler;
pub mod operation;
pub mod orchestrator;
pub mod queue;
pub mod store;

use std::sync::Arc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigHandle, ConfigUpdate, ConflictPolicy, SyncConfig};
pub use conflict::{
    ConflictId, ConflictRegistry, ConflictReport, FieldDiff, ResolutionKind, ResolutionOutcome,
    ResolutionStrategy, SyncConflict,
};
pub use connectivity::Connectivity;
pub use error::{SyncError, SyncResult};
pub use handler::{CollectionPattern, HandlerOutcome, HandlerRegistry, OperationHandler};
pub use operation::{
    DocumentKey, EnqueueOptions, OperationId, OperationStatus, OperationType, Priority,
    QueuedOperation,
};
pub use orchestrator::{
    CycleReport, QueueSummary, SyncEvent, SyncOrchestrator, SyncPriority, SyncStats, SyncStatus,
};
pub use queue::{FailureDisposition, OperationQueue, QueueMetrics};
pub use store::{
    InMemoryStore, IndexField, RecordStore, SqliteDatabase, SqliteStore, SqliteStoreConfig,
    StoredRecord,
};

/// Sync engine for offline-first operations
pub struct SyncEngine {
    orchestrator: Arc<SyncOrchestrator>,
    database: Option<SqliteDatabase>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    /// Engine over volatile stores with default settings
    pub async fn in_memory(config: SyncConfig) -> SyncResult<Self> {
        Self::builder().config(config).in_memory().await
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        self.orchestrator.queue()
    }

    pub fn conflicts(&self) -> &Arc<ConflictRegistry> {
        self.orchestrator.conflicts()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        self.orchestrator.handlers()
    }

    pub fn connectivity(&self) -> &Connectivity {
        self.orchestrator.connectivity()
    }

    /// Local database, when the engine was opened over SQLite
    pub fn database(&self) -> Option<&SqliteDatabase> {
        self.database.as_ref()
    }

    /// Stop the watcher and close the local database
    pub async fn shutdown(self) {
        self.orchestrator.stop();
        if let Some(database) = self.database {
            database.close().await;
        }
        tracing::debug!("Sync engine shut down");
    }
}

pub struct SyncEngineBuilder {
    config: SyncConfig,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    handlers: Vec<Arc<dyn OperationHandler>>,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self {
            config: SyncConfig::default(),
            connectivity: Connectivity::default(),
            clock: Arc::new(SystemClock),
            handlers: Vec::new(),
        }
    }
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a connectivity signal the host keeps updating
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub async fn in_memory(self) -> SyncResult<SyncEngine> {
        self.build(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryStore::new()),
            None,
        )
        .await
    }

    /// Open (creating if needed) the SQLite database and recover its state
    pub async fn open_sqlite(self, store_config: &SqliteStoreConfig) -> SyncResult<SyncEngine> {
        let database = SqliteDatabase::open(store_config).await?;
        let operations = Arc::new(database.store::<QueuedOperation>().await?);
        let conflicts = Arc::new(database.store::<SyncConflict>().await?);
        self.build(operations, conflicts, Some(database)).await
    }

    /// Build over caller-supplied stores
    pub async fn with_stores(
        self,
        operations: Arc<dyn RecordStore<QueuedOperation>>,
        conflicts: Arc<dyn RecordStore<SyncConflict>>,
    ) -> SyncResult<SyncEngine> {
        self.build(operations, conflicts, None).await
    }

    async fn build(
        self,
        operations: Arc<dyn RecordStore<QueuedOperation>>,
        conflicts: Arc<dyn RecordStore<SyncConflict>>,
        database: Option<SqliteDatabase>,
    ) -> SyncResult<SyncEngine> {
        let config = ConfigHandle::new(self.config)?;

        let queue = Arc::new(OperationQueue::open(operations, config.clone(), self.clock.clone()).await?);
        let conflict_registry =
            Arc::new(ConflictRegistry::open(conflicts, queue.clone(), self.clock.clone()).await?);

        let handlers = Arc::new(HandlerRegistry::new());
        for handler in self.handlers {
            handlers.register(handler)?;
        }

        let orchestrator = Arc::new(SyncOrchestrator::new(
            queue,
            conflict_registry,
            handlers,
            self.connectivity,
            config,
            self.clock,
        ));
        orchestrator.refresh_status().await;

        tracing::info!(
            persistent = database.is_some(),
            online = orchestrator.connectivity().is_online(),
            "Sync engine ready"
        );

        Ok(SyncEngine {
            orchestrator,
            database,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sync_engine_creation() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::builder()
            .connectivity(Connectivity::new(false))
            .open_sqlite(&SqliteStoreConfig::at(dir.path().join("sync.db")))
            .await
            .unwrap();

        assert!(engine.database().is_some());
        assert!(!engine.connectivity().is_online());
        assert_eq!(engine.queue().pending_count().await, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = SyncEngine::in_memory(SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        })
        .await;
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }
}
