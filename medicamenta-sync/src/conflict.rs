//! Conflict registry
//!
//! Records documents whose local edit collided with an independent server
//! edit, holds further dispatch for those documents, and applies the
//! resolution chosen by the user (or by the last-writer-wins policy).
//!
//! Key features:
//! - One unresolved conflict per document; repeated reports refresh it
//! - Resolution history kept on the record for audit
//! - Field-level diffs for side-by-side display

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::operation::{DocumentKey, EnqueueOptions, OperationId, OperationType, Priority};
use crate::queue::OperationQueue;
use crate::store::{IndexField, RecordStore, StoredRecord};

pub type ConflictId = Uuid;

/// Which side won, as recorded on a resolved conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionKind {
    LocalWins,
    ServerWins,
    Merge,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalWins => "local-wins",
            Self::ServerWins => "server-wins",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionKind {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "local-wins" | "local_wins" | "local" => Ok(Self::LocalWins),
            "server-wins" | "server_wins" | "server" => Ok(Self::ServerWins),
            "merge" => Ok(Self::Merge),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown resolution strategy: {s}"
            ))),
        }
    }
}

/// Decision applied by `ConflictRegistry::resolve`
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionStrategy {
    /// Re-send the local snapshot as an update
    LocalWins,
    /// Keep the server copy and drop pending local writes for the document
    ServerWins,
    /// Send a caller-merged payload as an update
    Merge(serde_json::Value),
}

impl ResolutionStrategy {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Self::LocalWins => ResolutionKind::LocalWins,
            Self::ServerWins => ResolutionKind::ServerWins,
            Self::Merge(_) => ResolutionKind::Merge,
        }
    }
}

/// A top-level field that differs between the two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local_value: serde_json::Value,
    pub server_value: serde_json::Value,
}

/// Conflicting edit of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,

    pub collection: String,

    pub document_id: String,

    /// Queued operation whose dispatch revealed the conflict
    pub operation_id: Option<OperationId>,

    /// Priority given to the write emitted by the resolution
    pub priority: Priority,

    pub local_data: serde_json::Value,

    pub server_data: serde_json::Value,

    pub local_timestamp: DateTime<Utc>,

    pub server_timestamp: Option<DateTime<Utc>>,

    pub detected_at: DateTime<Utc>,

    pub resolved: bool,

    pub resolution_strategy: Option<ResolutionKind>,

    pub resolved_at: Option<DateTime<Utc>>,

    /// Update enqueued by a local-wins or merge resolution
    pub resolution_operation_id: Option<OperationId>,
}

impl SyncConflict {
    pub fn document_key(&self) -> DocumentKey {
        DocumentKey::new(self.collection.clone(), self.document_id.clone())
    }

    /// Last-writer-wins: the local edit wins only if it is strictly newer
    /// than a known server timestamp
    pub fn suggested_strategy(&self) -> ResolutionStrategy {
        match self.server_timestamp {
            Some(server) if self.local_timestamp > server => ResolutionStrategy::LocalWins,
            _ => ResolutionStrategy::ServerWins,
        }
    }

    /// Top-level fields that differ, for side-by-side display
    pub fn diff_fields(&self) -> Vec<FieldDiff> {
        let mut diffs = Vec::new();

        let (Some(local), Some(server)) = (self.local_data.as_object(), self.server_data.as_object())
        else {
            if self.local_data != self.server_data {
                diffs.push(FieldDiff {
                    field: String::new(),
                    local_value: self.local_data.clone(),
                    server_value: self.server_data.clone(),
                });
            }
            return diffs;
        };

        for (field, local_value) in local {
            let server_value = server.get(field).cloned().unwrap_or(serde_json::Value::Null);
            if *local_value != server_value {
                diffs.push(FieldDiff {
                    field: field.clone(),
                    local_value: local_value.clone(),
                    server_value,
                });
            }
        }
        for (field, server_value) in server {
            if !local.contains_key(field) {
                diffs.push(FieldDiff {
                    field: field.clone(),
                    local_value: serde_json::Value::Null,
                    server_value: server_value.clone(),
                });
            }
        }

        diffs
    }
}

impl StoredRecord for SyncConflict {
    const KIND: &'static str = "sync_conflicts";

    fn record_id(&self) -> Uuid {
        self.id
    }

    fn index_value(&self, field: IndexField) -> Option<String> {
        match field {
            IndexField::Status => Some(if self.resolved { "resolved" } else { "unresolved" }.to_string()),
            IndexField::Collection => Some(self.collection.clone()),
            IndexField::DocumentKey => Some(self.document_key().to_string()),
        }
    }
}

/// A newly observed conflict, as reported by the orchestrator
#[derive(Debug, Clone)]
pub struct ConflictReport {
    pub collection: String,
    pub document_id: String,
    pub operation_id: Option<OperationId>,
    pub priority: Priority,
    pub local_data: serde_json::Value,
    pub server_data: serde_json::Value,
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// What a resolution did
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub conflict: SyncConflict,
    /// Update enqueued for local-wins / merge
    pub enqueued: Option<OperationId>,
    /// Pending operations dropped by server-wins
    pub cancelled: Vec<OperationId>,
}

pub struct ConflictRegistry {
    store: Arc<dyn RecordStore<SyncConflict>>,
    queue: Arc<OperationQueue>,
    clock: Arc<dyn Clock>,
    conflicts: Mutex<HashMap<ConflictId, SyncConflict>>,
}

impl ConflictRegistry {
    /// Load persisted conflicts and re-hold every document that still has an
    /// unresolved one
    pub async fn open(
        store: Arc<dyn RecordStore<SyncConflict>>,
        queue: Arc<OperationQueue>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let mut conflicts = HashMap::new();
        for conflict in store.get_all().await? {
            if !conflict.resolved {
                queue.hold(conflict.document_key()).await;
            }
            conflicts.insert(conflict.id, conflict);
        }

        let unresolved = conflicts.values().filter(|c| !c.resolved).count();
        if unresolved > 0 {
            tracing::info!(unresolved, "Restored unresolved sync conflicts");
        }

        Ok(Self {
            store,
            queue,
            clock,
            conflicts: Mutex::new(conflicts),
        })
    }

    /// Record a conflict and hold the document.
    ///
    /// If the document already has an unresolved conflict, that record is
    /// refreshed with the newer server snapshot instead of creating another.
    pub async fn register(&self, report: ConflictReport) -> SyncResult<SyncConflict> {
        let key = DocumentKey::new(report.collection.clone(), report.document_id.clone());
        let mut conflicts = self.conflicts.lock().await;

        let existing = conflicts
            .values()
            .find(|c| !c.resolved && c.collection == key.collection && c.document_id == key.document_id)
            .cloned();

        let conflict = match existing {
            Some(mut conflict) => {
                conflict.server_data = report.server_data;
                conflict.server_timestamp = report.server_timestamp;
                if conflict.operation_id.is_none() {
                    conflict.operation_id = report.operation_id;
                }
                tracing::debug!(
                    conflict_id = %conflict.id,
                    document = %key,
                    "Refreshed existing conflict with newer server data"
                );
                conflict
            }
            None => {
                let conflict = SyncConflict {
                    id: Uuid::new_v4(),
                    collection: report.collection,
                    document_id: report.document_id,
                    operation_id: report.operation_id,
                    priority: report.priority,
                    local_data: report.local_data,
                    server_data: report.server_data,
                    local_timestamp: report.local_timestamp,
                    server_timestamp: report.server_timestamp,
                    detected_at: self.clock.now(),
                    resolved: false,
                    resolution_strategy: None,
                    resolved_at: None,
                    resolution_operation_id: None,
                };
                tracing::info!(
                    conflict_id = %conflict.id,
                    document = %key,
                    "Sync conflict detected"
                );
                conflict
            }
        };

        self.store.put(&conflict).await?;
        self.queue.hold(key).await;
        conflicts.insert(conflict.id, conflict.clone());

        Ok(conflict)
    }

    /// Apply `strategy` to an unresolved conflict and release the document
    pub async fn resolve(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ResolutionOutcome> {
        let mut conflicts = self.conflicts.lock().await;
        let Some(current) = conflicts.get(&id) else {
            return Err(SyncError::NotFound(format!("conflict {id}")));
        };
        if current.resolved {
            return Err(SyncError::ConflictAlreadyResolved(id));
        }

        let mut conflict = current.clone();
        let key = conflict.document_key();
        let kind = strategy.kind();

        let mut enqueued = None;
        let mut cancelled = Vec::new();
        match strategy {
            ResolutionStrategy::LocalWins => {
                let payload = conflict.local_data.clone();
                enqueued = Some(self.enqueue_resolution(&conflict, payload).await?);
            }
            ResolutionStrategy::Merge(merged) => {
                enqueued = Some(self.enqueue_resolution(&conflict, merged).await?);
            }
            ResolutionStrategy::ServerWins => {
                cancelled = self.queue.cancel_for_document(&key).await?;
            }
        }

        conflict.resolved = true;
        conflict.resolution_strategy = Some(kind);
        conflict.resolved_at = Some(self.clock.now());
        conflict.resolution_operation_id = enqueued;

        self.store.put(&conflict).await?;
        self.queue.release_hold(&key).await;
        conflicts.insert(id, conflict.clone());

        tracing::info!(
            conflict_id = %id,
            document = %key,
            strategy = %kind,
            cancelled = cancelled.len(),
            "Sync conflict resolved"
        );

        Ok(ResolutionOutcome {
            conflict,
            enqueued,
            cancelled,
        })
    }

    async fn enqueue_resolution(
        &self,
        conflict: &SyncConflict,
        payload: serde_json::Value,
    ) -> SyncResult<OperationId> {
        self.queue
            .enqueue(
                OperationType::Update,
                &conflict.collection,
                payload,
                EnqueueOptions::for_document(conflict.document_id.clone())
                    .with_priority(conflict.priority)
                    .with_metadata(serde_json::json!({ "conflict_id": conflict.id })),
            )
            .await
    }

    /// Unresolved conflicts, oldest first
    pub async fn unresolved_conflicts(&self) -> Vec<SyncConflict> {
        let conflicts = self.conflicts.lock().await;
        let mut unresolved: Vec<SyncConflict> =
            conflicts.values().filter(|c| !c.resolved).cloned().collect();
        unresolved.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        unresolved
    }

    pub async fn unresolved_count(&self) -> usize {
        self.conflicts
            .lock()
            .await
            .values()
            .filter(|c| !c.resolved)
            .count()
    }

    pub async fn get(&self, id: ConflictId) -> Option<SyncConflict> {
        self.conflicts.lock().await.get(&id).cloned()
    }

    /// Delete resolved conflicts, returning how many were removed
    pub async fn clear_resolved(&self) -> SyncResult<usize> {
        let mut conflicts = self.conflicts.lock().await;
        let ids: Vec<ConflictId> = conflicts
            .values()
            .filter(|c| c.resolved)
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        self.store.delete_batch(&ids).await?;
        for id in &ids {
            conflicts.remove(id);
        }
        tracing::debug!(removed = ids.len(), "Cleared resolved conflicts");
        Ok(ids.len())
    }
}
