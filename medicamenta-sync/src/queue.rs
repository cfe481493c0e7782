//! Durable, priority-ordered operation queue
//!
//! All status transitions happen under a single async mutex that also covers
//! the write-through to the record store, so the in-memory view never runs
//! ahead of what has been persisted and no two callers can claim the same
//! item.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::error::{SyncError, SyncResult};
use crate::operation::{
    DocumentKey, EnqueueOptions, OperationId, OperationStatus, OperationType, Priority,
    QueuedOperation,
};
use crate::store::RecordStore;

/// What `mark_failed` did with the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending_retry`, eligible again at `next_eligible_at`
    Rescheduled {
        retry_count: u32,
        next_eligible_at: DateTime<Utc>,
    },
    Discarded,
    /// The operation was not in a state that accepts a failure
    Ignored,
}

/// Counts derived from the current item states
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total: usize,
    pub pending: usize,
    pub pending_retry: usize,
    pub processing: usize,
    pub completed: usize,
    pub discarded: usize,
    pub conflicted: usize,
    /// Waiting items per priority
    pub critical_pending: usize,
    pub high_pending: usize,
    pub normal_pending: usize,
    pub low_pending: usize,
    /// Documents currently held by an unresolved conflict
    pub held_documents: usize,
    /// Waiting items whose document is held
    pub held_operations: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl QueueMetrics {
    /// Items still waiting to be sent (including those backing off)
    pub fn waiting(&self) -> usize {
        self.pending + self.pending_retry
    }
}

#[derive(Default)]
struct QueueState {
    items: HashMap<OperationId, QueuedOperation>,
    holds: HashSet<DocumentKey>,
    next_sequence: u64,
}

impl QueueState {
    fn is_held(&self, operation: &QueuedOperation) -> bool {
        operation
            .document_key()
            .is_some_and(|key| self.holds.contains(&key))
    }
}

pub struct OperationQueue {
    store: Arc<dyn RecordStore<QueuedOperation>>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl OperationQueue {
    /// Open the queue over `store`, rehydrating every persisted item.
    ///
    /// Items left in `processing` belonged to a drain cycle that never
    /// finished (crash or kill); they are returned to `pending`.
    pub async fn open(
        store: Arc<dyn RecordStore<QueuedOperation>>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let mut state = QueueState::default();
        let mut recovered = 0_usize;

        for mut item in store.get_all().await? {
            if item.status == OperationStatus::Processing {
                item.status = OperationStatus::Pending;
                store.put(&item).await?;
                recovered += 1;
            }
            state.next_sequence = state.next_sequence.max(item.sequence.saturating_add(1));
            state.items.insert(item.id, item);
        }

        if recovered > 0 {
            tracing::warn!(
                recovered,
                "Recovered operations left in processing by an interrupted sync"
            );
        }
        tracing::debug!(items = state.items.len(), "Operation queue opened");

        Ok(Self {
            store,
            config,
            clock,
            state: Mutex::new(state),
        })
    }

    /// Queue an operation for sync. The item is persisted before this
    /// returns.
    pub async fn enqueue(
        &self,
        operation_type: OperationType,
        collection: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> SyncResult<OperationId> {
        let collection = collection.trim();
        if collection.is_empty() {
            return Err(SyncError::InvalidOperation(
                "collection must not be empty".to_string(),
            ));
        }
        let document_id = options
            .document_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if operation_type.requires_document_id() && document_id.is_none() {
            return Err(SyncError::InvalidOperation(format!(
                "{operation_type} on '{collection}' requires a document id"
            )));
        }

        let now = self.clock.now();
        let max_retries = options
            .max_retries
            .unwrap_or_else(|| self.config.snapshot().max_retries);

        let mut state = self.state.lock().await;
        let item = QueuedOperation {
            id: uuid::Uuid::new_v4(),
            operation_type,
            collection: collection.to_string(),
            document_id,
            payload,
            metadata: options.metadata,
            priority: options.priority,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries,
            sequence: state.next_sequence,
            created_at: now,
            last_attempt_at: None,
            next_eligible_at: now,
            completed_at: None,
            last_error: None,
        };

        self.store.put(&item).await?;
        state.next_sequence = state.next_sequence.saturating_add(1);

        tracing::debug!(
            operation_id = %item.id,
            operation = %item.operation_type,
            collection = %item.collection,
            priority = %item.priority,
            "Queued operation for sync"
        );

        let id = item.id;
        state.items.insert(id, item);
        Ok(id)
    }

    /// Claim up to `limit` eligible operations, highest priority first and
    /// FIFO within a priority. Claimed items are `processing` when returned.
    pub async fn dequeue_batch(&self, limit: usize) -> SyncResult<Vec<QueuedOperation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut eligible: Vec<&QueuedOperation> = state
            .items
            .values()
            .filter(|item| item.is_eligible(now) && !state.is_held(item))
            .collect();
        eligible.sort_by_key(|item| (Reverse(item.priority), item.created_at, item.sequence));

        let selected: Vec<QueuedOperation> = eligible.into_iter().take(limit).cloned().collect();

        let mut claimed = Vec::with_capacity(selected.len());
        for original in selected {
            let mut item = original.clone();
            item.status = OperationStatus::Processing;
            item.last_attempt_at = Some(now);

            if let Err(err) = self.store.put(&item).await {
                self.rollback_claims(&mut state, &claimed).await;
                return Err(err);
            }
            state.items.insert(item.id, item.clone());
            claimed.push((original, item));
        }

        Ok(claimed.into_iter().map(|(_, item)| item).collect())
    }

    /// Undo partially persisted claims after a store failure
    async fn rollback_claims(
        &self,
        state: &mut QueueState,
        claimed: &[(QueuedOperation, QueuedOperation)],
    ) {
        for (original, _) in claimed {
            if let Err(err) = self.store.put(original).await {
                tracing::error!(
                    operation_id = %original.id,
                    error = %err,
                    "Failed to roll back claimed operation; it will be recovered on restart"
                );
            }
            state.items.insert(original.id, original.clone());
        }
    }

    /// Mark operation as synced. Returns `false` if it was already completed
    /// (or is otherwise terminal), so repeated calls are no-ops.
    pub async fn mark_completed(&self, id: OperationId) -> SyncResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(current) = state.items.get(&id) else {
            return Err(SyncError::NotFound(format!("operation {id}")));
        };
        if current.status.is_terminal() {
            tracing::debug!(operation_id = %id, status = %current.status, "Ignoring completion of finished operation");
            return Ok(false);
        }

        let mut item = current.clone();
        item.status = OperationStatus::Completed;
        item.completed_at = Some(now);
        item.last_error = None;
        self.store.put(&item).await?;
        state.items.insert(id, item);

        tracing::debug!(operation_id = %id, "Marked operation as synced");
        Ok(true)
    }

    /// Record a failed attempt.
    ///
    /// Permanent failures discard immediately. Transient failures are retried
    /// with exponential backoff until `max_retries` retries have been used,
    /// after which the operation is discarded.
    pub async fn mark_failed(
        &self,
        id: OperationId,
        error: &str,
        is_permanent: bool,
    ) -> SyncResult<FailureDisposition> {
        let now = self.clock.now();
        let config = self.config.snapshot();
        let mut state = self.state.lock().await;
        let Some(current) = state.items.get(&id) else {
            return Err(SyncError::NotFound(format!("operation {id}")));
        };
        if current.status.is_terminal() {
            return Ok(FailureDisposition::Ignored);
        }

        let mut item = current.clone();
        item.last_error = Some(error.to_string());
        item.last_attempt_at = Some(now);

        let disposition = if is_permanent || item.retry_count >= item.max_retries {
            item.status = OperationStatus::Discarded;
            FailureDisposition::Discarded
        } else {
            item.retry_count += 1;
            item.status = OperationStatus::PendingRetry;
            item.next_eligible_at = now + config.backoff_delay(item.retry_count);
            FailureDisposition::Rescheduled {
                retry_count: item.retry_count,
                next_eligible_at: item.next_eligible_at,
            }
        };

        self.store.put(&item).await?;

        let redacted = medicamenta_logging::redact(error);
        match disposition {
            FailureDisposition::Discarded => tracing::warn!(
                operation_id = %id,
                collection = %item.collection,
                retry_count = item.retry_count,
                permanent = is_permanent,
                error = %redacted,
                "Operation discarded"
            ),
            _ => tracing::warn!(
                operation_id = %id,
                retry_count = item.retry_count,
                next_eligible_at = %item.next_eligible_at,
                error = %redacted,
                "Operation sync failed, retry scheduled"
            ),
        }

        state.items.insert(id, item);
        Ok(disposition)
    }

    /// Terminal state for an operation whose handler reported a conflict
    pub async fn mark_conflicted(&self, id: OperationId, detail: &str) -> SyncResult<bool> {
        self.transition(id, |item, now| {
            if item.status.is_terminal() {
                return false;
            }
            item.status = OperationStatus::Conflicted;
            item.last_attempt_at = Some(now);
            item.last_error = Some(detail.to_string());
            true
        })
        .await
    }

    /// Hand a claimed operation back without counting an attempt
    pub async fn release(&self, id: OperationId) -> SyncResult<bool> {
        self.transition(id, |item, _| {
            if item.status != OperationStatus::Processing {
                return false;
            }
            item.status = OperationStatus::Pending;
            true
        })
        .await
    }

    async fn transition<F>(&self, id: OperationId, apply: F) -> SyncResult<bool>
    where
        F: FnOnce(&mut QueuedOperation, DateTime<Utc>) -> bool,
    {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(current) = state.items.get(&id) else {
            return Err(SyncError::NotFound(format!("operation {id}")));
        };

        let mut item = current.clone();
        if !apply(&mut item, now) {
            return Ok(false);
        }
        self.store.put(&item).await?;
        state.items.insert(id, item);
        Ok(true)
    }

    /// Cancel a still-pending operation. Operations being processed or
    /// already finished are left alone.
    pub async fn dequeue(&self, id: OperationId) -> SyncResult<bool> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get(&id) else {
            return Ok(false);
        };
        if !item.status.is_waiting() {
            tracing::debug!(operation_id = %id, status = %item.status, "Refusing to cancel operation");
            return Ok(false);
        }

        self.store.delete_batch(&[id]).await?;
        state.items.remove(&id);
        tracing::debug!(operation_id = %id, "Cancelled queued operation");
        Ok(true)
    }

    /// Cancel every still-pending operation targeting `key`
    pub async fn cancel_for_document(&self, key: &DocumentKey) -> SyncResult<Vec<OperationId>> {
        self.remove_where(|item| {
            item.status.is_waiting() && item.document_key().as_ref() == Some(key)
        })
        .await
    }

    pub async fn clear_completed(&self) -> SyncResult<usize> {
        let removed = self
            .remove_where(|item| item.status == OperationStatus::Completed)
            .await?;
        Ok(removed.len())
    }

    /// Remove discarded operations and those superseded by a conflict record
    pub async fn clear_discarded(&self) -> SyncResult<usize> {
        let removed = self
            .remove_where(|item| {
                matches!(
                    item.status,
                    OperationStatus::Discarded | OperationStatus::Conflicted
                )
            })
            .await?;
        Ok(removed.len())
    }

    async fn remove_where<F>(&self, predicate: F) -> SyncResult<Vec<OperationId>>
    where
        F: Fn(&QueuedOperation) -> bool,
    {
        let mut state = self.state.lock().await;
        let ids: Vec<OperationId> = state
            .items
            .values()
            .filter(|item| predicate(item))
            .map(|item| item.id)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }

        self.store.delete_batch(&ids).await?;
        for id in &ids {
            state.items.remove(id);
        }
        tracing::debug!(removed = ids.len(), "Removed operations from queue");
        Ok(ids)
    }

    /// Suspend dispatch of every operation targeting `key`
    pub async fn hold(&self, key: DocumentKey) {
        let mut state = self.state.lock().await;
        if state.holds.insert(key.clone()) {
            tracing::debug!(document = %key, "Holding document operations");
        }
    }

    pub async fn release_hold(&self, key: &DocumentKey) {
        let mut state = self.state.lock().await;
        if state.holds.remove(key) {
            tracing::debug!(document = %key, "Released document hold");
        }
    }

    pub async fn is_held(&self, key: &DocumentKey) -> bool {
        self.state.lock().await.holds.contains(key)
    }

    pub async fn get(&self, id: OperationId) -> Option<QueuedOperation> {
        self.state.lock().await.items.get(&id).cloned()
    }

    /// All operations in dispatch order
    pub async fn snapshot(&self) -> Vec<QueuedOperation> {
        let state = self.state.lock().await;
        let mut items: Vec<QueuedOperation> = state.items.values().cloned().collect();
        items.sort_by_key(|item| (Reverse(item.priority), item.created_at, item.sequence));
        items
    }

    pub async fn list_by_status(&self, status: OperationStatus) -> Vec<QueuedOperation> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|item| item.status == status)
            .collect()
    }

    /// Operations waiting to be sent, including those backing off
    pub async fn pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .items
            .values()
            .filter(|item| item.status.is_waiting())
            .count()
    }

    pub async fn critical_pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .items
            .values()
            .filter(|item| item.status.is_waiting() && item.priority == Priority::Critical)
            .count()
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock().await;
        let mut metrics = QueueMetrics {
            total: state.items.len(),
            held_documents: state.holds.len(),
            ..QueueMetrics::default()
        };

        for item in state.items.values() {
            match item.status {
                OperationStatus::Pending => metrics.pending += 1,
                OperationStatus::PendingRetry => metrics.pending_retry += 1,
                OperationStatus::Processing => metrics.processing += 1,
                OperationStatus::Completed => metrics.completed += 1,
                OperationStatus::Discarded => metrics.discarded += 1,
                OperationStatus::Conflicted => metrics.conflicted += 1,
            }

            if item.status.is_waiting() {
                match item.priority {
                    Priority::Critical => metrics.critical_pending += 1,
                    Priority::High => metrics.high_pending += 1,
                    Priority::Normal => metrics.normal_pending += 1,
                    Priority::Low => metrics.low_pending += 1,
                }
                if state.is_held(item) {
                    metrics.held_operations += 1;
                }
                metrics.oldest_pending_at = Some(match metrics.oldest_pending_at {
                    Some(oldest) => oldest.min(item.created_at),
                    None => item.created_at,
                });
            }
        }

        metrics
    }
}
