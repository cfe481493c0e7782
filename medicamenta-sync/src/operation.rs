//! Queued operation model
//!
//! A `QueuedOperation` is one pending mutation against a document in a
//! logical collection. The payload is opaque to the engine; only the handler
//! registered for the operation's type and collection interprets it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::store::{IndexField, StoredRecord};

pub type OperationId = Uuid;

/// Operation type in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Whether operations of this type must name their target document
    pub fn requires_document_id(&self) -> bool {
        !matches!(self, OperationType::Create)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown operation type: {s}"
            ))),
        }
    }
}

/// Dequeue priority. Declaration order is significant: `Ord` ranks
/// `Critical` highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a queued operation.
///
/// `Pending`/`PendingRetry` are dispatchable once `next_eligible_at` has
/// passed. `Completed`, `Discarded` and `Conflicted` are terminal and are only
/// removed by explicit cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    PendingRetry,
    Completed,
    Discarded,
    /// The handler reported a conflict; the local payload now lives in the
    /// conflict record.
    Conflicted,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::PendingRetry => "pending_retry",
            OperationStatus::Completed => "completed",
            OperationStatus::Discarded => "discarded",
            OperationStatus::Conflicted => "conflicted",
        }
    }

    /// Waiting to be dispatched (possibly after a backoff)
    pub fn is_waiting(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::PendingRetry)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Discarded | OperationStatus::Conflicted
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "pending_retry" | "pending-retry" => Ok(OperationStatus::PendingRetry),
            "completed" => Ok(OperationStatus::Completed),
            "discarded" => Ok(OperationStatus::Discarded),
            "conflicted" => Ok(OperationStatus::Conflicted),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown operation status: {s}"
            ))),
        }
    }
}

/// Identity of a single document across collections
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: String,
    pub document_id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document_id: document_id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.document_id)
    }
}

/// Caller-supplied options for `OperationQueue::enqueue`
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub document_id: Option<String>,
    pub priority: Priority,
    /// Free-form metadata carried alongside the payload
    pub metadata: serde_json::Value,
    /// Overrides the configured retry limit for this operation
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Sync queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Unique operation ID
    pub id: OperationId,

    pub operation_type: OperationType,

    /// Logical namespace (e.g. "medications", "dose_logs")
    pub collection: String,

    /// Target record; optional for creates
    pub document_id: Option<String>,

    /// Opaque data blob interpreted by the handler
    pub payload: serde_json::Value,

    pub metadata: serde_json::Value,

    pub priority: Priority,

    pub status: OperationStatus,

    /// Number of retries consumed so far
    pub retry_count: u32,

    pub max_retries: u32,

    /// Enqueue order, breaks ties between equal timestamps
    pub sequence: u64,

    pub created_at: DateTime<Utc>,

    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Earliest time the operation may be dispatched again
    pub next_eligible_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn document_key(&self) -> Option<DocumentKey> {
        self.document_id
            .as_ref()
            .map(|document_id| DocumentKey::new(self.collection.clone(), document_id.clone()))
    }

    /// Pending (or waiting out a backoff) and due at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.next_eligible_at <= now
    }
}

impl StoredRecord for QueuedOperation {
    const KIND: &'static str = "sync_queue";

    fn record_id(&self) -> Uuid {
        self.id
    }

    fn index_value(&self, field: IndexField) -> Option<String> {
        match field {
            IndexField::Status => Some(self.status.as_str().to_string()),
            IndexField::Collection => Some(self.collection.clone()),
            IndexField::DocumentKey => self.document_key().map(|key| key.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_operation_type_parse() {
        assert_eq!("update".parse::<OperationType>().unwrap(), OperationType::Update);
        assert!("upsert".parse::<OperationType>().is_err());
        assert!(!OperationType::Create.requires_document_id());
        assert!(OperationType::Delete.requires_document_id());
    }

    #[test]
    fn test_status_round_trip_and_classes() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Processing,
            OperationStatus::PendingRetry,
            OperationStatus::Completed,
            OperationStatus::Discarded,
            OperationStatus::Conflicted,
        ] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
        assert_eq!(
            "pending-retry".parse::<OperationStatus>().unwrap(),
            OperationStatus::PendingRetry
        );
        assert!(OperationStatus::PendingRetry.is_waiting());
        assert!(!OperationStatus::Processing.is_waiting());
        assert!(OperationStatus::Conflicted.is_terminal());
    }

    #[test]
    fn test_document_key_display() {
        let key = DocumentKey::new("medications", "med-42");
        assert_eq!(key.to_string(), "medications/med-42");
    }
}
