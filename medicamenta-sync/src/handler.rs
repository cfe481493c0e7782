//! Operation handler registry
//!
//! Handlers perform the remote effect of a queued operation. Each handler
//! declares the operation type it serves and the collections it accepts;
//! the registry resolves an item to exactly one handler, preferring an exact
//! collection match over the `*` wildcard.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::operation::{OperationType, QueuedOperation};

/// Collection selector declared by a handler
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionPattern {
    Exact(String),
    /// `*`
    Any,
}

impl CollectionPattern {
    pub fn exact(collection: impl Into<String>) -> Self {
        CollectionPattern::Exact(collection.into())
    }

    pub fn matches(&self, collection: &str) -> bool {
        match self {
            CollectionPattern::Exact(name) => name == collection,
            CollectionPattern::Any => true,
        }
    }

    fn is_wildcard(&self) -> bool {
        matches!(self, CollectionPattern::Any)
    }
}

impl fmt::Display for CollectionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionPattern::Exact(name) => f.write_str(name),
            CollectionPattern::Any => f.write_str("*"),
        }
    }
}

impl FromStr for CollectionPattern {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s.trim() {
            "" => Err(SyncError::InvalidHandler(
                "collection pattern must not be empty".to_string(),
            )),
            "*" => Ok(CollectionPattern::Any),
            name => Ok(CollectionPattern::Exact(name.to_string())),
        }
    }
}

/// Result of one handler invocation. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Success,
    /// Worth retrying later (network, timeout, 5xx)
    TransientFailure(String),
    /// Retrying cannot help (validation, malformed payload, 4xx)
    PermanentFailure(String),
    /// The server copy changed independently of this client
    ConflictDetected {
        server_data: serde_json::Value,
        server_timestamp: Option<DateTime<Utc>>,
    },
}

impl HandlerOutcome {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerOutcome::TransientFailure(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerOutcome::PermanentFailure(message.into())
    }
}

/// Performs the remote effect of queued operations.
///
/// Handlers own their timeouts: the orchestrator awaits `process` without a
/// deadline.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn operation_type(&self) -> OperationType;

    fn collections(&self) -> Vec<CollectionPattern>;

    /// Name used in logs
    fn name(&self) -> &str {
        "handler"
    }

    async fn process(&self, operation: &QueuedOperation) -> HandlerOutcome;
}

struct Registration {
    operation_type: OperationType,
    pattern: CollectionPattern,
    handler: Arc<dyn OperationHandler>,
}

#[derive(Default)]
pub struct HandlerRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every pattern it declares.
    ///
    /// Rejected as a whole when the declaration is malformed or when any of
    /// its `(type, pattern)` pairs is already taken.
    pub fn register(&self, handler: Arc<dyn OperationHandler>) -> SyncResult<()> {
        let operation_type = handler.operation_type();
        let patterns = handler.collections();

        if patterns.is_empty() {
            return Err(SyncError::InvalidHandler(format!(
                "{} handler '{}' declares no collections",
                operation_type,
                handler.name()
            )));
        }
        for pattern in &patterns {
            if let CollectionPattern::Exact(name) = pattern {
                if name.trim().is_empty() {
                    return Err(SyncError::InvalidHandler(format!(
                        "{} handler '{}' declares an empty collection name",
                        operation_type,
                        handler.name()
                    )));
                }
            }
        }

        let mut registrations = self.registrations.write();
        for (index, pattern) in patterns.iter().enumerate() {
            let taken = registrations
                .iter()
                .any(|r| r.operation_type == operation_type && &r.pattern == pattern)
                || patterns.iter().take(index).any(|earlier| earlier == pattern);
            if taken {
                return Err(SyncError::AmbiguousHandler {
                    operation_type,
                    pattern: pattern.to_string(),
                });
            }
        }

        for pattern in patterns {
            tracing::debug!(
                operation = %operation_type,
                collection = %pattern,
                handler = handler.name(),
                "Registered operation handler"
            );
            registrations.push(Registration {
                operation_type,
                pattern,
                handler: Arc::clone(&handler),
            });
        }

        Ok(())
    }

    /// Remove registrations for `operation_type` on the given patterns,
    /// returning how many were removed
    pub fn unregister(&self, operation_type: OperationType, patterns: &[CollectionPattern]) -> usize {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations
            .retain(|r| !(r.operation_type == operation_type && patterns.contains(&r.pattern)));
        before - registrations.len()
    }

    /// Handler for `operation_type` on `collection`; exact matches win over
    /// the wildcard
    pub fn resolve(
        &self,
        operation_type: OperationType,
        collection: &str,
    ) -> Option<Arc<dyn OperationHandler>> {
        let registrations = self.registrations.read();
        let candidates = || {
            registrations
                .iter()
                .filter(move |r| r.operation_type == operation_type && r.pattern.matches(collection))
        };

        candidates()
            .find(|r| !r.pattern.is_wildcard())
            .or_else(|| candidates().next())
            .map(|r| Arc::clone(&r.handler))
    }

    pub fn registered(&self) -> Vec<(OperationType, CollectionPattern)> {
        self.registrations
            .read()
            .iter()
            .map(|r| (r.operation_type, r.pattern.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationStatus, Priority};
    use mockall::mock;

    mock! {
        pub Handler {}

        #[async_trait]
        impl OperationHandler for Handler {
            fn operation_type(&self) -> OperationType;
            fn collections(&self) -> Vec<CollectionPattern>;
            fn name(&self) -> &str;
            async fn process(&self, operation: &QueuedOperation) -> HandlerOutcome;
        }
    }

    fn handler(
        operation_type: OperationType,
        patterns: Vec<CollectionPattern>,
        name: &'static str,
    ) -> Arc<MockHandler> {
        let mut mock = MockHandler::new();
        mock.expect_operation_type().return_const(operation_type);
        mock.expect_collections().returning(move || patterns.clone());
        mock.expect_name().return_const(name.to_string());
        Arc::new(mock)
    }

    fn operation(collection: &str) -> QueuedOperation {
        let now = Utc::now();
        QueuedOperation {
            id: uuid::Uuid::new_v4(),
            operation_type: OperationType::Update,
            collection: collection.to_string(),
            document_id: Some("doc-1".to_string()),
            payload: serde_json::json!({}),
            metadata: serde_json::Value::Null,
            priority: Priority::Normal,
            status: OperationStatus::Processing,
            retry_count: 0,
            max_retries: 3,
            sequence: 0,
            created_at: now,
            last_attempt_at: Some(now),
            next_eligible_at: now,
            completed_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!("*".parse::<CollectionPattern>().unwrap(), CollectionPattern::Any);
        assert_eq!(
            "medications".parse::<CollectionPattern>().unwrap(),
            CollectionPattern::exact("medications")
        );
        assert!("".parse::<CollectionPattern>().is_err());
    }

    #[tokio::test]
    async fn test_exact_match_wins_over_wildcard() {
        let registry = HandlerRegistry::new();
        let wildcard = handler(OperationType::Update, vec![CollectionPattern::Any], "generic");
        let exact = handler(
            OperationType::Update,
            vec![CollectionPattern::exact("medications")],
            "medications",
        );
        registry.register(wildcard).unwrap();
        registry.register(exact).unwrap();

        let resolved = registry.resolve(OperationType::Update, "medications").unwrap();
        assert_eq!(resolved.name(), "medications");
        let resolved = registry.resolve(OperationType::Update, "dose_logs").unwrap();
        assert_eq!(resolved.name(), "generic");
        assert!(registry.resolve(OperationType::Delete, "medications").is_none());
    }

    #[tokio::test]
    async fn test_resolved_handler_processes_operation() {
        let mut mock = MockHandler::new();
        mock.expect_operation_type().return_const(OperationType::Update);
        mock.expect_collections()
            .returning(|| vec![CollectionPattern::exact("medications")]);
        mock.expect_name().return_const("medications".to_string());
        mock.expect_process()
            .times(1)
            .returning(|_| HandlerOutcome::transient("timeout"));

        let registry = HandlerRegistry::new();
        registry.register(Arc::new(mock)).unwrap();

        let resolved = registry.resolve(OperationType::Update, "medications").unwrap();
        let outcome = resolved.process(&operation("medications")).await;
        assert_eq!(outcome, HandlerOutcome::TransientFailure("timeout".to_string()));
    }

    #[test]
    fn test_overlapping_registration_is_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .register(handler(
                OperationType::Create,
                vec![CollectionPattern::exact("medications")],
                "first",
            ))
            .unwrap();

        let result = registry.register(handler(
            OperationType::Create,
            vec![CollectionPattern::exact("dose_logs"), CollectionPattern::exact("medications")],
            "second",
        ));
        assert!(matches!(result, Err(SyncError::AmbiguousHandler { .. })));
        // Nothing from the rejected handler was registered
        assert_eq!(registry.len(), 1);

        let duplicate_in_declaration = registry.register(handler(
            OperationType::Delete,
            vec![CollectionPattern::Any, CollectionPattern::Any],
            "third",
        ));
        assert!(duplicate_in_declaration.is_err());

        // Same pattern under a different type is fine
        registry
            .register(handler(
                OperationType::Update,
                vec![CollectionPattern::exact("medications")],
                "fourth",
            ))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_malformed_handler_is_rejected() {
        let registry = HandlerRegistry::new();
        let empty = registry.register(handler(OperationType::Create, vec![], "empty"));
        assert!(matches!(empty, Err(SyncError::InvalidHandler(_))));

        let blank = registry.register(handler(
            OperationType::Create,
            vec![CollectionPattern::exact(" ")],
            "blank",
        ));
        assert!(matches!(blank, Err(SyncError::InvalidHandler(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry
            .register(handler(
                OperationType::Update,
                vec![CollectionPattern::exact("medications"), CollectionPattern::Any],
                "multi",
            ))
            .unwrap();

        assert_eq!(registry.unregister(OperationType::Update, &[CollectionPattern::Any]), 1);
        assert_eq!(
            registry.registered(),
            vec![(OperationType::Update, CollectionPattern::exact("medications"))]
        );
        assert!(registry.resolve(OperationType::Update, "dose_logs").is_none());
    }
}
