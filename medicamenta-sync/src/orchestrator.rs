//! Sync orchestrator
//!
//! Owns the drain cycle: pulls eligible operations from the queue in
//! priority order, dispatches them to their handlers, and applies each
//! outcome. At most one cycle runs at a time; callers that ask for a sync
//! while one is running receive that cycle's report.
//!
//! A background watcher (see [`SyncOrchestrator::start`]) starts a cycle
//! when the device comes back online and, with `auto_process` enabled, on a
//! timer and after new operations are queued.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::{ConfigHandle, ConfigUpdate, ConflictPolicy, SyncConfig};
use crate::conflict::{
    ConflictId, ConflictRegistry, ConflictReport, ResolutionKind, ResolutionOutcome,
    ResolutionStrategy,
};
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::handler::{HandlerOutcome, HandlerRegistry};
use crate::operation::{
    EnqueueOptions, OperationId, OperationType, Priority, QueuedOperation,
};
use crate::queue::{FailureDisposition, OperationQueue, QueueMetrics};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Priority vocabulary used by application code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl From<SyncPriority> for Priority {
    fn from(priority: SyncPriority) -> Self {
        match priority {
            SyncPriority::Critical => Priority::Critical,
            SyncPriority::High => Priority::High,
            SyncPriority::Normal => Priority::Normal,
            SyncPriority::Low => Priority::Low,
        }
    }
}

impl FromStr for SyncPriority {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(SyncPriority::Critical),
            "high" => Ok(SyncPriority::High),
            "normal" => Ok(SyncPriority::Normal),
            "low" => Ok(SyncPriority::Low),
            _ => Err(SyncError::InvalidOperation(format!("Unknown priority: {s}"))),
        }
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Priority::from(*self), f)
    }
}

/// Outcome counts of one drain cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub succeeded: usize,
    /// Transient failures that were rescheduled
    pub failed: usize,
    pub discarded: usize,
    pub conflicts: usize,
    /// Claimed operations handed back because their document became held
    pub held: usize,
    /// The cycle did not run because the device is offline
    pub offline: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            discarded: 0,
            conflicts: 0,
            held: 0,
            offline: false,
            started_at,
            finished_at: started_at,
        }
    }

    fn offline(at: DateTime<Utc>) -> Self {
        Self {
            offline: true,
            ..Self::new(at)
        }
    }

    /// Operations handed to a handler during the cycle
    pub fn dispatched(&self) -> usize {
        self.succeeded + self.failed + self.discarded + self.conflicts
    }
}

/// Totals across cycles since start or the last `reset_metrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_succeeded: usize,
    pub total_failed: usize,
    pub total_discarded: usize,
    pub total_conflicts: usize,
    pub cycles: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleReport>,
}

impl SyncStats {
    fn record(&mut self, report: &CycleReport) {
        self.total_succeeded += report.succeeded;
        self.total_failed += report.failed;
        self.total_discarded += report.discarded;
        self.total_conflicts += report.conflicts;
        self.cycles += 1;
        self.last_sync_at = Some(report.finished_at);
        self.last_cycle = Some(report.clone());
    }
}

/// Notifications for observers (UI badges, toasts, conflict prompts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    CycleStarted,
    CycleCompleted(CycleReport),
    /// A sync was requested while offline
    Offline,
    ConnectivityChanged {
        online: bool,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        collection: String,
        document_id: String,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        strategy: ResolutionKind,
    },
    OperationDiscarded {
        operation_id: OperationId,
        collection: String,
        reason: String,
    },
}

/// Aggregate status for display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub processing: bool,
    pub pending: usize,
    pub critical_pending: usize,
    pub unresolved_conflicts: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Snapshot for the administrative surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub online: bool,
    pub processing: bool,
    pub queue: QueueMetrics,
    pub unresolved_conflicts: usize,
    pub stats: SyncStats,
    pub config: SyncConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Reconnected,
    Interval,
    Wake,
}

type CycleSlot = Mutex<Option<watch::Receiver<Option<CycleReport>>>>;

/// Clears the in-flight slot when the leading `sync_now` finishes or is
/// dropped. A leader dropped mid-cycle hands its unsettled claims back to
/// the queue.
struct InFlight<'a> {
    orchestrator: &'a SyncOrchestrator,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.orchestrator.release_abandoned();
        }
        *self.orchestrator.in_flight.lock() = None;
    }
}

pub struct SyncOrchestrator {
    queue: Arc<OperationQueue>,
    conflicts: Arc<ConflictRegistry>,
    handlers: Arc<HandlerRegistry>,
    connectivity: Connectivity,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    in_flight: CycleSlot,
    /// Operations claimed by the running cycle and not yet settled
    claimed: Mutex<Vec<OperationId>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    stats: RwLock<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<SyncStatus>,
    wake: Arc<Notify>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<OperationQueue>,
        conflicts: Arc<ConflictRegistry>,
        handlers: Arc<HandlerRegistry>,
        connectivity: Connectivity,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(SyncStatus {
            online: connectivity.is_online(),
            ..SyncStatus::default()
        });

        Self {
            queue,
            conflicts,
            handlers,
            connectivity,
            config,
            clock,
            in_flight: Mutex::new(None),
            claimed: Mutex::new(Vec::new()),
            recovery: Mutex::new(None),
            stats: RwLock::new(SyncStats::default()),
            events,
            status,
            wake: Arc::new(Notify::new()),
            watcher: Mutex::new(None),
        }
    }

    /// Run a drain cycle now, or join the one already running.
    ///
    /// Never fails: being offline, handler failures and store errors are all
    /// reflected in the report, item states and events.
    pub async fn sync_now(&self) -> CycleReport {
        loop {
            let (leader, mut receiver) = {
                let mut slot = self.in_flight.lock();
                match slot.as_ref() {
                    Some(receiver) => (None, receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        *slot = Some(receiver.clone());
                        (Some(sender), receiver)
                    }
                }
            };

            if let Some(sender) = leader {
                let mut guard = InFlight {
                    orchestrator: self,
                    finished: false,
                };
                self.await_recovery().await;
                let report = self.run_cycle().await;
                guard.finished = true;
                sender.send_replace(Some(report.clone()));
                drop(guard);
                self.refresh_status().await;
                return report;
            }

            loop {
                if let Some(report) = receiver.borrow_and_update().clone() {
                    return report;
                }
                if receiver.changed().await.is_err() {
                    break;
                }
            }
            let finished = receiver.borrow().clone();
            if let Some(report) = finished {
                return report;
            }
            // The leading call was dropped before finishing; start over
        }
    }

    async fn run_cycle(&self) -> CycleReport {
        let started_at = self.clock.now();

        if !self.connectivity.is_online() {
            tracing::debug!("Sync requested while offline");
            self.emit(SyncEvent::Offline);
            return CycleReport::offline(started_at);
        }

        self.emit(SyncEvent::CycleStarted);
        self.refresh_status().await;

        let config = self.config.snapshot();
        let mut report = CycleReport::new(started_at);
        let mut dispatched = 0_usize;

        'cycle: while dispatched < config.max_items_per_cycle {
            if !self.connectivity.is_online() {
                tracing::info!("Connectivity lost, ending sync cycle");
                break;
            }

            let limit = config
                .batch_size
                .min(config.max_items_per_cycle - dispatched);
            let batch = match self.queue.dequeue_batch(limit).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to claim operations");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            self.claimed
                .lock()
                .extend(batch.iter().map(|operation| operation.id));

            let mut remaining = batch.into_iter();
            while let Some(operation) = remaining.next() {
                if !self.connectivity.is_online() {
                    self.release_all(std::iter::once(operation).chain(remaining)).await;
                    break 'cycle;
                }

                dispatched += 1;
                let id = operation.id;
                let applied = self.dispatch(operation, &config, &mut report).await;
                self.settle(id);
                if let Err(err) = applied {
                    tracing::error!(
                        operation_id = %id,
                        error = %err,
                        "Store error while applying outcome, ending sync cycle"
                    );
                    self.release_all(remaining).await;
                    if let Err(err) = self.queue.release(id).await {
                        tracing::error!(operation_id = %id, error = %err, "Failed to release operation");
                    }
                    break 'cycle;
                }
            }
        }

        self.claimed.lock().clear();
        report.finished_at = self.clock.now();
        self.stats.write().record(&report);

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            discarded = report.discarded,
            conflicts = report.conflicts,
            held = report.held,
            "Sync cycle completed"
        );
        self.emit(SyncEvent::CycleCompleted(report.clone()));

        report
    }

    fn settle(&self, id: OperationId) {
        self.claimed.lock().retain(|claimed| *claimed != id);
    }

    /// Hand back the claims of a cycle whose future was dropped
    fn release_abandoned(&self) {
        let claimed = std::mem::take(&mut *self.claimed.lock());
        if claimed.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                count = claimed.len(),
                "Sync cycle dropped outside a runtime; claims are recovered on restart"
            );
            return;
        };

        tracing::warn!(count = claimed.len(), "Sync cycle dropped mid-flight, releasing its claims");
        let queue = Arc::clone(&self.queue);
        let task = runtime.spawn(async move {
            for id in claimed {
                if let Err(err) = queue.release(id).await {
                    tracing::error!(operation_id = %id, error = %err, "Failed to release abandoned claim");
                }
            }
        });
        *self.recovery.lock() = Some(task);
    }

    /// Wait for claims of a dropped cycle to be handed back
    async fn await_recovery(&self) {
        let task = self.recovery.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Releasing abandoned claims did not complete");
            }
        }
    }

    async fn release_all(&self, operations: impl Iterator<Item = QueuedOperation>) {
        for operation in operations {
            if let Err(err) = self.queue.release(operation.id).await {
                tracing::error!(
                    operation_id = %operation.id,
                    error = %err,
                    "Failed to release operation; it will be recovered on restart"
                );
            }
        }
    }

    async fn dispatch(
        &self,
        operation: QueuedOperation,
        config: &SyncConfig,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        // A conflict registered earlier in this batch may have held the document
        if let Some(key) = operation.document_key() {
            if self.queue.is_held(&key).await {
                self.queue.release(operation.id).await?;
                report.held += 1;
                return Ok(());
            }
        }

        let Some(handler) = self
            .handlers
            .resolve(operation.operation_type, &operation.collection)
        else {
            let reason = format!(
                "No handler registered for {} on '{}'",
                operation.operation_type, operation.collection
            );
            return self.fail(&operation, &reason, true, report).await;
        };

        tracing::debug!(
            operation_id = %operation.id,
            operation = %operation.operation_type,
            collection = %operation.collection,
            handler = handler.name(),
            "Dispatching operation"
        );

        match handler.process(&operation).await {
            HandlerOutcome::Success => {
                if self.queue.mark_completed(operation.id).await? {
                    report.succeeded += 1;
                }
            }
            HandlerOutcome::TransientFailure(message) => {
                self.fail(&operation, &message, false, report).await?;
            }
            HandlerOutcome::PermanentFailure(message) => {
                self.fail(&operation, &message, true, report).await?;
            }
            HandlerOutcome::ConflictDetected {
                server_data,
                server_timestamp,
            } => {
                self.handle_conflict(operation, server_data, server_timestamp, config, report)
                    .await?;
            }
        }

        Ok(())
    }

    async fn fail(
        &self,
        operation: &QueuedOperation,
        reason: &str,
        is_permanent: bool,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        match self.queue.mark_failed(operation.id, reason, is_permanent).await? {
            FailureDisposition::Rescheduled { .. } => report.failed += 1,
            FailureDisposition::Discarded => {
                report.discarded += 1;
                self.emit(SyncEvent::OperationDiscarded {
                    operation_id: operation.id,
                    collection: operation.collection.clone(),
                    reason: reason.to_string(),
                });
            }
            FailureDisposition::Ignored => {}
        }
        Ok(())
    }

    async fn handle_conflict(
        &self,
        operation: QueuedOperation,
        server_data: serde_json::Value,
        server_timestamp: Option<DateTime<Utc>>,
        config: &SyncConfig,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let Some(document_id) = operation.document_id.clone() else {
            return self
                .fail(
                    &operation,
                    "Conflict reported for an operation without a document id",
                    true,
                    report,
                )
                .await;
        };

        let conflict = self
            .conflicts
            .register(ConflictReport {
                collection: operation.collection.clone(),
                document_id: document_id.clone(),
                operation_id: Some(operation.id),
                priority: operation.priority,
                local_data: operation.payload.clone(),
                server_data,
                local_timestamp: operation.created_at,
                server_timestamp,
            })
            .await?;
        self.queue
            .mark_conflicted(operation.id, &format!("Conflict {}", conflict.id))
            .await?;
        report.conflicts += 1;

        self.emit(SyncEvent::ConflictDetected {
            conflict_id: conflict.id,
            collection: operation.collection,
            document_id,
        });

        if config.conflict_policy == ConflictPolicy::LastWriterWins {
            let strategy = conflict.suggested_strategy();
            self.resolve_conflict(conflict.id, strategy).await?;
        }

        Ok(())
    }

    /// Resolve a conflict and let the resulting write (if any) sync
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ResolutionOutcome> {
        let outcome = self.conflicts.resolve(id, strategy).await?;

        if let Some(kind) = outcome.conflict.resolution_strategy {
            self.emit(SyncEvent::ConflictResolved {
                conflict_id: id,
                strategy: kind,
            });
        }
        if outcome.enqueued.is_some() {
            self.nudge();
        }
        self.refresh_status().await;

        Ok(outcome)
    }

    /// Queue an operation using the application priority vocabulary
    pub async fn queue_operation(
        &self,
        operation_type: OperationType,
        collection: &str,
        payload: serde_json::Value,
        document_id: Option<String>,
        priority: SyncPriority,
    ) -> SyncResult<OperationId> {
        let options = EnqueueOptions {
            document_id,
            priority: priority.into(),
            ..EnqueueOptions::default()
        };
        let id = self
            .queue
            .enqueue(operation_type, collection, payload, options)
            .await?;

        self.nudge();
        self.refresh_status().await;
        Ok(id)
    }

    pub async fn queue_critical_operation(
        &self,
        operation_type: OperationType,
        collection: &str,
        payload: serde_json::Value,
        document_id: Option<String>,
    ) -> SyncResult<OperationId> {
        self.queue_operation(
            operation_type,
            collection,
            payload,
            document_id,
            SyncPriority::Critical,
        )
        .await
    }

    /// Wake the watcher so it can drain newly queued work
    fn nudge(&self) {
        if self.config.snapshot().auto_process && self.connectivity.is_online() {
            self.wake.notify_one();
        }
    }

    /// Start the background watcher. Calling `start` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock();
        if watcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let orchestrator = Arc::downgrade(self);
        let mut connectivity = self.connectivity.subscribe();
        // Transitions after this point must be seen as changes
        let was_online = *connectivity.borrow_and_update();
        let wake = Arc::clone(&self.wake);
        *watcher = Some(tokio::spawn(watch_loop(
            orchestrator,
            connectivity,
            was_online,
            wake,
        )));

        tracing::debug!("Sync watcher started");
    }

    /// Stop the background watcher. A cycle already running completes.
    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
            tracing::debug!("Sync watcher stopped");
        }
    }

    async fn on_trigger(self: Arc<Self>, trigger: Trigger) {
        if !self.connectivity.is_online() || self.is_processing() {
            return;
        }
        if trigger != Trigger::Reconnected && !self.config.snapshot().auto_process {
            return;
        }
        if self.queue.pending_count().await == 0 {
            return;
        }

        tracing::debug!(?trigger, "Starting automatic sync");
        tokio::spawn(async move {
            self.sync_now().await;
        });
    }

    async fn on_connectivity_changed(&self, online: bool) {
        self.emit(SyncEvent::ConnectivityChanged { online });
        self.refresh_status().await;
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Recompute the published status from queue and registry state
    pub async fn refresh_status(&self) {
        let last_sync_at = self.stats.read().last_sync_at;
        let status = SyncStatus {
            online: self.connectivity.is_online(),
            processing: self.is_processing(),
            pending: self.queue.pending_count().await,
            critical_pending: self.queue.critical_pending_count().await,
            unresolved_conflicts: self.conflicts.unresolved_count().await,
            last_sync_at,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub async fn queue_summary(&self) -> QueueSummary {
        let stats = self.stats();
        QueueSummary {
            online: self.connectivity.is_online(),
            processing: self.is_processing(),
            queue: self.queue.metrics().await,
            unresolved_conflicts: self.conflicts.unresolved_count().await,
            stats,
            config: self.config.snapshot(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Zero the cycle totals. Queue metrics are derived from item states
    /// and are unaffected.
    pub fn reset_metrics(&self) {
        *self.stats.write() = SyncStats::default();
        tracing::info!("Sync metrics reset");
    }

    /// Applies from the next cycle and the next recorded failure
    pub fn update_config(&self, update: &ConfigUpdate) -> SyncResult<SyncConfig> {
        let config = self.config.update(update)?;
        // Let the watcher pick up a new interval
        self.wake.notify_one();
        Ok(config)
    }

    pub fn reset_config(&self) -> SyncConfig {
        let config = self.config.reset();
        self.wake.notify_one();
        config
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn conflicts(&self) -> &Arc<ConflictRegistry> {
        &self.conflicts
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

async fn watch_loop(
    orchestrator: Weak<SyncOrchestrator>,
    mut connectivity: watch::Receiver<bool>,
    mut was_online: bool,
    wake: Arc<Notify>,
) {
    loop {
        let (auto_process, interval) = match orchestrator.upgrade() {
            Some(orchestrator) => {
                let config = orchestrator.config.snapshot();
                (config.auto_process, config.process_interval())
            }
            None => break,
        };

        let trigger = tokio::select! {
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *connectivity.borrow_and_update();
                let reconnected = online && !was_online;
                was_online = online;

                if let Some(orchestrator) = orchestrator.upgrade() {
                    orchestrator.on_connectivity_changed(online).await;
                }
                reconnected.then_some(Trigger::Reconnected)
            }
            () = tokio::time::sleep(interval), if auto_process => Some(Trigger::Interval),
            () = wake.notified() => Some(Trigger::Wake),
        };

        let Some(trigger) = trigger else {
            continue;
        };
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.on_trigger(trigger).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::handler::{CollectionPattern, OperationHandler};
    use crate::operation::OperationStatus;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Returns a fixed outcome and records the document ids it saw
    struct FixedHandler {
        operation_type: OperationType,
        outcome: HandlerOutcome,
        delay: Option<Duration>,
        seen: Mutex<Vec<Option<String>>>,
    }

    impl FixedHandler {
        fn new(operation_type: OperationType, outcome: HandlerOutcome) -> Self {
            Self {
                operation_type,
                outcome,
                delay: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<Option<String>> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl OperationHandler for FixedHandler {
        fn operation_type(&self) -> OperationType {
            self.operation_type
        }

        fn collections(&self) -> Vec<CollectionPattern> {
            vec![CollectionPattern::Any]
        }

        async fn process(&self, operation: &QueuedOperation) -> HandlerOutcome {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().push(operation.document_id.clone());
            self.outcome.clone()
        }
    }

    async fn orchestrator(config: SyncConfig, online: bool) -> Arc<SyncOrchestrator> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let config = ConfigHandle::new(config).unwrap();
        let queue = Arc::new(
            OperationQueue::open(Arc::new(InMemoryStore::new()), config.clone(), clock.clone())
                .await
                .unwrap(),
        );
        let conflicts = Arc::new(
            ConflictRegistry::open(Arc::new(InMemoryStore::new()), queue.clone(), clock.clone())
                .await
                .unwrap(),
        );
        Arc::new(SyncOrchestrator::new(
            queue,
            conflicts,
            Arc::new(HandlerRegistry::new()),
            Connectivity::new(online),
            config,
            clock,
        ))
    }

    fn manual() -> SyncConfig {
        SyncConfig {
            auto_process: false,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_sync_priority_mapping() {
        assert_eq!("CRITICAL".parse::<SyncPriority>().unwrap(), SyncPriority::Critical);
        assert!("urgent".parse::<SyncPriority>().is_err());
        assert_eq!(Priority::from(SyncPriority::Low), Priority::Low);
        assert_eq!(SyncPriority::High.to_string(), "high");
    }

    #[tokio::test]
    async fn test_offline_cycle_does_nothing() {
        let sync = orchestrator(manual(), false).await;
        let handler = Arc::new(FixedHandler::new(OperationType::Create, HandlerOutcome::Success));
        sync.handlers().register(handler.clone()).unwrap();
        let mut events = sync.subscribe();

        sync.queue_operation(OperationType::Create, "dose_logs", json!({}), None, SyncPriority::Normal)
            .await
            .unwrap();
        let report = sync.sync_now().await;

        assert!(report.offline);
        assert_eq!((report.succeeded, report.failed, report.discarded), (0, 0, 0));
        assert!(handler.seen().is_empty());
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Offline);
        assert_eq!(sync.stats().cycles, 0);
    }

    #[tokio::test]
    async fn test_missing_handler_discards() {
        let sync = orchestrator(manual(), true).await;
        let id = sync
            .queue_operation(OperationType::Delete, "reminders", json!({}), Some("r-1".into()), SyncPriority::Low)
            .await
            .unwrap();

        let report = sync.sync_now().await;
        assert_eq!(report.discarded, 1);
        let operation = sync.queue().get(id).await.unwrap();
        assert_eq!(operation.status, OperationStatus::Discarded);
        assert!(operation.last_error.unwrap().contains("No handler"));
    }

    #[tokio::test]
    async fn test_cycle_cap_bounds_dispatches() {
        let sync = orchestrator(
            SyncConfig {
                batch_size: 2,
                max_items_per_cycle: 3,
                ..manual()
            },
            true,
        )
        .await;
        let handler = Arc::new(FixedHandler::new(OperationType::Create, HandlerOutcome::Success));
        sync.handlers().register(handler.clone()).unwrap();
        for _ in 0..5 {
            sync.queue_operation(OperationType::Create, "dose_logs", json!({}), None, SyncPriority::Normal)
                .await
                .unwrap();
        }

        assert_eq!(sync.sync_now().await.succeeded, 3);
        assert_eq!(sync.sync_now().await.succeeded, 2);
        assert_eq!(handler.seen().len(), 5);

        let stats = sync.stats();
        assert_eq!((stats.cycles, stats.total_succeeded), (2, 5));
        sync.reset_metrics();
        assert_eq!(sync.stats(), SyncStats::default());
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_cycle() {
        let sync = orchestrator(manual(), true).await;
        let mut handler = FixedHandler::new(OperationType::Create, HandlerOutcome::Success);
        handler.delay = Some(Duration::from_millis(20));
        let handler = Arc::new(handler);
        sync.handlers().register(handler.clone()).unwrap();
        for _ in 0..3 {
            sync.queue_operation(OperationType::Create, "dose_logs", json!({}), None, SyncPriority::Normal)
                .await
                .unwrap();
        }

        let (first, second) = tokio::join!(sync.sync_now(), sync.sync_now());
        assert_eq!(first, second);
        assert_eq!(first.succeeded, 3);
        assert_eq!(handler.seen().len(), 3);
        assert_eq!(sync.stats().cycles, 1);
        assert!(!sync.is_processing());
    }

    #[tokio::test]
    async fn test_dropped_cycle_releases_its_claims() {
        let sync = orchestrator(manual(), true).await;
        let mut handler = FixedHandler::new(OperationType::Create, HandlerOutcome::Success);
        handler.delay = Some(Duration::from_millis(200));
        let handler = Arc::new(handler);
        sync.handlers().register(handler.clone()).unwrap();
        let id = sync
            .queue_operation(OperationType::Create, "dose_logs", json!({}), None, SyncPriority::Normal)
            .await
            .unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(20), sync.sync_now()).await;
        assert!(timed_out.is_err());
        assert!(!sync.is_processing());

        let report = sync.sync_now().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(sync.queue().get(id).await.unwrap().status, OperationStatus::Completed);
        assert_eq!(sync.queue().pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_last_writer_wins_policy_resolves_immediately() {
        let sync = orchestrator(
            SyncConfig {
                conflict_policy: ConflictPolicy::LastWriterWins,
                ..manual()
            },
            true,
        )
        .await;
        let server_newer = Utc::now() + chrono::Duration::days(1);
        let handler = Arc::new(FixedHandler::new(
            OperationType::Update,
            HandlerOutcome::ConflictDetected {
                server_data: json!({"dose_mg": 850}),
                server_timestamp: Some(server_newer),
            },
        ));
        sync.handlers().register(handler).unwrap();
        let mut events = sync.subscribe();

        let id = sync
            .queue_operation(OperationType::Update, "medications", json!({"dose_mg": 500}), Some("med-1".into()), SyncPriority::High)
            .await
            .unwrap();
        let report = sync.sync_now().await;

        assert_eq!(report.conflicts, 1);
        assert_eq!(sync.queue().get(id).await.unwrap().status, OperationStatus::Conflicted);
        assert!(sync.conflicts().unresolved_conflicts().await.is_empty());

        let mut saw_resolution = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::ConflictResolved { strategy, .. } = event {
                assert_eq!(strategy, ResolutionKind::ServerWins);
                saw_resolution = true;
            }
        }
        assert!(saw_resolution);
    }

    #[tokio::test]
    async fn test_conflict_on_create_without_document_is_discarded() {
        let sync = orchestrator(manual(), true).await;
        sync.handlers()
            .register(Arc::new(FixedHandler::new(
                OperationType::Create,
                HandlerOutcome::ConflictDetected {
                    server_data: json!({}),
                    server_timestamp: None,
                },
            )))
            .unwrap();
        sync.queue_operation(OperationType::Create, "dose_logs", json!({}), None, SyncPriority::Normal)
            .await
            .unwrap();

        let report = sync.sync_now().await;
        assert_eq!((report.conflicts, report.discarded), (0, 1));
    }

    #[tokio::test]
    async fn test_status_and_summary() {
        let sync = orchestrator(manual(), true).await;
        let status = sync.status();
        sync.queue_critical_operation(OperationType::Create, "dose_logs", json!({}), None)
            .await
            .unwrap();

        let current = status.borrow().clone();
        assert_eq!((current.pending, current.critical_pending), (1, 1));
        assert!(current.online);

        let summary = sync.queue_summary().await;
        assert_eq!(summary.queue.critical_pending, 1);
        assert!(!summary.config.auto_process);

        let updated = sync
            .update_config(&ConfigUpdate {
                max_retries: Some(1),
                ..ConfigUpdate::default()
            })
            .unwrap();
        assert_eq!(updated.max_retries, 1);
        assert_eq!(sync.reset_config(), SyncConfig::default());
    }
}
