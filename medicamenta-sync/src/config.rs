//! Engine configuration
//!
//! Sources are layered: built-in defaults, then an optional file, then
//! `MEDICAMENTA_SYNC__*` environment variables. The live configuration is
//! shared through a [`ConfigHandle`]; updates apply to the next drain cycle
//! and to failures recorded after the update, never to backoffs that are
//! already scheduled.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::SyncResult;

pub const ENV_PREFIX: &str = "MEDICAMENTA_SYNC";

/// What the orchestrator does when a handler reports a conflict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Record the conflict and hold the document until someone resolves it
    #[default]
    Manual,
    /// Resolve immediately from the local/server timestamps
    LastWriterWins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_delay_bounds"))]
pub struct SyncConfig {
    /// Retries allowed after the first attempt before an operation is discarded
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 100))]
    pub max_retries: u32,

    /// Backoff before the first retry; doubles on each further retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling for the backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Drain the queue on a timer and right after enqueue while online
    #[serde(default = "default_auto_process")]
    pub auto_process: bool,

    #[serde(default = "default_process_interval_ms")]
    #[validate(range(min = 100))]
    pub process_interval_ms: u64,

    /// Items claimed per `dequeue_batch` call
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: usize,

    /// Upper bound on dispatches in a single drain cycle
    #[serde(default = "default_max_items_per_cycle")]
    #[validate(range(min = 1))]
    pub max_items_per_cycle: usize,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_auto_process() -> bool {
    true
}

fn default_process_interval_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    10
}

fn default_max_items_per_cycle() -> usize {
    200
}

fn validate_delay_bounds(config: &SyncConfig) -> Result<(), ValidationError> {
    if config.base_delay_ms > config.max_delay_ms {
        let mut error = ValidationError::new("delay_bounds");
        error.message = Some("base_delay_ms must not exceed max_delay_ms".into());
        return Err(error);
    }
    Ok(())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            auto_process: default_auto_process(),
            process_interval_ms: default_process_interval_ms(),
            batch_size: default_batch_size(),
            max_items_per_cycle: default_max_items_per_cycle(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Load defaults, then `path` (if given and present), then environment
    /// overrides such as `MEDICAMENTA_SYNC__MAX_RETRIES=3`.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let loaded: SyncConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    /// Backoff before retry number `retry_count` (1-based):
    /// `min(base_delay_ms * 2^(retry_count - 1), max_delay_ms)`
    pub fn backoff_delay(&self, retry_count: u32) -> chrono::Duration {
        let exponent = retry_count.saturating_sub(1);
        let factor = 2_u64.checked_pow(exponent).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }
}

/// Partial update applied by `update_config`; `None` leaves a field as is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub auto_process: Option<bool>,
    pub process_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_items_per_cycle: Option<usize>,
    pub conflict_policy: Option<ConflictPolicy>,
}

impl ConfigUpdate {
    fn apply_to(&self, config: &mut SyncConfig) {
        if let Some(value) = self.max_retries {
            config.max_retries = value;
        }
        if let Some(value) = self.base_delay_ms {
            config.base_delay_ms = value;
        }
        if let Some(value) = self.max_delay_ms {
            config.max_delay_ms = value;
        }
        if let Some(value) = self.auto_process {
            config.auto_process = value;
        }
        if let Some(value) = self.process_interval_ms {
            config.process_interval_ms = value;
        }
        if let Some(value) = self.batch_size {
            config.batch_size = value;
        }
        if let Some(value) = self.max_items_per_cycle {
            config.max_items_per_cycle = value;
        }
        if let Some(value) = self.conflict_policy {
            config.conflict_policy = value;
        }
    }
}

/// Shared, live configuration
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<SyncConfig>>,
}

impl ConfigHandle {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> SyncConfig {
        self.inner.read().clone()
    }

    /// Apply `update`; rejected as a whole if the result would be invalid
    pub fn update(&self, update: &ConfigUpdate) -> SyncResult<SyncConfig> {
        let mut guard = self.inner.write();
        let mut candidate = guard.clone();
        update.apply_to(&mut candidate);
        candidate.validate()?;
        *guard = candidate.clone();

        tracing::info!(config = ?candidate, "Sync configuration updated");
        Ok(candidate)
    }

    /// Restore the built-in defaults
    pub fn reset(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        *self.inner.write() = defaults.clone();
        tracing::info!("Sync configuration reset to defaults");
        defaults
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SyncConfig::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.conflict_policy, ConflictPolicy::Manual);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = SyncConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            ..SyncConfig::default()
        };
        assert_eq!(config.backoff_delay(1).num_milliseconds(), 1_000);
        assert_eq!(config.backoff_delay(2).num_milliseconds(), 2_000);
        assert_eq!(config.backoff_delay(3).num_milliseconds(), 4_000);
        assert_eq!(config.backoff_delay(4).num_milliseconds(), 5_000);
        assert_eq!(config.backoff_delay(64).num_milliseconds(), 5_000);
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_bounded(
            base in 0_u64..10_000,
            extra in 0_u64..1_000_000,
            retry in 1_u32..80,
        ) {
            let config = SyncConfig {
                base_delay_ms: base,
                max_delay_ms: base + extra,
                ..SyncConfig::default()
            };
            let current = config.backoff_delay(retry);
            let next = config.backoff_delay(retry + 1);
            prop_assert!(next >= current);
            prop_assert!(next.num_milliseconds() <= i64::try_from(base + extra).unwrap());
        }
    }

    #[test]
    fn test_update_rejects_inverted_delays() {
        let handle = ConfigHandle::default();
        let result = handle.update(&ConfigUpdate {
            base_delay_ms: Some(10_000),
            max_delay_ms: Some(1_000),
            ..ConfigUpdate::default()
        });
        assert!(result.is_err());
        assert_eq!(handle.snapshot(), SyncConfig::default());
    }

    #[test]
    fn test_update_and_reset() {
        let handle = ConfigHandle::default();
        let updated = handle
            .update(&ConfigUpdate {
                max_retries: Some(2),
                auto_process: Some(false),
                ..ConfigUpdate::default()
            })
            .unwrap();
        assert_eq!(updated.max_retries, 2);
        assert!(!handle.snapshot().auto_process);

        handle.reset();
        assert_eq!(handle.snapshot(), SyncConfig::default());
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        assert!(ConfigHandle::new(SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        })
        .is_err());
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"max_retries": 2, "conflict_policy": "last-writer-wins"}}"#).unwrap();

        let config = SyncConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriterWins);
        assert_eq!(config.batch_size, default_batch_size());
    }
}
