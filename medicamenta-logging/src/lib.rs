//! Tracing setup and PHI/PII redaction for the Medicamenta sync engine
//!
//! Handler error messages and other free text may carry patient data (an
//! email echoed back by the server, a phone number in a validation error).
//! Anything that is not a structured identifier goes through [`redact`]
//! before it reaches a log line.
//!
//! # Detected Data Types
//!
//! - **Email Addresses**: `user@example.com` → `EMAIL[hash]` or `u***@e***`
//! - **Phone Numbers**: `(555) 123-4567` → `(***) ***-****`
//! - **SSN**: `123-45-6789` → `***-**-****`
//! - **Credit Cards**: `4111 1111 1111 1111` → `****-****-****-****`
//! - **IP Addresses**: `192.168.1.1` → `192.***.***.1`
//! - **Medical Record Numbers**: `MRN123456` → `MRN******`
//!
//! # Example
//!
//! ```no_run
//! use medicamenta_logging::{init, redact, LoggerConfig};
//!
//! init(&LoggerConfig::default()).ok();
//! tracing::warn!(error = %redact("rejected for ana@example.org"), "Sync failed");
//! ```

pub mod config;
pub mod redactor;

use std::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use thiserror::Error;
use tracing_subscriber::fmt::{self, time::ChronoUtc};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub use config::LoggerConfig;
pub use redactor::{PiiRedactor, RedactionConfig};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Tracing subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

static REDACTION_ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static! {
    static ref DEFAULT_REDACTOR: PiiRedactor = PiiRedactor::default();
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber is
/// already installed; the redaction setting is applied either way.
pub fn init(config: &LoggerConfig) -> Result<(), LoggingError> {
    set_redaction_enabled(config.redaction_enabled);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        // Structured JSON logging for production
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .try_init()
    };

    installed.map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))
}

/// Redact PHI/PII from `text` with the default redactor
pub fn redact(text: &str) -> String {
    if REDACTION_ENABLED.load(Ordering::Relaxed) {
        DEFAULT_REDACTOR.redact(text)
    } else {
        text.to_string()
    }
}

pub fn set_redaction_enabled(enabled: bool) {
    REDACTION_ENABLED.store(enabled, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_installs_once() {
        let config = LoggerConfig {
            level: "debug".to_string(),
            ..LoggerConfig::default()
        };
        assert!(init(&config).is_ok());
        assert!(matches!(init(&config), Err(LoggingError::AlreadyInitialized(_))));

        assert!(!redact("call 555-123-4567").contains("4567"));
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LoggerConfig {
            level: "medicamenta=[".to_string(),
            ..LoggerConfig::default()
        };
        // RUST_LOG, if set in the environment, would take precedence
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(init(&config), Err(LoggingError::InvalidFilter(_))));
        }
    }
}
