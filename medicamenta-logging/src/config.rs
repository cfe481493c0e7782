// Logger configuration
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Structured JSON output instead of human-readable lines
    pub json: bool,
    /// Redact PHI/PII from strings passed through [`crate::redact`]
    pub redaction_enabled: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            redaction_enabled: true,
        }
    }
}

impl LoggerConfig {
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.level = "debug".to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: LoggerConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(config.json);
        assert!(config.redaction_enabled);
        assert_eq!(config.level, "info");
        assert_eq!(config.verbose(true).level, "debug");
    }
}
