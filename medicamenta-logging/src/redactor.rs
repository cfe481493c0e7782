use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref EMAIL_REGEX: Regex = compile(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b");
    static ref PHONE_REGEX: Regex = compile(r"(?:\+\d{1,3}[-.\s]?)?\(?\b\d{2,3}\)?[-.\s]?\d{3,5}[-.\s]?\d{4}\b");
    static ref SSN_REGEX: Regex = compile(r"\b\d{3}-\d{2}-\d{4}\b");
    static ref CREDIT_CARD_REGEX: Regex = compile(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b");
    static ref IP_REGEX: Regex = compile(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b");
    static ref MRN_REGEX: Regex = compile(r"(?i)\bMRN[-:\s]?\d{4,}\b");
}

// Patterns are literals exercised by the tests below
#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("redaction pattern must compile")
}

/// PII redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_ssn: bool,
    pub redact_credit_cards: bool,
    pub redact_ip_addresses: bool,
    pub redact_mrns: bool,
    /// Replace values with a short hash so repeated occurrences can be
    /// correlated across log lines
    pub hash_for_correlation: bool,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_emails: true,
            redact_phones: true,
            redact_ssn: true,
            redact_credit_cards: true,
            redact_ip_addresses: true,
            redact_mrns: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

impl RedactionConfig {
    pub fn with_custom_pattern(mut self, pattern: Regex, replacement: impl Into<String>) -> Self {
        self.custom_patterns.push((pattern, replacement.into()));
        self
    }
}

/// PII redactor for log messages
#[derive(Debug, Clone, Default)]
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.config.redact_emails {
            result = self.replace(&EMAIL_REGEX, &result, "EMAIL", |email| {
                let (user, domain) = email.split_once('@').unwrap_or((email, ""));
                format!("{}***@{}***", first_char(user), first_char(domain))
            });
        }
        // Cards, SSNs, MRNs and IPs before phones, whose pattern would
        // otherwise swallow parts of them
        if self.config.redact_credit_cards {
            result = self.replace(&CREDIT_CARD_REGEX, &result, "CC", |_| {
                "****-****-****-****".to_string()
            });
        }
        if self.config.redact_ssn {
            result = self.replace(&SSN_REGEX, &result, "SSN", |_| "***-**-****".to_string());
        }
        if self.config.redact_mrns {
            result = self.replace(&MRN_REGEX, &result, "MRN", |_| "MRN******".to_string());
        }
        if self.config.redact_ip_addresses {
            result = self.replace(&IP_REGEX, &result, "IP", |ip| {
                let octets: Vec<&str> = ip.split('.').collect();
                match (octets.first(), octets.last()) {
                    (Some(first), Some(last)) if octets.len() == 4 => format!("{first}.***.***.{last}"),
                    _ => "***.***.***.***".to_string(),
                }
            });
        }
        if self.config.redact_phones {
            result = self.replace(&PHONE_REGEX, &result, "PHONE", |_| "(***) ***-****".to_string());
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).into_owned();
        }

        result
    }

    fn replace(
        &self,
        pattern: &Regex,
        text: &str,
        label: &str,
        mask: impl Fn(&str) -> String,
    ) -> String {
        pattern
            .replace_all(text, |caps: &regex::Captures| {
                let value = caps.get(0).map_or("", |m| m.as_str());
                if self.config.hash_for_correlation {
                    format!("{label}[{}]", hash_value(value))
                } else {
                    mask(value)
                }
            })
            .into_owned()
    }
}

fn first_char(value: &str) -> String {
    value.chars().next().map(String::from).unwrap_or_default()
}

/// First 8 bytes of the SHA-256, base64 encoded
fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let prefix: Vec<u8> = digest.iter().take(8).copied().collect();
    general_purpose::STANDARD.encode(prefix)
}
