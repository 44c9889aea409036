// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Secret redaction for log values and user-visible messages.
//!
//! A [`Redactor`] is built once at process start and handed to the
//! components that format free-form text (console output, tail warnings,
//! RPC error messages). Patterns come from `CREW_SECRETS_PATTERNS`
//! (comma-separated regexes) or a built-in default set.

use regex::Regex;
use tracing::warn;

const REPLACEMENT: &str = "***REDACTED***";

/// Built-in patterns covering common credential shapes.
const DEFAULT_PATTERNS: &[&str] = &[
    // API keys, tokens, and passwords in key=value / key: value form
    r#"(?i)(api[_-]?key|token|secret|password|auth)\s*[=:]\s*["']?[A-Za-z0-9\-_]{16,}["']?"#,
    // Bus / database URLs with embedded credentials
    r"(?i)(redis|nats|postgresql|mysql|mongodb)://[^:\s]*:[^@\s]*@\S+",
    // JWT tokens
    r"eyJ[A-Za-z0-9\-_]+\.[A-Za-z0-9\-_]+\.[A-Za-z0-9\-_]+",
    // AWS credentials
    r#"(?i)(aws_access_key_id|aws_secret_access_key|aws_session_token)\s*[=:]\s*["']?[A-Za-z0-9\-_/+]{20,}["']?"#,
    // PEM private key blocks
    r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
];

/// Compiled redaction patterns applied to outbound text.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Build from explicit pattern strings. Invalid patterns are skipped
    /// with a warning rather than aborting startup.
    pub fn new(patterns: &[String]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            match Regex::new(p) {
                Ok(re) => compiled.push(re),
                Err(e) => warn!(pattern = %p, error = %e, "skipping invalid redaction pattern"),
            }
        }
        Self { patterns: compiled }
    }

    /// Build from `CREW_SECRETS_PATTERNS`, falling back to the defaults.
    pub fn from_env() -> Self {
        match std::env::var("CREW_SECRETS_PATTERNS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let patterns: Vec<String> =
                    raw.split(',').map(|p| p.trim().to_owned()).filter(|p| !p.is_empty()).collect();
                Self::new(&patterns)
            }
            _ => Self::new(
                &DEFAULT_PATTERNS.iter().map(|p| (*p).to_owned()).collect::<Vec<_>>(),
            ),
        }
    }

    /// Redact matches in a string.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for re in &self.patterns {
            out = re.replace_all(&out, REPLACEMENT).into_owned();
        }
        out
    }

    /// Redact string leaves of a JSON value in place.
    pub fn redact_value(&self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::String(s) => {
                let redacted = self.redact(s);
                if redacted != *s {
                    *s = redacted;
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.redact_value(item);
                }
            }
            serde_json::Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.redact_value(v);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "secrets_tests.rs"]
mod tests;
