// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error values shared across the bus, RPC, and agent component boundaries.
//!
//! Errors never cross a component boundary as panics or anyhow chains;
//! they travel as [`ErrorInfo`] values with a dotted `prefix.kind` code
//! (e.g. `bus.publish_failed`, `ownership.denied`) so that replies can be
//! serialized onto the wire unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A tagged error value: code, human-readable message, optional detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ErrorInfo {
    /// Build an error from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), detail: None }
    }

    /// Attach a structured detail payload.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Returns `true` if the code starts with the given `prefix.` segment.
    pub fn is_kind(&self, prefix: &str) -> bool {
        self.code.split('.').next() == Some(prefix)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Component result type carried across every fallible seam.
pub type CrewResult<T> = Result<T, ErrorInfo>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
