// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent identity derivation and the single-instance bus lock.
//!
//! The id has the form `project/name`. Derivation is pure: the same inputs
//! always produce the same id, so restarting an agent in the same directory
//! reclaims the same bus namespace.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bus::{keys, Bus};
use crate::defaults::HEARTBEAT_TTL;
use crate::error::{CrewResult, ErrorInfo};

/// Inputs to id derivation, in override precedence order.
#[derive(Debug, Clone, Default)]
pub struct IdentityInputs {
    /// Working directory the agent owns.
    pub cwd: String,
    /// Directory containing the crew configuration (the parent of
    /// `.crew`), if discovered.
    pub config_dir: Option<String>,
    /// Project name from configuration.
    pub configured_project: Option<String>,
    /// Agent name from configuration.
    pub configured_name: Option<String>,
    /// Explicit `--project` override.
    pub project_override: Option<String>,
    /// Explicit `--name` override.
    pub name_override: Option<String>,
}

/// Derive the `project/name` agent id. Pure.
///
/// Project: explicit override, else configured project, else the basename
/// of the config directory. Name: explicit override, else configured name,
/// else the basename of the working directory. Segments are sanitized to
/// `[A-Za-z0-9_-]+`.
pub fn derive_agent_id(inputs: &IdentityInputs) -> CrewResult<String> {
    let project = first_nonempty(&[
        inputs.project_override.as_deref(),
        inputs.configured_project.as_deref(),
        inputs.config_dir.as_deref().map(basename).as_deref(),
        Some("default"),
    ]);
    let name = first_nonempty(&[
        inputs.name_override.as_deref(),
        inputs.configured_name.as_deref(),
        Some(&basename(&inputs.cwd)),
    ]);

    let project = sanitize_segment(&project);
    let name = sanitize_segment(&name);
    if project.is_empty() || name.is_empty() {
        return Err(ErrorInfo::new(
            "agent.no_config",
            "cannot derive an agent id from empty project or name",
        ));
    }
    Ok(format!("{project}/{name}"))
}

fn first_nonempty(candidates: &[Option<&str>]) -> String {
    candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_owned()
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Replace every character outside `[A-Za-z0-9_-]` with `-`, collapsing runs.
fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
            last_dash = ch == '-';
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_owned()
}

/// Value stored under the single-instance lock key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub host: String,
}

/// Holds the single-instance lock for one agent id on one bus.
pub struct AgentIdentity {
    agent_id: String,
    bus: Arc<dyn Bus>,
}

impl AgentIdentity {
    pub fn new(agent_id: String, bus: Arc<dyn Bus>) -> Self {
        Self { agent_id, bus }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Acquire the lock with conditional-set. Fails with `agent.duplicate`
    /// when another live process holds the id.
    pub async fn acquire_lock(&self) -> CrewResult<()> {
        let record = LockRecord { pid: std::process::id(), host: hostname() };
        let value = serde_json::to_vec(&record)
            .map_err(|e| ErrorInfo::new("agent.bootstrap_failed", e.to_string()))?;
        let created = self
            .bus
            .set_if_absent(&keys::lock_key(&self.agent_id), Bytes::from(value), Some(HEARTBEAT_TTL))
            .await?;
        if !created {
            return Err(ErrorInfo::new(
                "agent.duplicate",
                format!("agent {} is already running on this bus", self.agent_id),
            )
            .with_detail(serde_json::json!({ "agent_id": self.agent_id })));
        }
        info!(agent_id = %self.agent_id, "single-instance lock acquired");
        Ok(())
    }

    /// Refresh the lock TTL. Called from the heartbeat tick.
    pub async fn refresh_lock(&self) -> CrewResult<()> {
        let record = LockRecord { pid: std::process::id(), host: hostname() };
        let value = serde_json::to_vec(&record)
            .map_err(|e| ErrorInfo::new("agent.bootstrap_failed", e.to_string()))?;
        self.bus
            .set_key(&keys::lock_key(&self.agent_id), Bytes::from(value), Some(HEARTBEAT_TTL))
            .await?;
        debug!(agent_id = %self.agent_id, "lock refreshed");
        Ok(())
    }

    /// Release the lock on graceful shutdown. A crashed process simply
    /// lets the TTL expire.
    pub async fn release_lock(&self) -> CrewResult<()> {
        self.bus.delete_key(&keys::lock_key(&self.agent_id)).await?;
        info!(agent_id = %self.agent_id, "single-instance lock released");
        Ok(())
    }
}

/// Best-effort host name for presence records.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
