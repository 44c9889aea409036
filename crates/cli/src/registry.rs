// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent presence registry: one TTL'd record per live agent, plus change
//! events on a well-known channel so consoles can update reactively.
//!
//! Records expire if the heartbeat stops refreshing them, so the listing
//! converges on the set of live agents without any reaper process.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::{keys, Bus, Subscription};
use crate::defaults::HEARTBEAT_TTL;
use crate::error::{CrewResult, ErrorInfo};

/// Lifecycle states an agent reports through its presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Init,
    Registered,
    Idle,
    Busy,
    Disconnected,
    Shutdown,
    Standalone,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Registered => "registered",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
            Self::Standalone => "standalone",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence record stored at `agents:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub project: String,
    pub model: String,
    pub cwd: String,
    pub host: String,
    pub pid: u32,
    /// UTC ISO-8601 start timestamp.
    pub started_at: String,
    pub state: AgentState,
    /// Context usage fraction in [0, 1].
    pub ctx_pct: f64,
}

/// A registry change published on `registry:events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryEvent {
    Added { agent: AgentRecord },
    Updated { agent: AgentRecord },
    Removed { agent_id: String },
}

/// Bus-backed registry client, used by both agents and consoles.
#[derive(Clone)]
pub struct RegistryClient {
    bus: Arc<dyn Bus>,
}

impl RegistryClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Write (or refresh) an agent's presence record and announce it.
    pub async fn register(&self, record: &AgentRecord) -> CrewResult<()> {
        self.write_record(record)
            .await
            .map_err(|e| ErrorInfo::new("registry.register_failed", e.to_string()))?;
        self.announce(&RegistryEvent::Added { agent: record.clone() }).await;
        info!(agent_id = %record.id, "agent registered");
        Ok(())
    }

    /// Refresh the record TTL without announcing. Called from heartbeat.
    pub async fn refresh(&self, record: &AgentRecord) -> CrewResult<()> {
        self.write_record(record)
            .await
            .map_err(|e| ErrorInfo::new("registry.update_failed", e.to_string()))
    }

    /// Rewrite the stored record's state and context fraction, preserving
    /// every other field.
    pub async fn update_state(
        &self,
        agent_id: &str,
        state: AgentState,
        ctx_pct: f64,
    ) -> CrewResult<()> {
        let key = keys::registry_key(agent_id);
        let raw = self
            .bus
            .get_key(&key)
            .await
            .map_err(|e| ErrorInfo::new("registry.update_failed", e.to_string()))?;
        let Some(raw) = raw else {
            return Err(ErrorInfo::new(
                "registry.agent_not_found",
                format!("agent {agent_id} has no registry record"),
            ));
        };
        let mut record: AgentRecord = serde_json::from_slice(&raw)
            .map_err(|e| ErrorInfo::new("registry.update_failed", e.to_string()))?;
        record.state = state;
        record.ctx_pct = ctx_pct.clamp(0.0, 1.0);
        self.write_record(&record)
            .await
            .map_err(|e| ErrorInfo::new("registry.update_failed", e.to_string()))?;
        self.announce(&RegistryEvent::Updated { agent: record }).await;
        Ok(())
    }

    /// Remove an agent's record and announce the removal.
    pub async fn unregister(&self, agent_id: &str) -> CrewResult<()> {
        self.bus
            .delete_key(&keys::registry_key(agent_id))
            .await
            .map_err(|e| ErrorInfo::new("registry.unregister_failed", e.to_string()))?;
        self.announce(&RegistryEvent::Removed { agent_id: agent_id.to_owned() }).await;
        info!(agent_id = %agent_id, "agent unregistered");
        Ok(())
    }

    /// Enumerate live agents. Malformed records are skipped with a warning.
    pub async fn list(&self) -> CrewResult<Vec<AgentRecord>> {
        let names = self
            .bus
            .scan_keys(keys::REGISTRY_SCAN)
            .await
            .map_err(|e| ErrorInfo::new("registry.list_failed", e.to_string()))?;

        let mut records = Vec::with_capacity(names.len());
        for key in names {
            let Some(raw) = self
                .bus
                .get_key(&key)
                .await
                .map_err(|e| ErrorInfo::new("registry.list_failed", e.to_string()))?
            else {
                continue;
            };
            match serde_json::from_slice::<AgentRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "skipping malformed registry record"),
            }
        }
        Ok(records)
    }

    /// Fetch a single agent's record.
    pub async fn get(&self, agent_id: &str) -> CrewResult<Option<AgentRecord>> {
        let raw = self
            .bus
            .get_key(&keys::registry_key(agent_id))
            .await
            .map_err(|e| ErrorInfo::new("registry.list_failed", e.to_string()))?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| ErrorInfo::new("registry.list_failed", e.to_string())),
            None => Ok(None),
        }
    }

    /// Subscribe to registry change events. Consumers should still poll
    /// `list` occasionally; the contract is eventual convergence.
    pub async fn subscribe_events(&self) -> CrewResult<Subscription> {
        self.bus.subscribe(keys::REGISTRY_EVENTS_CHANNEL).await
    }

    /// Decode one change event; `None` for frames that do not parse.
    pub fn decode_event(raw: &[u8]) -> Option<RegistryEvent> {
        match serde_json::from_slice(raw) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "dropping malformed registry event");
                None
            }
        }
    }

    async fn write_record(&self, record: &AgentRecord) -> CrewResult<()> {
        let value = serde_json::to_vec(record)
            .map_err(|e| ErrorInfo::new("registry.register_failed", e.to_string()))?;
        self.bus
            .set_key(&keys::registry_key(&record.id), Bytes::from(value), Some(HEARTBEAT_TTL))
            .await
    }

    /// Publish a change event; failures are logged, not surfaced, because
    /// polling covers convergence.
    async fn announce(&self, event: &RegistryEvent) {
        let Ok(value) = serde_json::to_vec(event) else { return };
        if let Err(e) = self.bus.publish(keys::REGISTRY_EVENTS_CHANNEL, Bytes::from(value)).await {
            warn!(error = %e, "registry event publish failed");
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
