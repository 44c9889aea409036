// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exclusive-writer ownership protocol.
//!
//! At most one console session holds the writer role on an agent at a time.
//! The role is a TTL'd record at `agent:owner:<id>`; the session id doubles
//! as the owner token presented with mutating RPCs. Graceful takeover sends
//! a single-shot notification to the current holder and waits out a grace
//! window before forcing the issue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::{keys, Bus};
use crate::clock::now_ts;
use crate::defaults::{OWNERSHIP_TTL, TAKEOVER_POLL};
use crate::error::{CrewResult, ErrorInfo};

/// Record stored at `agent:owner:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub session_id: String,
    pub acquired_at: f64,
    pub pid: u32,
}

/// Single-shot takeover notification stored at `takeover:notify:<sid>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeoverNotice {
    pub agent_id: String,
    pub new_session: String,
    pub grace_secs: u64,
    pub ts: f64,
}

/// Console-side ownership manager. One per console session; the generated
/// session id is the opaque token handed back by [`acquire`](Self::acquire).
pub struct OwnershipManager {
    bus: Arc<dyn Bus>,
    session_id: String,
}

impl OwnershipManager {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus, session_id: uuid::Uuid::new_v4().to_string() }
    }

    /// Fixed session id, for tests and reconnects.
    pub fn with_session_id(bus: Arc<dyn Bus>, session_id: String) -> Self {
        Self { bus, session_id }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Acquire the writer role. With `takeover`, an existing holder is
    /// notified and given `grace` to let go before the record is deleted
    /// out from under it.
    pub async fn acquire(
        &self,
        agent_id: &str,
        takeover: bool,
        grace: Duration,
    ) -> CrewResult<String> {
        if takeover {
            self.graceful_takeover(agent_id, grace).await?;
        }

        let record = OwnerRecord {
            session_id: self.session_id.clone(),
            acquired_at: now_ts(),
            pid: std::process::id(),
        };
        let value = encode(&record)?;
        let key = keys::owner_key(agent_id);

        if self.bus.set_if_absent(&key, value, Some(OWNERSHIP_TTL)).await? {
            info!(agent_id = %agent_id, session_id = %self.session_id, "ownership acquired");
            return Ok(self.session_id.clone());
        }

        // Contended. Re-acquiring our own record is a success.
        if let Some(existing) = self.read_owner(agent_id).await? {
            if existing.session_id == self.session_id {
                return Ok(self.session_id.clone());
            }
        }
        Err(ErrorInfo::new(
            "ownership.denied",
            format!("agent {agent_id} is owned by another console"),
        ))
    }

    /// Release the writer role. The caller must present the token returned
    /// by acquire; a mismatch leaves the record untouched.
    pub async fn release(&self, agent_id: &str, token: &str) -> CrewResult<()> {
        let key = keys::owner_key(agent_id);
        match self.read_owner(agent_id).await? {
            Some(record) if record.session_id == token => {
                self.bus.delete_key(&key).await?;
                info!(agent_id = %agent_id, session_id = %token, "ownership released");
                Ok(())
            }
            _ => Err(ErrorInfo::new(
                "ownership.not_owner",
                format!("session {token} does not own agent {agent_id}"),
            )),
        }
    }

    /// True when `token` matches the live ownership record.
    pub async fn is_owner(&self, agent_id: &str, token: &str) -> CrewResult<bool> {
        Ok(self
            .read_owner(agent_id)
            .await?
            .map(|record| record.session_id == token)
            .unwrap_or(false))
    }

    /// Refresh the record TTL. Fails with `ownership.not_owner` when the
    /// token is stale and `ownership.lock_missing` when the record vanished.
    pub async fn refresh(&self, agent_id: &str, token: &str) -> CrewResult<()> {
        match self.read_owner(agent_id).await? {
            Some(record) if record.session_id == token => {
                let value = encode(&record)?;
                self.bus
                    .set_key(&keys::owner_key(agent_id), value, Some(OWNERSHIP_TTL))
                    .await
                    .map_err(|e| ErrorInfo::new("ownership.refresh_failed", e.to_string()))
            }
            Some(_) => Err(ErrorInfo::new(
                "ownership.not_owner",
                format!("session {token} does not own agent {agent_id}"),
            )),
            None => Err(ErrorInfo::new(
                "ownership.lock_missing",
                format!("no ownership record for agent {agent_id}"),
            )),
        }
    }

    /// Read-and-delete this session's pending takeover notification, if any.
    pub async fn check_takeover_notification(&self) -> CrewResult<Option<TakeoverNotice>> {
        let key = keys::takeover_key(&self.session_id);
        let Some(raw) = self.bus.get_key(&key).await? else { return Ok(None) };
        self.bus.delete_key(&key).await?;
        match serde_json::from_slice::<TakeoverNotice>(&raw) {
            Ok(notice) => {
                warn!(
                    agent_id = %notice.agent_id,
                    new_session = %notice.new_session,
                    "takeover notification received"
                );
                Ok(Some(notice))
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed takeover notification");
                Ok(None)
            }
        }
    }

    /// Wait out the grace window: notify the holder, then poll until the
    /// record disappears, becomes ours, or the window expires (forced
    /// delete). A third session winning mid-window is a conflict.
    async fn graceful_takeover(&self, agent_id: &str, grace: Duration) -> CrewResult<()> {
        let key = keys::owner_key(agent_id);
        let Some(existing) = self.read_owner(agent_id).await? else {
            return Ok(());
        };
        if existing.session_id == self.session_id {
            return Ok(());
        }

        self.send_notice(agent_id, &existing.session_id, grace).await?;
        info!(
            agent_id = %agent_id,
            holder = %existing.session_id,
            grace_secs = grace.as_secs(),
            "graceful takeover started"
        );

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(TAKEOVER_POLL.min(grace)).await;
            match self.read_owner(agent_id).await? {
                None => return Ok(()),
                Some(current) if current.session_id == self.session_id => return Ok(()),
                Some(current) if current.session_id != existing.session_id => {
                    return Err(ErrorInfo::new(
                        "ownership.takeover_conflict",
                        format!("another session took over agent {agent_id} during grace"),
                    ));
                }
                Some(_) => {}
            }
        }

        warn!(agent_id = %agent_id, holder = %existing.session_id, "grace expired, forcing takeover");
        self.bus.delete_key(&key).await?;
        Ok(())
    }

    async fn send_notice(
        &self,
        agent_id: &str,
        holder_session: &str,
        grace: Duration,
    ) -> CrewResult<()> {
        let notice = TakeoverNotice {
            agent_id: agent_id.to_owned(),
            new_session: self.session_id.clone(),
            grace_secs: grace.as_secs(),
            ts: now_ts(),
        };
        let value = serde_json::to_vec(&notice)
            .map_err(|e| ErrorInfo::new("ownership.denied", e.to_string()))?;
        // Slightly outlives the grace window so a slow poller still sees it.
        let ttl = grace + Duration::from_secs(10);
        self.bus
            .set_key(&keys::takeover_key(holder_session), Bytes::from(value), Some(ttl))
            .await
    }

    async fn read_owner(&self, agent_id: &str) -> CrewResult<Option<OwnerRecord>> {
        let raw = self.bus.get_key(&keys::owner_key(agent_id)).await?;
        match raw {
            Some(raw) => match serde_json::from_slice(&raw) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    // An unreadable record cannot be verified; treat the
                    // lock as free rather than wedging the agent forever.
                    warn!(agent_id = %agent_id, error = %e, "discarding malformed owner record");
                    self.bus.delete_key(&keys::owner_key(agent_id)).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

fn encode(record: &OwnerRecord) -> CrewResult<Bytes> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|e| ErrorInfo::new("ownership.denied", e.to_string()))
}

/// Capability interface the RPC server uses to vet mutating calls.
///
/// The production implementation resolves the live ownership record on the
/// bus; standalone mode substitutes an oracle that grants everything.
#[async_trait]
pub trait OwnershipOracle: Send + Sync {
    async fn is_owner(&self, agent_id: &str, token: &str) -> CrewResult<bool>;
}

/// Oracle backed by the real ownership record.
pub struct BusOwnershipOracle {
    bus: Arc<dyn Bus>,
}

impl BusOwnershipOracle {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl OwnershipOracle for BusOwnershipOracle {
    async fn is_owner(&self, agent_id: &str, token: &str) -> CrewResult<bool> {
        if token.is_empty() {
            return Ok(false);
        }
        let raw = self.bus.get_key(&keys::owner_key(agent_id)).await?;
        let Some(raw) = raw else { return Ok(false) };
        match serde_json::from_slice::<OwnerRecord>(&raw) {
            Ok(record) => Ok(record.session_id == token),
            Err(_) => Ok(false),
        }
    }
}

/// Oracle for standalone mode: every caller is the writer.
pub struct GrantAllOracle;

#[async_trait]
impl OwnershipOracle for GrantAllOracle {
    async fn is_owner(&self, _agent_id: &str, _token: &str) -> CrewResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
#[path = "ownership_tests.rs"]
mod tests;
