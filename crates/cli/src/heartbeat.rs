// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Heartbeat service (agent side) and heartbeat monitor (console side).
//!
//! The service ticks every [`HEARTBEAT_INTERVAL`], refreshing the heartbeat
//! key, the single-instance lock, and the registry record in one pass. Tick
//! failures are logged and retried on the next tick; the loop never aborts.
//!
//! The monitor scans heartbeat keys and reports agents whose last beat is
//! older than 1.5x the declared TTL. Reports fan out on a broadcast channel;
//! interested parties subscribe a receiver.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{keys, Bus};
use crate::clock::now_ts;
use crate::defaults::{HEARTBEAT_INTERVAL, HEARTBEAT_TTL};
use crate::error::CrewResult;
use crate::identity::AgentIdentity;
use crate::registry::{AgentRecord, RegistryClient};

/// Value stored under `heartbeat:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatValue {
    pub ts: f64,
    pub pid: u32,
}

/// Periodic presence refresher owned by the agent process.
pub struct HeartbeatService {
    agent_id: String,
    bus: Arc<dyn Bus>,
    identity: Arc<AgentIdentity>,
    registry: RegistryClient,
    /// Live presence record; the agent app mutates state/ctx_pct in place
    /// and each tick rewrites the registry from this snapshot.
    record: Arc<Mutex<AgentRecord>>,
    interval: Duration,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    pub fn new(
        bus: Arc<dyn Bus>,
        identity: Arc<AgentIdentity>,
        registry: RegistryClient,
        record: Arc<Mutex<AgentRecord>>,
    ) -> Self {
        let agent_id = identity.agent_id().to_owned();
        Self {
            agent_id,
            bus,
            identity,
            registry,
            record,
            interval: HEARTBEAT_INTERVAL,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Override the tick period (tests).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the tick loop.
    pub fn start(&mut self) {
        let bus = self.bus.clone();
        let identity = self.identity.clone();
        let registry = self.registry.clone();
        let record = self.record.clone();
        let agent_id = self.agent_id.clone();
        let interval = self.interval;
        let shutdown = self.shutdown.clone();

        self.handle = Some(tokio::spawn(async move {
            info!(agent_id = %agent_id, "heartbeat started");
            loop {
                tick(&bus, &identity, &registry, &record, &agent_id).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            info!(agent_id = %agent_id, "heartbeat stopped");
        }));
    }

    /// Stop the tick loop and wait for it to wind down.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// One heartbeat pass. Failures are logged and swallowed so the loop
/// survives transient bus outages.
async fn tick(
    bus: &Arc<dyn Bus>,
    identity: &AgentIdentity,
    registry: &RegistryClient,
    record: &Mutex<AgentRecord>,
    agent_id: &str,
) {
    let value = HeartbeatValue { ts: now_ts(), pid: std::process::id() };
    match serde_json::to_vec(&value) {
        Ok(raw) => {
            if let Err(e) = bus
                .set_key(&keys::heartbeat_key(agent_id), Bytes::from(raw), Some(HEARTBEAT_TTL))
                .await
            {
                warn!(agent_id = %agent_id, error = %e, "heartbeat write failed");
            }
        }
        Err(e) => warn!(agent_id = %agent_id, error = %e, "heartbeat encode failed"),
    }

    if let Err(e) = identity.refresh_lock().await {
        warn!(agent_id = %agent_id, error = %e, "lock refresh failed");
    }

    let snapshot = record.lock().clone();
    if let Err(e) = registry.refresh(&snapshot).await {
        warn!(agent_id = %agent_id, error = %e, "registry refresh failed");
    }
    debug!(agent_id = %agent_id, "heartbeat tick");
}

/// Why the monitor considers an agent disconnected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    StaleHeartbeat,
    ParseError,
}

/// A disconnection report from the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleReport {
    pub agent_id: String,
    pub reason: StaleReason,
    pub last_seen: Option<f64>,
}

/// Console-side detector for agents that stopped beating.
pub struct HeartbeatMonitor {
    bus: Arc<dyn Bus>,
    check_interval: Duration,
    reports: broadcast::Sender<StaleReport>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn new(bus: Arc<dyn Bus>, check_interval: Duration) -> Self {
        let (reports, _) = broadcast::channel(64);
        Self { bus, check_interval, reports, shutdown: CancellationToken::new(), handle: None }
    }

    /// Receive disconnection reports.
    pub fn subscribe(&self) -> broadcast::Receiver<StaleReport> {
        self.reports.subscribe()
    }

    pub fn start(&mut self) {
        let bus = self.bus.clone();
        let reports = self.reports.clone();
        let interval = self.check_interval;
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move {
            loop {
                match sweep(&bus).await {
                    Ok(stale) => {
                        for report in stale {
                            let _ = reports.send(report);
                        }
                    }
                    Err(e) => warn!(error = %e, "heartbeat sweep failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Scan all heartbeat keys and collect agents that look dead.
async fn sweep(bus: &Arc<dyn Bus>) -> CrewResult<Vec<StaleReport>> {
    let stale_after = HEARTBEAT_TTL.as_secs_f64() * 1.5;
    let now = now_ts();
    let mut out = Vec::new();

    for key in bus.scan_keys(keys::HEARTBEAT_SCAN).await? {
        let agent_id = key.trim_start_matches("heartbeat:").to_owned();
        let Some(raw) = bus.get_key(&key).await? else { continue };
        match serde_json::from_slice::<HeartbeatValue>(&raw) {
            Ok(value) => {
                if now - value.ts > stale_after {
                    out.push(StaleReport {
                        agent_id,
                        reason: StaleReason::StaleHeartbeat,
                        last_seen: Some(value.ts),
                    });
                }
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "unparseable heartbeat value");
                out.push(StaleReport { agent_id, reason: StaleReason::ParseError, last_seen: None });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
