// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use crate::bus::memory::MemoryBus;
use crate::clock::iso8601_now;
use crate::registry::AgentState;

use super::*;

fn record(id: &str) -> AgentRecord {
    AgentRecord {
        id: id.to_owned(),
        name: "a".to_owned(),
        project: "demo".to_owned(),
        model: "echo".to_owned(),
        cwd: "/work/a".to_owned(),
        host: "testhost".to_owned(),
        pid: std::process::id(),
        started_at: iso8601_now(),
        state: AgentState::Registered,
        ctx_pct: 0.0,
    }
}

#[tokio::test]
async fn tick_refreshes_heartbeat_lock_and_registry() -> anyhow::Result<()> {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let identity = Arc::new(AgentIdentity::new("demo/a".to_owned(), bus.clone()));
    identity.acquire_lock().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let registry = RegistryClient::new(bus.clone());
    let rec = Arc::new(Mutex::new(record("demo/a")));
    let snapshot = rec.lock().clone();
    registry.register(&snapshot).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut service = HeartbeatService::new(bus.clone(), identity, registry.clone(), rec.clone())
        .with_interval(Duration::from_millis(10));
    service.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let hb = bus
        .get_key(&keys::heartbeat_key("demo/a"))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .ok_or_else(|| anyhow::anyhow!("no heartbeat written"))?;
    let value: HeartbeatValue = serde_json::from_slice(&hb)?;
    assert!(value.ts > 0.0);
    assert_eq!(value.pid, std::process::id());

    // State changes made between ticks land in the registry record.
    rec.lock().state = AgentState::Busy;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let listed = registry.list().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(listed[0].state, AgentState::Busy);

    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn tick_survives_bus_failures() -> anyhow::Result<()> {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let identity = Arc::new(AgentIdentity::new("demo/a".to_owned(), bus.clone()));
    let registry = RegistryClient::new(bus.clone());
    let rec = Arc::new(Mutex::new(record("demo/a")));

    let mut service = HeartbeatService::new(bus.clone(), identity, registry, rec)
        .with_interval(Duration::from_millis(10));
    service.start();
    bus.close().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    // Ticks now fail; the loop must keep running until stopped.
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn monitor_reports_stale_and_unparseable_beats() -> anyhow::Result<()> {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());

    // Fresh beat: not reported. Stale beat: reported. Garbage: reported.
    let fresh = serde_json::to_vec(&HeartbeatValue { ts: now_ts(), pid: 1 })?;
    let stale = serde_json::to_vec(&HeartbeatValue {
        ts: now_ts() - HEARTBEAT_TTL.as_secs_f64() * 2.0,
        pid: 2,
    })?;
    bus.set_key("heartbeat:demo/fresh", fresh.into(), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    bus.set_key("heartbeat:demo/stale", stale.into(), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    bus.set_key("heartbeat:demo/garbage", bytes::Bytes::from_static(b"nope"), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut monitor = HeartbeatMonitor::new(bus, Duration::from_millis(10));
    let mut reports = monitor.subscribe();
    monitor.start();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let report = tokio::time::timeout(Duration::from_secs(1), reports.recv()).await??;
        seen.push(report);
    }
    monitor.stop().await;

    seen.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    assert_eq!(seen[0].agent_id, "demo/garbage");
    assert_eq!(seen[0].reason, StaleReason::ParseError);
    assert_eq!(seen[1].agent_id, "demo/stale");
    assert_eq!(seen[1].reason, StaleReason::StaleHeartbeat);
    Ok(())
}
