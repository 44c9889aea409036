// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use crate::bus::memory::MemoryBus;

use super::*;

fn manager(bus: &MemoryBus, sid: &str) -> OwnershipManager {
    OwnershipManager::with_session_id(Arc::new(bus.clone()), sid.to_owned())
}

#[tokio::test]
async fn acquire_release_cycle() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let a = manager(&bus, "sid-a");

    let token = a.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(token, "sid-a");
    assert!(a.is_owner("demo/a", &token).await.map_err(|e| anyhow::anyhow!("{e}"))?);

    a.release("demo/a", &token).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(!a.is_owner("demo/a", &token).await.map_err(|e| anyhow::anyhow!("{e}"))?);
    Ok(())
}

#[tokio::test]
async fn contended_acquire_is_denied() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let a = manager(&bus, "sid-a");
    let b = manager(&bus, "sid-b");

    a.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let err = match b.acquire("demo/a", false, Duration::ZERO).await {
        Err(e) => e,
        Ok(_) => anyhow::bail!("contended acquire succeeded"),
    };
    assert_eq!(err.code, "ownership.denied");
    Ok(())
}

#[tokio::test]
async fn reacquire_by_same_session_succeeds() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let a = manager(&bus, "sid-a");
    a.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let token = a.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(token, "sid-a");
    Ok(())
}

#[tokio::test]
async fn release_with_wrong_token_fails() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let a = manager(&bus, "sid-a");
    a.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let err = match a.release("demo/a", "sid-wrong").await {
        Err(e) => e,
        Ok(()) => anyhow::bail!("release with stale token succeeded"),
    };
    assert_eq!(err.code, "ownership.not_owner");
    // The record survives a failed release.
    assert!(a.is_owner("demo/a", "sid-a").await.map_err(|e| anyhow::anyhow!("{e}"))?);
    Ok(())
}

#[tokio::test]
async fn takeover_notifies_holder_and_forces_after_grace() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let holder = manager(&bus, "sid-holder");
    let intruder = manager(&bus, "sid-intruder");

    holder.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let token = intruder
        .acquire("demo/a", true, Duration::from_millis(50))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(token, "sid-intruder");

    // The holder finds its single-shot notification.
    let notice = holder
        .check_takeover_notification()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .ok_or_else(|| anyhow::anyhow!("no takeover notice"))?;
    assert_eq!(notice.agent_id, "demo/a");
    assert_eq!(notice.new_session, "sid-intruder");

    // Read-and-delete: a second check comes back empty.
    assert!(holder
        .check_takeover_notification()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .is_none());

    // The old token no longer passes the oracle.
    assert!(!intruder.is_owner("demo/a", "sid-holder").await.map_err(|e| anyhow::anyhow!("{e}"))?);
    assert!(intruder.is_owner("demo/a", "sid-intruder").await.map_err(|e| anyhow::anyhow!("{e}"))?);
    Ok(())
}

#[tokio::test]
async fn takeover_succeeds_early_when_holder_releases() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let holder = manager(&bus, "sid-holder");
    let intruder = manager(&bus, "sid-intruder");

    holder.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let release = {
        let bus = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let holder = OwnershipManager::with_session_id(Arc::new(bus), "sid-holder".to_owned());
            holder.release("demo/a", "sid-holder").await
        })
    };

    let token = intruder
        .acquire("demo/a", true, Duration::from_secs(5))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(token, "sid-intruder");
    release.await?.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

#[tokio::test]
async fn third_party_takeover_mid_grace_conflicts() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let holder = manager(&bus, "sid-holder");
    let intruder = manager(&bus, "sid-intruder");
    let third = manager(&bus, "sid-third");

    holder.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    // While the intruder waits, a third session force-grabs the record.
    let grab = {
        let bus = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus.delete_key(&keys::owner_key("demo/a")).await.map_err(|e| anyhow::anyhow!("{e}"))?;
            let third = OwnershipManager::with_session_id(Arc::new(bus), "sid-third".to_owned());
            third.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))
        })
    };
    let _ = third;

    let result = intruder.acquire("demo/a", true, Duration::from_secs(5)).await;
    grab.await??;
    let err = match result {
        Err(e) => e,
        Ok(_) => anyhow::bail!("takeover should have conflicted"),
    };
    assert_eq!(err.code, "ownership.takeover_conflict");
    Ok(())
}

#[tokio::test]
async fn bus_oracle_checks_live_record() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let a = manager(&bus, "sid-a");
    a.acquire("demo/a", false, Duration::ZERO).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let oracle = BusOwnershipOracle::new(Arc::new(bus.clone()));
    assert!(oracle.is_owner("demo/a", "sid-a").await.map_err(|e| anyhow::anyhow!("{e}"))?);
    assert!(!oracle.is_owner("demo/a", "sid-b").await.map_err(|e| anyhow::anyhow!("{e}"))?);
    assert!(!oracle.is_owner("demo/a", "").await.map_err(|e| anyhow::anyhow!("{e}"))?);

    // Delete the record out from under the holder — the token goes stale.
    bus.delete_key(&keys::owner_key("demo/a")).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(!oracle.is_owner("demo/a", "sid-a").await.map_err(|e| anyhow::anyhow!("{e}"))?);
    Ok(())
}
