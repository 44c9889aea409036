// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::bus::memory::MemoryBus;

use super::*;

async fn service_in(
    bus: &MemoryBus,
    dir: &tempfile::TempDir,
) -> anyhow::Result<OrchestratorService> {
    OrchestratorService::start(
        Arc::new(bus.clone()),
        dir.path().join("orchestrator"),
        "nats://127.0.0.1:4222".to_owned(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))
}

#[tokio::test]
async fn create_list_delete_cycle() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir()?;
    let mut service = service_in(&bus, &dir).await?;
    let client = OrchestratorClient::new(Arc::new(bus.clone()));

    let agent_id = client
        .create_agent("demo", "worker", "/tmp/worker", "echo", Some("You fix builds."), &[])
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(agent_id, "demo/worker");

    let agents = client.list_agents().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].id, "demo/worker");
    assert_eq!(agents[0].model, "echo");

    client.delete_agent("demo/worker").await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(client.list_agents().await.map_err(|e| anyhow::anyhow!("{e}"))?.is_empty());

    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn create_persists_across_service_restart() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir()?;
    let mut service = service_in(&bus, &dir).await?;
    let client = OrchestratorClient::new(Arc::new(bus.clone()));
    client
        .create_agent("demo", "a", "/tmp/a", "echo", None, &["seed.md".to_owned()])
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    service.stop().await;

    let mut service = service_in(&bus, &dir).await?;
    let agents = client.list_agents().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].kb_seeds, vec!["seed.md".to_owned()]);
    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_create_is_refused() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir()?;
    let mut service = service_in(&bus, &dir).await?;
    let client = OrchestratorClient::new(Arc::new(bus.clone()));

    client
        .create_agent("demo", "a", "/tmp/a", "echo", None, &[])
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let err = match client.create_agent("demo", "a", "/tmp/a", "echo", None, &[]).await {
        Err(e) => e,
        Ok(id) => anyhow::bail!("duplicate create returned {id}"),
    };
    assert_eq!(err.code, "orchestrator.create_failed");
    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn create_seeds_system_base_file() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir()?;
    let cwd = tempfile::tempdir()?;
    let mut service = service_in(&bus, &dir).await?;
    let client = OrchestratorClient::new(Arc::new(bus.clone()));

    client
        .create_agent(
            "demo",
            "seeded",
            &cwd.path().to_string_lossy(),
            "echo",
            Some("You are the deploy captain."),
            &[],
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let base = std::fs::read_to_string(
        cwd.path().join(".crew/agents/seeded/system_base.md"),
    )?;
    assert_eq!(base, "You are the deploy captain.");
    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn remote_spawn_returns_command_line() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir()?;
    let mut service = service_in(&bus, &dir).await?;
    let client = OrchestratorClient::new(Arc::new(bus.clone()));

    client
        .create_agent("demo", "a", "/srv/agents/a", "echo", None, &[])
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let command = client
        .spawn_agent("demo/a", true)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .ok_or_else(|| anyhow::anyhow!("no command returned"))?;
    assert_eq!(
        command,
        "crew agent --bus nats://127.0.0.1:4222 --cwd /srv/agents/a --project demo --name a"
    );
    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn spawn_unknown_agent_fails() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir()?;
    let mut service = service_in(&bus, &dir).await?;
    let client = OrchestratorClient::new(Arc::new(bus.clone()));

    let err = match client.spawn_agent("demo/ghost", true).await {
        Err(e) => e,
        Ok(v) => anyhow::bail!("spawned unknown agent: {v:?}"),
    };
    assert_eq!(err.code, "orchestrator.spawn_failed");
    service.stop().await;
    Ok(())
}
