// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios across agent, console session, and bus.

use std::sync::Arc;
use std::time::Duration;

use crew::agent::{exit_code_for, AgentApp, AgentConfig};
use crew::bus::memory::MemoryBus;
use crew::history::{HistoryStore, Role, Turn};
use crew::ownership::OwnershipManager;
use crew::rpc::{Method, Params, RpcClient};
use crew::session::AttachOptions;
use crew::summarize::{Strategy, SummarizeConfig};
use crew::tail::TailEvent;
use crew_specs::{attach_collecting, spawn_agent};
use serde_json::json;

fn turn(role: Role, content: &str, tokens: u32, tool_calls: Option<serde_json::Value>) -> Turn {
    Turn {
        ts: crew::clock::now_ts(),
        role,
        source: "console".to_owned(),
        content: content.to_owned(),
        tokens_in: tokens / 2,
        tokens_out: tokens - tokens / 2,
        tool_calls,
    }
}

/// Scenario 1: two agents deriving the same id on one bus — the second
/// bootstrap reports `agent.duplicate`, which maps to exit code 11.
#[tokio::test]
async fn duplicate_agent_exits_with_code_11() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let mut first = spawn_agent(&bus, "demo", "a").await?;
    assert_eq!(first.app.agent_id(), "demo/a");

    let dir = tempfile::tempdir()?;
    let mut config = AgentConfig::new(dir.path().to_path_buf());
    config.project_override = Some("demo".to_owned());
    config.name_override = Some("a".to_owned());
    let err = match AgentApp::bootstrap(config, Some(Arc::new(bus.clone())), None).await {
        Err(e) => e,
        Ok(_) => anyhow::bail!("second demo/a bootstrapped"),
    };
    assert_eq!(err.code, "agent.duplicate");
    assert_eq!(exit_code_for(&err), 11);

    first.app.shutdown().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Scenario 2: attach, push input, watch task.start / token+ / task.end on
/// the tail within 5 s; the history log ends with an assistant turn.
#[tokio::test]
async fn attach_input_token_stream() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let mut agent = spawn_agent(&bus, "demo", "a").await?;
    let (session, collected) =
        attach_collecting(&bus, "demo/a", AttachOptions::default()).await?;

    let qid = session.send_input("hi").await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(!qid.is_empty());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let saw_end = loop {
        if tokio::time::Instant::now() > deadline {
            break false;
        }
        let done = collected.lock().iter().any(|r| {
            matches!(&r.event, TailEvent::TaskEnd { id, ok } if *id == qid && *ok)
        });
        if done {
            break true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert!(saw_end, "no task.end within 5s");

    let events = collected.lock().clone();
    assert!(events.iter().any(
        |r| matches!(&r.event, TailEvent::TaskStart { id, .. } if *id == qid)
    ));
    assert!(
        events.iter().filter(|r| matches!(r.event, TailEvent::Token { .. })).count() >= 1,
        "no token events"
    );
    // Offsets are strictly increasing in arrival order.
    for pair in events.windows(2) {
        assert!(pair[0].offset < pair[1].offset);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let history = std::fs::read_to_string(agent.state_dir("a").join("history.jsonl"))?;
    let last = history.lines().last().ok_or_else(|| anyhow::anyhow!("empty history"))?;
    let last_turn: Turn = serde_json::from_str(last)?;
    assert_eq!(last_turn.role, Role::Assistant);

    session.detach().await;
    agent.app.shutdown().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Scenario 3: console B takes over with grace=2; A flips to read-only and
/// rejects input locally; B holds the writer role.
#[tokio::test]
async fn takeover_flips_first_console_to_read_only() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let mut agent = spawn_agent(&bus, "demo", "a").await?;

    let (console_a, _events_a) =
        attach_collecting(&bus, "demo/a", AttachOptions::default()).await?;
    let (console_b, _events_b) = attach_collecting(
        &bus,
        "demo/a",
        AttachOptions { takeover: true, grace: Duration::from_secs(2) },
    )
    .await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !console_a.is_read_only() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("console A never flipped to read-only");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let err = match console_a.send_input("rejected locally").await {
        Err(e) => e,
        Ok(qid) => anyhow::bail!("read-only console queued {qid}"),
    };
    assert_eq!(err.code, "ownership.not_owner");

    // B is the live writer end to end.
    let qid = console_b.send_input("accepted").await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(!qid.is_empty());

    console_a.detach().await;
    console_b.detach().await;
    agent.app.shutdown().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Scenario 4: history.clear demands confirm=true, then empties both the
/// turn log and the summary chain.
#[tokio::test]
async fn clear_history_requires_confirmation() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let mut agent = spawn_agent(&bus, "demo", "a").await?;

    agent.app.enqueue_local("seed some history").map_err(|e| anyhow::anyhow!("{e}"))?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while agent.app.history_size() < 2 {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("seeding task never finished");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let ownership = OwnershipManager::new(Arc::new(bus.clone()));
    let token = ownership
        .acquire("demo/a", false, Duration::ZERO)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let client = RpcClient::new(Arc::new(bus.clone()), "demo/a".to_owned());

    let mut params = Params::new();
    params.insert("token".to_owned(), json!(token));
    let err = match client.call(Method::HistoryClear, params.clone()).await {
        Err(e) => e,
        Ok(v) => anyhow::bail!("unconfirmed clear accepted: {v}"),
    };
    assert_eq!(err.code, "history.confirm_required");
    assert!(agent.app.history_size() > 0, "unconfirmed clear must not mutate");

    params.insert("confirm".to_owned(), json!(true));
    let reply = client.call(Method::HistoryClear, params).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(reply["ok"], true);
    assert_eq!(agent.app.history_size(), 0);
    assert!(!agent.state_dir("a").join("summary.jsonl").exists());

    agent.app.shutdown().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Scenario 5: six turns, the third carrying tool calls, summarized past
/// the token threshold — one preserved turn, five covered.
#[tokio::test]
async fn summarize_preserves_tool_call_turns() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = HistoryStore::open(
        dir.path().join("history.jsonl"),
        dir.path().join("summary.jsonl"),
        SummarizeConfig {
            strategy: Strategy::TokenBased,
            token_threshold: 100,
            ..SummarizeConfig::default()
        },
    );

    let third = turn(
        Role::Assistant,
        "ran the build tool",
        40,
        Some(json!([{"name": "os.exec", "arguments": {"cmd": "make"}}])),
    );
    for (k, t) in [
        turn(Role::User, "first", 40, None),
        turn(Role::Assistant, "second", 40, None),
        third.clone(),
        turn(Role::User, "fourth", 40, None),
        turn(Role::Assistant, "fifth", 40, None),
        turn(Role::User, "sixth", 40, None),
    ]
    .into_iter()
    .enumerate()
    {
        store.append(t).map_err(|e| anyhow::anyhow!("turn {k}: {e}"))?;
    }

    let summary = store.summarize(None).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(summary.turn_count, 5);
    assert_eq!(summary.preserved_turns, vec![third.clone()]);
    assert_eq!(store.turns(), vec![third]);
    assert_eq!(store.summaries().len(), 1);
    Ok(())
}

/// Scenario 6: summarize, add one more turn, restart the store — the
/// reconstructed context carries the summary text and the fresh turn.
#[tokio::test]
async fn restart_context_reconstruction() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = SummarizeConfig {
        strategy: Strategy::TokenBased,
        token_threshold: 60,
        ..SummarizeConfig::default()
    };
    let open = || {
        HistoryStore::open(
            dir.path().join("history.jsonl"),
            dir.path().join("summary.jsonl"),
            config.clone(),
        )
    };

    let store = open();
    for content in ["alpha", "beta", "gamma"] {
        store.append(turn(Role::User, content, 30, None)).map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    let summary = store.summarize(None).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    store
        .append(turn(Role::User, "after the summary", 10, None))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    drop(store);

    let reopened = open();
    let context = reopened.reconstruct_context(&[]);
    assert!(context.contains(&format!("Summary 1: {}", summary.content)));
    assert!(context.contains("User: after the summary"));
    assert!(!context.contains("User: alpha"));
    Ok(())
}
