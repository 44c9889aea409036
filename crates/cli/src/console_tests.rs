// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serial_test::serial;
use yare::parameterized;

use crate::agent::{AgentApp, AgentConfig};
use crate::bus::memory::MemoryBus;
use crate::orchestrator::OrchestratorService;

use super::*;

#[parameterized(
    ps = { "/ps", Command::Ps },
    ps_upper = { "/PS", Command::Ps },
    attach = { "/attach demo/a", Command::Attach("demo/a".to_owned()) },
    detach = { "/Detach", Command::Detach },
    input = { "/input fix the build", Command::Input("fix the build".to_owned()) },
    bare_text = { "fix the build", Command::Input("fix the build".to_owned()) },
    status = { "/status", Command::Status },
    who = { "/who", Command::Who },
    ctx = { "/ctx", Command::Ctx },
    sys_show = { "/sys show", Command::SysShow },
    sys_default = { "/sys", Command::SysShow },
    reload = { "/reloadsysprompt", Command::ReloadSysPrompt },
    clearhistory = { "/clearhistory", Command::ClearHistory },
    interrupt = { "/interrupt", Command::Interrupt },
    quit = { "/quit", Command::Quit },
    overlay = { "# stay concise", Command::Overlay("stay concise".to_owned()) },
    empty = { "   ", Command::Empty },
    agent_list = { "/agent list", Command::AgentList },
)]
fn parses(line: &str, expected: Command) {
    assert_eq!(parse_command(line), expected);
}

#[test]
fn parses_structured_commands() {
    assert_eq!(
        parse_command("/kb add notes/a.md notes/b.md"),
        Command::KbAdd(vec!["notes/a.md".to_owned(), "notes/b.md".to_owned()])
    );
    assert_eq!(
        parse_command("/kb search rollback steps"),
        Command::KbSearch("rollback steps".to_owned())
    );
    assert_eq!(
        parse_command("/kb copy-from demo/a id1 id2"),
        Command::KbCopyFrom {
            agent: "demo/a".to_owned(),
            ids: vec!["id1".to_owned(), "id2".to_owned()]
        }
    );
    assert_eq!(
        parse_command("/agent new demo worker /srv/w echo"),
        Command::AgentNew {
            project: "demo".to_owned(),
            name: "worker".to_owned(),
            cwd: "/srv/w".to_owned(),
            model: "echo".to_owned(),
        }
    );
    assert_eq!(
        parse_command("/agent delete demo/worker"),
        Command::AgentDelete("demo/worker".to_owned())
    );
    assert_eq!(
        parse_command("/offload helper triage the flaky tests"),
        Command::Offload { name: "helper".to_owned(), prompt: "triage the flaky tests".to_owned() }
    );
    assert_eq!(parse_command("/sys edit be brief"), Command::SysEdit("be brief".to_owned()));
}

#[test]
fn unknown_commands_carry_usage_hints() {
    for line in ["/reboot", "/attach", "/agent", "/kb", "/offload helper"] {
        assert!(matches!(parse_command(line), Command::Unknown(_)), "line {line}");
    }
}

fn console_on(bus: &MemoryBus) -> ConsoleApp {
    ConsoleApp::new(
        Arc::new(bus.clone()),
        false,
        Duration::from_secs(2),
        Redactor::new(&[]),
    )
}

#[tokio::test]
async fn ps_with_empty_registry() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let mut console = console_on(&bus);
    let out = console.handle_line("/ps").await;
    assert_eq!(out, vec!["no live agents".to_owned()]);
    console.handle_line("/quit").await;
    Ok(())
}

#[tokio::test]
async fn commands_requiring_attachment_explain_themselves() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let mut console = console_on(&bus);
    for line in ["/status", "/input hi", "# overlay line", "/clearhistory"] {
        let out = console.handle_line(line).await;
        assert!(
            out.iter().any(|l| l.contains("no attached agent")),
            "{line} -> {out:?}"
        );
    }
    console.handle_line("/quit").await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn attach_input_and_confirmed_clear() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bus = MemoryBus::new();
    let mut config = AgentConfig::new(dir.path().to_path_buf());
    config.project_override = Some("demo".to_owned());
    config.name_override = Some("a".to_owned());
    let mut agent = AgentApp::bootstrap(config, Some(Arc::new(bus.clone())), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut console = console_on(&bus);
    let out = console.handle_line("/attach demo/a").await;
    assert_eq!(out, vec!["attached to demo/a as writer".to_owned()]);

    let out = console.handle_line("/input hello agent").await;
    assert!(out[0].starts_with("queued "), "{out:?}");

    // Wait for the task to land in history.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while agent.history_size() < 2 {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("agent never processed input");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Destructive command: echoes the id, wrong answer aborts.
    let out = console.handle_line("/clearhistory").await;
    assert!(out.iter().any(|l| l.contains("type 'demo/a'")), "{out:?}");
    let out = console.handle_line("nope").await;
    assert_eq!(out, vec!["aborted".to_owned()]);
    assert!(agent.history_size() >= 2);

    // Exact re-entry proceeds.
    console.handle_line("/clearhistory").await;
    let out = console.handle_line("demo/a").await;
    assert_eq!(out, vec!["history cleared for demo/a".to_owned()]);
    assert_eq!(agent.history_size(), 0);

    console.handle_line("/quit").await;
    agent.shutdown().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

#[tokio::test]
async fn agent_lifecycle_via_orchestrator_commands() -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir()?;
    let cwd = tempfile::tempdir()?;
    let mut service = OrchestratorService::start(
        Arc::new(bus.clone()),
        dir.path().join("orchestrator"),
        "nats://127.0.0.1:4222".to_owned(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut console = console_on(&bus);
    let line = format!("/agent new demo worker {}", cwd.path().display());
    let out = console.handle_line(&line).await;
    assert_eq!(out, vec!["created demo/worker".to_owned()]);

    let out = console.handle_line("/agent list").await;
    assert!(out[0].starts_with("demo/worker"), "{out:?}");

    // Delete is confirmed by re-entering the id.
    console.handle_line("/agent delete demo/worker").await;
    let out = console.handle_line("demo/worker").await;
    assert_eq!(out, vec!["deleted demo/worker".to_owned()]);
    let out = console.handle_line("/agent list").await;
    assert_eq!(out, vec!["no configured agents".to_owned()]);

    console.handle_line("/quit").await;
    service.stop().await;
    Ok(())
}
