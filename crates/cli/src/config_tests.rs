// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use serial_test::serial;

use super::*;

fn agent_args(argv: &[&str]) -> anyhow::Result<AgentArgs> {
    let mut full = vec!["agent"];
    full.extend_from_slice(argv);
    AgentArgs::try_parse_from(full).map_err(|e| anyhow::anyhow!("{e}"))
}

#[test]
#[serial]
fn agent_defaults_to_the_default_bus() -> anyhow::Result<()> {
    std::env::remove_var("CREW_BUS_URL");
    let args = agent_args(&[])?;
    args.validate()?;
    assert_eq!(args.bus_url().as_deref(), Some(DEFAULT_BUS_URL));
    assert_eq!(args.model, "echo");
    assert_eq!(args.log_level, "info");
    assert_eq!(args.log_format, "json");
    Ok(())
}

#[test]
#[serial]
fn standalone_suppresses_bus() -> anyhow::Result<()> {
    std::env::remove_var("CREW_BUS_URL");
    let args = agent_args(&["--standalone"])?;
    args.validate()?;
    assert_eq!(args.bus_url(), None);
    Ok(())
}

#[test]
#[serial]
fn standalone_conflicts_with_explicit_bus() -> anyhow::Result<()> {
    std::env::remove_var("CREW_BUS_URL");
    let args = agent_args(&["--standalone", "--bus", "nats://elsewhere:4222"])?;
    assert!(args.validate().is_err());
    Ok(())
}

#[test]
#[serial]
fn overrides_are_parsed() -> anyhow::Result<()> {
    std::env::remove_var("CREW_BUS_URL");
    let args = agent_args(&[
        "--bus",
        "nats://bus.internal:4222",
        "--cwd",
        "/srv/agents/a",
        "--name",
        "a",
        "--project",
        "demo",
        "--log-level",
        "debug",
    ])?;
    args.validate()?;
    assert_eq!(args.bus_url().as_deref(), Some("nats://bus.internal:4222"));
    assert_eq!(args.workdir(), std::path::PathBuf::from("/srv/agents/a"));
    assert_eq!(args.name.as_deref(), Some("a"));
    assert_eq!(args.project.as_deref(), Some("demo"));
    assert_eq!(args.log_level, "debug");
    Ok(())
}

#[test]
#[serial]
fn bus_url_env_is_honored() -> anyhow::Result<()> {
    std::env::set_var("CREW_BUS_URL", "nats://from-env:4222");
    let args = agent_args(&[]);
    std::env::remove_var("CREW_BUS_URL");
    assert_eq!(args?.bus_url().as_deref(), Some("nats://from-env:4222"));
    Ok(())
}

#[test]
#[serial]
fn console_args_parse_takeover_and_grace() -> anyhow::Result<()> {
    std::env::remove_var("CREW_BUS_URL");
    let args = ConsoleArgs::try_parse_from([
        "console",
        "--takeover",
        "--grace-timeout",
        "5",
        "--no-ui",
    ])
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(args.takeover);
    assert!(args.no_ui);
    assert_eq!(args.grace_timeout, 5);
    assert_eq!(args.bus, DEFAULT_BUS_URL);
    Ok(())
}

#[test]
#[serial]
fn console_orchestrator_root_prefers_crew_home() -> anyhow::Result<()> {
    std::env::remove_var("CREW_BUS_URL");
    let args = ConsoleArgs::try_parse_from(["console", "--crew-home", "/srv/crew"])
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(args.orchestrator_root(), std::path::PathBuf::from("/srv/crew/orchestrator"));
    Ok(())
}
