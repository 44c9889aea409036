// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Default bus URL when neither the flag nor `CREW_BUS_URL` is set.
pub const DEFAULT_BUS_URL: &str = "nats://127.0.0.1:4222";

/// Arguments for `crew agent`.
#[derive(Debug, Parser)]
pub struct AgentArgs {
    /// Bus URL for distributed mode.
    #[arg(long, env = "CREW_BUS_URL")]
    pub bus: Option<String>,

    /// Run without a bus; local components only.
    #[arg(long)]
    pub standalone: bool,

    /// Working directory override.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Agent name override (defaults to the cwd basename).
    #[arg(long)]
    pub name: Option<String>,

    /// Project override (defaults to the config directory basename).
    #[arg(long)]
    pub project: Option<String>,

    /// Model id; unknown ids fall back to the echo model.
    #[arg(long, env = "CREW_MODEL", default_value = "echo")]
    pub model: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CREW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (json or plain).
    #[arg(long, env = "CREW_LOG_FORMAT", default_value = "json")]
    pub log_format: String,
}

impl AgentArgs {
    /// Validate the flag combination after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.standalone && self.bus.is_some() {
            anyhow::bail!("--standalone and --bus are mutually exclusive");
        }
        Ok(())
    }

    /// Resolved bus URL; `None` means standalone.
    pub fn bus_url(&self) -> Option<String> {
        if self.standalone {
            return None;
        }
        Some(self.bus.clone().unwrap_or_else(|| DEFAULT_BUS_URL.to_owned()))
    }

    /// Resolved working directory.
    pub fn workdir(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Arguments for `crew console`.
#[derive(Debug, Parser)]
pub struct ConsoleArgs {
    /// Bus URL.
    #[arg(long, env = "CREW_BUS_URL", default_value = DEFAULT_BUS_URL)]
    pub bus: String,

    /// Disable the panes UI (plain line mode). The current console is
    /// always line-based; the flag is accepted for forward compatibility.
    #[arg(long)]
    pub no_ui: bool,

    /// Take over agents that are already owned by another console.
    #[arg(long)]
    pub takeover: bool,

    /// Grace window in seconds granted to the current owner on takeover.
    #[arg(long, default_value = "30")]
    pub grace_timeout: u64,

    /// Directory holding orchestrator state (default: ~/.crew).
    #[arg(long, env = "CREW_HOME")]
    pub crew_home: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CREW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (json or plain).
    #[arg(long, env = "CREW_LOG_FORMAT", default_value = "json")]
    pub log_format: String,
}

impl ConsoleArgs {
    /// Orchestrator state directory.
    pub fn orchestrator_root(&self) -> PathBuf {
        self.crew_home
            .clone()
            .or_else(|| std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".crew")))
            .unwrap_or_else(|| PathBuf::from(".crew"))
            .join("orchestrator")
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
