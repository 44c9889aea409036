// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Console: command vocabulary, router, and the interactive line loop.
//!
//! The router is presentation-free — it parses a line, talks to the
//! session/registry/orchestrator, and returns printable output — so the
//! whole vocabulary is testable without a terminal. The stdin loop in
//! [`ConsoleApp::run`] is a thin shell around it. Destructive commands
//! echo the target id and require it to be typed back verbatim.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::bus::Bus;
use crate::error::{CrewResult, ErrorInfo};
use crate::heartbeat::HeartbeatMonitor;
use crate::orchestrator::OrchestratorClient;
use crate::registry::RegistryClient;
use crate::secrets::Redactor;
use crate::session::{AttachOptions, Session};
use crate::tail::TailEvent;

/// Parsed console input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ps,
    Attach(String),
    Detach,
    Input(String),
    Status,
    Who,
    Ctx,
    SysShow,
    SysEdit(String),
    ReloadSysPrompt,
    KbAdd(Vec<String>),
    KbSearch(String),
    KbCopyFrom { agent: String, ids: Vec<String> },
    ClearHistory,
    AgentNew { project: String, name: String, cwd: String, model: String },
    AgentList,
    AgentDelete(String),
    Offload { name: String, prompt: String },
    Interrupt,
    Quit,
    Overlay(String),
    Help,
    Empty,
    Unknown(String),
}

/// Parse one console line. Slash commands are case-insensitive;
/// `# <line>` appends to the attached agent's overlay.
pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if let Some(overlay) = line.strip_prefix('#') {
        return Command::Overlay(overlay.trim().to_owned());
    }
    let Some(rest) = line.strip_prefix('/') else {
        // Bare text is shorthand for /input.
        return Command::Input(line.to_owned());
    };

    let mut parts = rest.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = parts.collect();
    let tail_text = |skip: usize| -> String {
        args.iter().skip(skip).copied().collect::<Vec<_>>().join(" ")
    };

    match verb.as_str() {
        "ps" => Command::Ps,
        "attach" => match args.first() {
            Some(id) => Command::Attach((*id).to_owned()),
            None => Command::Unknown("usage: /attach <project/name>".to_owned()),
        },
        "detach" => Command::Detach,
        "input" => Command::Input(tail_text(0)),
        "status" => Command::Status,
        "who" => Command::Who,
        "ctx" => Command::Ctx,
        "sys" => match args.first().map(|s| s.to_lowercase()).as_deref() {
            Some("show") | None => Command::SysShow,
            Some("edit") => Command::SysEdit(tail_text(1)),
            Some(other) => Command::Unknown(format!("unknown /sys mode '{other}'")),
        },
        "reloadsysprompt" => Command::ReloadSysPrompt,
        "kb" => match args.first().map(|s| s.to_lowercase()).as_deref() {
            Some("add") => Command::KbAdd(args.iter().skip(1).map(|s| (*s).to_owned()).collect()),
            Some("search") => Command::KbSearch(tail_text(1)),
            Some("copy-from") => match args.get(1) {
                Some(agent) => Command::KbCopyFrom {
                    agent: (*agent).to_owned(),
                    ids: args.iter().skip(2).map(|s| (*s).to_owned()).collect(),
                },
                None => Command::Unknown("usage: /kb copy-from <agent> [ids...]".to_owned()),
            },
            _ => Command::Unknown("usage: /kb <add|search|copy-from>".to_owned()),
        },
        "clearhistory" => Command::ClearHistory,
        "agent" => match args.first().map(|s| s.to_lowercase()).as_deref() {
            Some("new") => match (args.get(1), args.get(2), args.get(3)) {
                (Some(project), Some(name), Some(cwd)) => Command::AgentNew {
                    project: (*project).to_owned(),
                    name: (*name).to_owned(),
                    cwd: (*cwd).to_owned(),
                    model: args.get(4).copied().unwrap_or("echo").to_owned(),
                },
                _ => Command::Unknown(
                    "usage: /agent new <project> <name> <cwd> [model]".to_owned(),
                ),
            },
            Some("list") => Command::AgentList,
            Some("delete") => match args.get(1) {
                Some(id) => Command::AgentDelete((*id).to_owned()),
                None => Command::Unknown("usage: /agent delete <project/name>".to_owned()),
            },
            _ => Command::Unknown("usage: /agent <new|list|delete>".to_owned()),
        },
        "offload" => match args.first() {
            Some(name) if args.len() > 1 => {
                Command::Offload { name: (*name).to_owned(), prompt: tail_text(1) }
            }
            _ => Command::Unknown("usage: /offload <name> <prompt>".to_owned()),
        },
        "interrupt" => Command::Interrupt,
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        other => Command::Unknown(format!("unknown command '/{other}'")),
    }
}

/// A destructive action parked until the operator re-types the target id.
#[derive(Debug, Clone, PartialEq)]
enum PendingConfirm {
    ClearHistory { agent_id: String },
    DeleteAgent { agent_id: String },
}

/// Interactive console over one bus connection.
pub struct ConsoleApp {
    bus: Arc<dyn Bus>,
    registry: RegistryClient,
    orchestrator: OrchestratorClient,
    monitor: HeartbeatMonitor,
    redactor: Redactor,
    session: Option<Session>,
    read_only_banner: Arc<AtomicBool>,
    pending: Option<PendingConfirm>,
    takeover: bool,
    grace: Duration,
    project_hint: String,
    quitting: bool,
}

impl ConsoleApp {
    pub fn new(bus: Arc<dyn Bus>, takeover: bool, grace: Duration, redactor: Redactor) -> Self {
        let registry = RegistryClient::new(bus.clone());
        let orchestrator = OrchestratorClient::new(bus.clone());
        let mut monitor = HeartbeatMonitor::new(bus.clone(), Duration::from_secs(30));
        monitor.start();
        let mut reports = monitor.subscribe();
        tokio::spawn(async move {
            loop {
                match reports.recv().await {
                    Ok(report) => println!(
                        "[monitor] {} looks disconnected ({})",
                        report.agent_id,
                        match report.last_seen {
                            Some(ts) => format!("last heartbeat at {ts:.0}"),
                            None => "unreadable heartbeat".to_owned(),
                        }
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self {
            bus,
            registry,
            orchestrator,
            monitor,
            redactor,
            session: None,
            read_only_banner: Arc::new(AtomicBool::new(false)),
            pending: None,
            takeover,
            grace,
            project_hint: "default".to_owned(),
            quitting: false,
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    /// Handle one input line, returning the lines to print.
    pub async fn handle_line(&mut self, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.read_only_banner.load(Ordering::SeqCst) {
            out.push("*** READ-ONLY: this session lost ownership to another console ***".to_owned());
        }

        // A parked destructive action swallows the next line as its answer.
        if let Some(pending) = self.pending.take() {
            out.extend(self.resolve_confirm(pending, line.trim()).await);
            return out;
        }

        let command = parse_command(line);
        out.extend(self.dispatch(command).await);
        out
    }

    async fn dispatch(&mut self, command: Command) -> Vec<String> {
        match command {
            Command::Empty => Vec::new(),
            Command::Help => help_text(),
            Command::Unknown(message) => vec![format!("error: {message}")],
            Command::Quit => {
                if let Some(session) = self.session.take() {
                    session.detach().await;
                }
                self.monitor.stop().await;
                self.quitting = true;
                vec!["bye".to_owned()]
            }
            Command::Ps => self.cmd_ps().await,
            Command::Attach(agent_id) => self.cmd_attach(&agent_id).await,
            Command::Detach => match self.session.take() {
                Some(session) => {
                    let agent_id = session.agent_id().to_owned();
                    session.detach().await;
                    self.read_only_banner.store(false, Ordering::SeqCst);
                    vec![format!("detached from {agent_id}")]
                }
                None => vec!["error: no attached agent".to_owned()],
            },
            Command::Input(text) => match self.attached() {
                Ok(session) => match session.send_input(&text).await {
                    Ok(qid) => vec![format!("queued {qid}")],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::Status => match self.attached_ro() {
                Ok(session) => match session.status().await {
                    Ok(value) => vec![pretty(&value)],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::Who => match &self.session {
                Some(session) => vec![format!(
                    "attached to {} as session {}{}",
                    session.agent_id(),
                    session.session_id(),
                    if session.is_read_only() { " (read-only)" } else { " (writer)" }
                )],
                None => vec!["not attached".to_owned()],
            },
            Command::Ctx => match self.attached_ro() {
                Ok(session) => match session.status().await {
                    Ok(value) => vec![format!(
                        "context: {:.1}% of window, {} tokens",
                        value.get("ctx_pct").and_then(|v| v.as_f64()).unwrap_or(0.0) * 100.0,
                        value.get("tokens_in_ctx").and_then(|v| v.as_u64()).unwrap_or(0),
                    )],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::SysShow => match self.attached_ro() {
                Ok(session) => match session.prompt_get().await {
                    Ok(value) => vec![value
                        .get("effective")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_owned()],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::SysEdit(base) => match self.attached() {
                Ok(session) => {
                    if base.is_empty() {
                        return vec!["usage: /sys edit <new base prompt>".to_owned()];
                    }
                    match session.prompt_set_base(&base).await {
                        Ok(()) => vec!["base prompt updated".to_owned()],
                        Err(e) => self.report(e),
                    }
                }
                Err(lines) => lines,
            },
            Command::ReloadSysPrompt => match self.attached() {
                Ok(session) => match session.prompt_reload().await {
                    Ok(()) => vec!["system prompt reloaded from disk".to_owned()],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::Overlay(line) => match self.attached() {
                Ok(session) => match session.append_overlay(&line).await {
                    Ok(()) => vec![format!("overlay += {line}")],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::KbAdd(paths) => match self.attached() {
                Ok(session) => match session.kb_ingest(&paths, "agent").await {
                    Ok(ids) => vec![format!("ingested {} documents", ids.len())],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::KbSearch(query) => match self.attached_ro() {
                Ok(session) => match session.kb_search(&query, "agent", 5).await {
                    Ok(value) => vec![pretty(&value)],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::KbCopyFrom { agent, ids } => match self.attached() {
                Ok(session) => match session.kb_copy_from(&agent, &ids).await {
                    Ok(value) => vec![pretty(&value)],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
            Command::ClearHistory => match &self.session {
                Some(session) => {
                    let agent_id = session.agent_id().to_owned();
                    self.pending = Some(PendingConfirm::ClearHistory { agent_id: agent_id.clone() });
                    vec![
                        format!("this permanently clears history for {agent_id}"),
                        format!("type '{agent_id}' to confirm, anything else to abort"),
                    ]
                }
                None => vec!["error: no attached agent".to_owned()],
            },
            Command::AgentNew { project, name, cwd, model } => {
                match self
                    .orchestrator
                    .create_agent(&project, &name, &cwd, &model, None, &[])
                    .await
                {
                    Ok(agent_id) => {
                        self.project_hint = project;
                        vec![format!("created {agent_id}")]
                    }
                    Err(e) => self.report(e),
                }
            }
            Command::AgentList => match self.orchestrator.list_agents().await {
                Ok(specs) => {
                    if specs.is_empty() {
                        vec!["no configured agents".to_owned()]
                    } else {
                        specs
                            .iter()
                            .map(|s| format!("{}  model={}  cwd={}", s.id, s.model, s.cwd))
                            .collect()
                    }
                }
                Err(e) => self.report(e),
            },
            Command::AgentDelete(agent_id) => {
                self.pending = Some(PendingConfirm::DeleteAgent { agent_id: agent_id.clone() });
                vec![
                    format!("this deletes the configuration for {agent_id}"),
                    format!("type '{agent_id}' to confirm, anything else to abort"),
                ]
            }
            Command::Offload { name, prompt } => self.cmd_offload(&name, &prompt).await,
            Command::Interrupt => match self.attached() {
                Ok(session) => match session.interrupt().await {
                    Ok(()) => vec!["interrupt sent".to_owned()],
                    Err(e) => self.report(e),
                },
                Err(lines) => lines,
            },
        }
    }

    async fn cmd_ps(&self) -> Vec<String> {
        match self.registry.list().await {
            Ok(records) => {
                if records.is_empty() {
                    return vec!["no live agents".to_owned()];
                }
                records
                    .iter()
                    .map(|r| {
                        format!(
                            "{}  {}  ctx={:.0}%  model={}  pid={}  host={}",
                            r.id,
                            r.state,
                            r.ctx_pct * 100.0,
                            r.model,
                            r.pid,
                            r.host
                        )
                    })
                    .collect()
            }
            Err(e) => self.report(e),
        }
    }

    async fn cmd_attach(&mut self, agent_id: &str) -> Vec<String> {
        if let Some(session) = self.session.take() {
            session.detach().await;
        }
        self.read_only_banner.store(false, Ordering::SeqCst);

        let banner = self.read_only_banner.clone();
        let redactor = self.redactor.clone();
        let result = Session::attach(
            self.bus.clone(),
            agent_id,
            AttachOptions { takeover: self.takeover, grace: self.grace },
            move |record| print_tail_event(&redactor, record.event),
            move |notice| {
                banner.store(true, Ordering::SeqCst);
                println!();
                println!(
                    "*** OWNERSHIP LOST: {} was taken over by session {} ***",
                    notice.agent_id, notice.new_session
                );
            },
        )
        .await;

        match result {
            Ok(session) => {
                if let Some((project, _)) = agent_id.split_once('/') {
                    self.project_hint = project.to_owned();
                }
                let who = format!("attached to {agent_id} as writer");
                self.session = Some(session);
                vec![who]
            }
            Err(e) if e.code == "ownership.denied" => vec![format!(
                "error: {agent_id} is owned by another console (retry with --takeover)"
            )],
            Err(e) => self.report(e),
        }
    }

    /// Create, spawn, and hand a first task to a fresh agent.
    async fn cmd_offload(&mut self, name: &str, prompt: &str) -> Vec<String> {
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| ".".to_owned());
        let project = self.project_hint.clone();

        let agent_id = match self
            .orchestrator
            .create_agent(&project, name, &cwd, "echo", None, &[])
            .await
        {
            Ok(agent_id) => agent_id,
            Err(e) => return self.report(e),
        };
        if let Err(e) = self.orchestrator.spawn_agent(&agent_id, false).await {
            return self.report(e);
        }
        vec![
            format!("offloaded to {agent_id}: {prompt}"),
            format!("attach with /attach {agent_id} once it registers, then /input {prompt}"),
        ]
    }

    async fn resolve_confirm(&mut self, pending: PendingConfirm, answer: &str) -> Vec<String> {
        match pending {
            PendingConfirm::ClearHistory { agent_id } => {
                if answer != agent_id {
                    return vec!["aborted".to_owned()];
                }
                match self.attached() {
                    Ok(session) => match session.clear_history().await {
                        Ok(()) => vec![format!("history cleared for {agent_id}")],
                        Err(e) => self.report(e),
                    },
                    Err(lines) => lines,
                }
            }
            PendingConfirm::DeleteAgent { agent_id } => {
                if answer != agent_id {
                    return vec!["aborted".to_owned()];
                }
                match self.orchestrator.delete_agent(&agent_id).await {
                    Ok(()) => vec![format!("deleted {agent_id}")],
                    Err(e) => self.report(e),
                }
            }
        }
    }

    /// Session for mutating commands: refused while read-only.
    fn attached(&self) -> Result<&Session, Vec<String>> {
        match &self.session {
            Some(session) if session.is_read_only() => Err(vec![
                "error: session is read-only after takeover; mutating commands are blocked"
                    .to_owned(),
            ]),
            Some(session) => Ok(session),
            None => Err(vec!["error: no attached agent (use /attach <id>)".to_owned()]),
        }
    }

    /// Session for read-only commands: fine while read-only.
    fn attached_ro(&self) -> Result<&Session, Vec<String>> {
        match &self.session {
            Some(session) => Ok(session),
            None => Err(vec!["error: no attached agent (use /attach <id>)".to_owned()]),
        }
    }

    fn report(&self, error: ErrorInfo) -> Vec<String> {
        vec![format!("error: {}", self.redactor.redact(&error.to_string()))]
    }

    /// Read stdin lines until /quit.
    pub async fn run(&mut self) -> CrewResult<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        print_prompt();
        while let Ok(Some(line)) = lines.next_line().await {
            for out in self.handle_line(&line).await {
                println!("{out}");
            }
            if self.quitting {
                return Ok(());
            }
            print_prompt();
        }
        // stdin closed: detach cleanly.
        if let Some(session) = self.session.take() {
            session.detach().await;
        }
        self.monitor.stop().await;
        Ok(())
    }
}

fn print_prompt() {
    print!("crew> ");
    if std::io::stdout().flush().is_err() {
        warn!("stdout flush failed");
    }
}

/// Stream a tail event to the terminal: tokens inline, the rest as
/// bracketed status lines.
fn print_tail_event(redactor: &Redactor, event: TailEvent) {
    match event {
        TailEvent::Token { text, .. } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        TailEvent::TaskStart { id, .. } => println!("[task {id} started]"),
        TailEvent::TaskEnd { id, ok } => {
            println!();
            println!("[task {id} {}]", if ok { "done" } else { "failed" });
        }
        TailEvent::ToolStart { tool, .. } => println!("[tool {tool} ...]"),
        TailEvent::ToolResult { tool, .. } => println!("[tool {tool} ok]"),
        TailEvent::ToolEnd { .. } => {}
        TailEvent::Tool { name } => println!("[tool {name}]"),
        TailEvent::Warn { msg } => println!("[warn] {}", redactor.redact(&msg)),
        TailEvent::Error { msg, .. } => println!("[error] {}", redactor.redact(&msg)),
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn help_text() -> Vec<String> {
    vec![
        "/ps                         list live agents".to_owned(),
        "/attach <project/name>      attach (exclusive writer)".to_owned(),
        "/detach                     detach from the current agent".to_owned(),
        "/input <text>               queue a prompt (bare text works too)".to_owned(),
        "/status /who /ctx           session and agent state".to_owned(),
        "/sys show | /sys edit <p>   show or replace the base prompt".to_owned(),
        "/reloadsysprompt            reload prompt files from disk".to_owned(),
        "# <line>                    append an overlay line".to_owned(),
        "/kb add <paths...>          ingest documents".to_owned(),
        "/kb search <query>          search the agent scope".to_owned(),
        "/kb copy-from <agent> [ids] copy documents from another agent".to_owned(),
        "/clearhistory               clear history (confirmed by id)".to_owned(),
        "/agent new|list|delete      manage configured agents".to_owned(),
        "/offload <name> <prompt>    spawn a helper agent for a task".to_owned(),
        "/interrupt                  interrupt the running task".to_owned(),
        "/quit                       leave the console".to_owned(),
    ]
}

#[cfg(test)]
#[path = "console_tests.rs"]
mod tests;
