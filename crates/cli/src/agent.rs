// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent process: bootstrap, RPC surface, queue pump, graceful shutdown.
//!
//! Bootstrap wires the local components (queue, history, prompts, memory,
//! tools, KB, runner) and, unless standalone, the bus-facing ones (lock,
//! registry, heartbeat, RPC server, tail emitter). Standalone mode swaps
//! in no-op capability implementations instead of branching on `Option`s
//! at every call site.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::clock::{iso8601_now, now_ts};
use crate::defaults::{CTX_LIMIT_TOKENS, SUMMARIZE_THRESHOLD};
use crate::error::{CrewResult, ErrorInfo};
use crate::heartbeat::HeartbeatService;
use crate::history::{HistoryStore, Role, Turn};
use crate::identity::{derive_agent_id, hostname, AgentIdentity, IdentityInputs};
use crate::kb::{FileKbStore, KbItem, KbStore, Scope};
use crate::memory::MemoryAccountant;
use crate::model::{EchoModel, ModelProvider};
use crate::ownership::{BusOwnershipOracle, OwnershipOracle};
use crate::prompt_layer::PromptLayer;
use crate::queue::{PromptQueue, QueueSource};
use crate::registry::{AgentRecord, AgentState, RegistryClient};
use crate::rpc::{Method, Params, RpcClient, RpcServer};
use crate::runner::TaskRunner;
use crate::summarize::{Strategy, SummarizeConfig};
use crate::tail::{EventSink, NoopSink, TailEmitter};
use crate::tools::{register_builtin_tools, ToolRegistry};

/// How many ring entries feed the restart-context digest.
const RECONSTRUCT_WINDOW: usize = 50;

/// Inputs for agent bootstrap.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Working directory the agent owns.
    pub cwd: PathBuf,
    pub name_override: Option<String>,
    pub project_override: Option<String>,
    /// Model id; anything unknown falls back to the echo model.
    pub model_id: String,
    pub ctx_limit_tokens: u64,
    pub summarize_threshold: f64,
    pub summarize_strategy: Strategy,
}

impl AgentConfig {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            name_override: None,
            project_override: None,
            model_id: "echo".to_owned(),
            ctx_limit_tokens: u64::from(CTX_LIMIT_TOKENS),
            summarize_threshold: SUMMARIZE_THRESHOLD,
            summarize_strategy: Strategy::TokenBased,
        }
    }
}

/// Everything the RPC handlers and queue pump share.
struct AgentCore {
    agent_id: String,
    cwd: PathBuf,
    model: Arc<dyn ModelProvider>,
    queue: Arc<PromptQueue>,
    history: Arc<HistoryStore>,
    prompts: Arc<PromptLayer>,
    memory: Arc<MemoryAccountant>,
    kb: Arc<dyn KbStore>,
    runner: Arc<TaskRunner>,
    record: Arc<Mutex<AgentRecord>>,
    registry: Option<RegistryClient>,
    bus: Option<Arc<dyn Bus>>,
    tail: Option<Arc<TailEmitter>>,
    wake: Notify,
}

impl AgentCore {
    /// Mirror a state change into the shared record and the registry.
    async fn set_state(&self, state: AgentState) {
        let ctx_pct = self.memory.ctx_pct();
        {
            let mut record = self.record.lock();
            record.state = state;
            record.ctx_pct = ctx_pct;
        }
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.update_state(&self.agent_id, state, ctx_pct).await {
                warn!(agent_id = %self.agent_id, error = %e, "registry state update failed");
            }
        }
    }

    /// Summarize when the accountant crossed its threshold.
    async fn maybe_summarize(&self) {
        if !self.memory.should_summarize() {
            return;
        }
        match self.history.summarize(Some(&self.model)).await {
            Ok(summary) => {
                self.memory.summarize();
                info!(
                    agent_id = %self.agent_id,
                    turns = summary.turn_count,
                    "history summarized under memory pressure"
                );
            }
            Err(e) if e.code == "history.summarization_not_needed" => {
                debug!(agent_id = %self.agent_id, "summarization skipped: {e}");
            }
            Err(e) => warn!(agent_id = %self.agent_id, error = %e, "summarization failed"),
        }
    }
}

/// A bootstrapped agent process.
pub struct AgentApp {
    core: Arc<AgentCore>,
    identity: Option<Arc<AgentIdentity>>,
    heartbeat: Option<HeartbeatService>,
    server: Option<RpcServer>,
    shutdown: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl AgentApp {
    /// Bootstrap against a bus (`Some`) or standalone (`None`).
    ///
    /// Order: identity → single-instance lock → local state → model →
    /// tools → KB → RPC server → tail → context reconstruction →
    /// registry → heartbeat.
    pub async fn bootstrap(
        config: AgentConfig,
        bus: Option<Arc<dyn Bus>>,
        model: Option<Arc<dyn ModelProvider>>,
    ) -> CrewResult<Self> {
        let standalone = bus.is_none();
        info!(cwd = %config.cwd.display(), standalone, "agent bootstrap starting");

        // Walk up from cwd to an existing `.crew`; a fresh tree roots at
        // cwd itself, so the derivation is stable across restarts.
        let config_root = discover_config_root(&config.cwd);
        let config_dir = config_root.join(".crew");
        let inputs = IdentityInputs {
            cwd: config.cwd.to_string_lossy().into_owned(),
            config_dir: Some(config_root.to_string_lossy().into_owned()),
            configured_project: None,
            configured_name: None,
            project_override: config.project_override.clone(),
            name_override: config.name_override.clone(),
        };
        let agent_id = derive_agent_id(&inputs)?;
        let agent_name = agent_id.split('/').next_back().unwrap_or_default().to_owned();
        let project = agent_id.split('/').next().unwrap_or_default().to_owned();
        info!(agent_id = %agent_id, "identity derived");

        // Single-instance lock, before any state is touched.
        let identity = match &bus {
            Some(bus) => {
                let identity = Arc::new(AgentIdentity::new(agent_id.clone(), bus.clone()));
                identity.acquire_lock().await?;
                Some(identity)
            }
            None => None,
        };

        let agent_dir = config_dir.join("agents").join(&agent_name);
        let state_dir = agent_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| ErrorInfo::new("agent.bootstrap_failed", e.to_string()))?;

        let queue = Arc::new(PromptQueue::open(state_dir.join("queue.jsonl")));
        let history = Arc::new(HistoryStore::open(
            state_dir.join("history.jsonl"),
            state_dir.join("summary.jsonl"),
            SummarizeConfig {
                strategy: config.summarize_strategy,
                ..SummarizeConfig::default()
            },
        ));
        let prompts = Arc::new(PromptLayer::open(
            agent_dir.join("system_base.md"),
            agent_dir.join("system_overlay.md"),
        )?);
        let memory =
            Arc::new(MemoryAccountant::new(config.ctx_limit_tokens, config.summarize_threshold)?);

        let model: Arc<dyn ModelProvider> = match model {
            Some(model) => model,
            None => {
                if config.model_id != "echo" {
                    warn!(model = %config.model_id, "model unavailable, falling back to echo");
                }
                Arc::new(EchoModel::new())
            }
        };

        let tools = Arc::new(ToolRegistry::new());
        register_builtin_tools(&tools, config.cwd.clone());

        let user_dir = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".crew"))
            .unwrap_or_else(|_| config_dir.clone());
        let kb: Arc<dyn KbStore> =
            Arc::new(FileKbStore::open(agent_dir.clone(), config_dir.clone(), user_dir));

        let tail = bus
            .as_ref()
            .map(|bus| Arc::new(TailEmitter::new(bus.clone(), agent_id.clone())));
        let sink: Arc<dyn EventSink> = match &tail {
            Some(tail) => tail.clone(),
            None => Arc::new(NoopSink),
        };

        let runner = Arc::new(TaskRunner::new(
            model.clone(),
            sink,
            prompts.clone(),
            history.clone(),
            memory.clone(),
            tools.clone(),
        ));

        let record = Arc::new(Mutex::new(AgentRecord {
            id: agent_id.clone(),
            name: agent_name,
            project,
            model: model.model_id().to_owned(),
            cwd: config.cwd.to_string_lossy().into_owned(),
            host: hostname(),
            pid: std::process::id(),
            started_at: iso8601_now(),
            state: if standalone { AgentState::Standalone } else { AgentState::Init },
            ctx_pct: 0.0,
        }));

        let registry = bus.as_ref().map(|bus| RegistryClient::new(bus.clone()));
        let core = Arc::new(AgentCore {
            agent_id: agent_id.clone(),
            cwd: config.cwd.clone(),
            model,
            queue,
            history,
            prompts,
            memory,
            kb,
            runner,
            record: record.clone(),
            registry: registry.clone(),
            bus: bus.clone(),
            tail: tail.clone(),
            wake: Notify::new(),
        });

        // RPC server with real ownership enforcement on the bus.
        let server = match &bus {
            Some(bus) => {
                let oracle: Arc<dyn OwnershipOracle> = Arc::new(BusOwnershipOracle::new(bus.clone()));
                let mut server = RpcServer::new(bus.clone(), agent_id.clone(), oracle);
                register_handlers(&mut server, core.clone());
                server.start().await?;
                Some(server)
            }
            None => None,
        };

        let context = core.reconstruct_context();
        info!(
            agent_id = %agent_id,
            context_chars = context.len(),
            "context reconstructed from summaries and tail"
        );

        let heartbeat = match (&bus, &identity, &registry) {
            (Some(bus), Some(identity), Some(registry)) => {
                record.lock().state = AgentState::Registered;
                let snapshot = record.lock().clone();
                registry.register(&snapshot).await?;
                let mut heartbeat = HeartbeatService::new(
                    bus.clone(),
                    identity.clone(),
                    registry.clone(),
                    record.clone(),
                );
                heartbeat.start();
                Some(heartbeat)
            }
            _ => None,
        };

        let shutdown = CancellationToken::new();
        let pump = Some(spawn_pump(core.clone(), shutdown.clone()));

        info!(agent_id = %agent_id, standalone, "agent bootstrap complete");
        Ok(Self { core, identity, heartbeat, server, shutdown, pump })
    }

    pub fn agent_id(&self) -> &str {
        &self.core.agent_id
    }

    /// Enqueue local input, exactly like the `input` RPC does for consoles.
    pub fn enqueue_local(&self, text: &str) -> CrewResult<String> {
        let qid = self.core.queue.append(text, QueueSource::Local)?;
        self.core.wake.notify_one();
        Ok(qid)
    }

    /// Reconstructed context string (summaries + trailing turns + activity).
    pub fn reconstruct_context(&self) -> String {
        self.core.reconstruct_context()
    }

    pub fn queue_size(&self) -> usize {
        self.core.queue.size()
    }

    pub fn history_size(&self) -> usize {
        self.core.history.size()
    }

    /// Block until SIGINT or SIGTERM, then shut down.
    pub async fn run_until_signal(mut self) -> CrewResult<()> {
        wait_for_signal().await;
        info!(agent_id = %self.core.agent_id, "shutdown signal received");
        self.shutdown().await
    }

    /// Graceful teardown. Every step runs in its own error scope so one
    /// failure does not skip the rest.
    pub async fn shutdown(&mut self) -> CrewResult<()> {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }

        if let Some(heartbeat) = &mut self.heartbeat {
            heartbeat.stop().await;
        }
        if let Some(server) = &mut self.server {
            server.stop().await;
        }
        if let Some(registry) = &self.core.registry {
            if let Err(e) = registry.unregister(&self.core.agent_id).await {
                warn!(agent_id = %self.core.agent_id, error = %e, "unregister failed");
            }
        }
        if let Some(identity) = &self.identity {
            if let Err(e) = identity.release_lock().await {
                warn!(agent_id = %self.core.agent_id, error = %e, "lock release failed");
            }
        }
        if let Some(bus) = &self.core.bus {
            if let Err(e) = bus.close().await {
                warn!(agent_id = %self.core.agent_id, error = %e, "bus close failed");
            }
        }
        info!(agent_id = %self.core.agent_id, "agent shut down");
        Ok(())
    }
}

impl AgentCore {
    fn reconstruct_context(&self) -> String {
        let events = self
            .tail
            .as_ref()
            .map(|tail| tail.recent_events(RECONSTRUCT_WINDOW))
            .unwrap_or_default();
        self.history.reconstruct_context(&events)
    }
}

/// Nearest ancestor of `cwd` (inclusive) holding a `.crew` directory,
/// falling back to `cwd` itself.
fn discover_config_root(cwd: &std::path::Path) -> PathBuf {
    let mut dir = Some(cwd);
    while let Some(d) = dir {
        if d.join(".crew").is_dir() {
            return d.to_path_buf();
        }
        dir = d.parent();
    }
    cwd.to_path_buf()
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

/// Queue pump: waits for work, runs items FIFO, records turns, and keeps
/// the registry state in step.
fn spawn_pump(core: Arc<AgentCore>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while let Some(item) = core.queue.pop() {
                if shutdown.is_cancelled() {
                    return;
                }
                core.set_state(AgentState::Busy).await;

                let user_turn = Turn {
                    ts: now_ts(),
                    role: Role::User,
                    source: match item.source {
                        QueueSource::Console => "console".to_owned(),
                        QueueSource::Local => "local".to_owned(),
                    },
                    content: item.text.clone(),
                    tokens_in: core.model.estimate_tokens(&item.text),
                    tokens_out: 0,
                    tool_calls: None,
                };
                if let Err(e) = core.history.append(user_turn) {
                    warn!(agent_id = %core.agent_id, error = %e, "user turn append failed");
                }

                let outcome = core.runner.run_next(&item).await;
                if outcome.ok {
                    let tool_calls = if outcome.tool_calls.is_empty() {
                        None
                    } else {
                        Some(json!(outcome
                            .tool_calls
                            .iter()
                            .map(|c| json!({"name": c.name, "arguments": c.arguments}))
                            .collect::<Vec<_>>()))
                    };
                    let turn = Turn {
                        ts: now_ts(),
                        role: Role::Assistant,
                        source: "model".to_owned(),
                        content: outcome.response.clone(),
                        tokens_in: outcome.tokens_in,
                        tokens_out: outcome.tokens_out,
                        tool_calls,
                    };
                    if let Err(e) = core.history.append(turn) {
                        warn!(agent_id = %core.agent_id, error = %e, "assistant turn append failed");
                    }
                } else if let Some(reason) = &outcome.error {
                    warn!(agent_id = %core.agent_id, error = %reason, "task failed");
                }

                core.maybe_summarize().await;
                core.set_state(AgentState::Idle).await;
            }

            tokio::select! {
                _ = core.wake.notified() => {}
                _ = shutdown.cancelled() => return,
            }
        }
    })
}

/// Wire every agent RPC method to the shared core.
fn register_handlers(server: &mut RpcServer, core: Arc<AgentCore>) {
    let c = core.clone();
    server.register_fn(Method::Status, move |_params| {
        let c = c.clone();
        Box::pin(async move {
            let record = c.record.lock().clone();
            Ok(json!({
                "state": record.state,
                "ctx_pct": c.memory.ctx_pct(),
                "tokens_in_ctx": c.memory.ctx_tokens(),
                "model": record.model,
                "cwd": c.cwd.to_string_lossy(),
                "pid": record.pid,
                "host": record.host,
                "queue_size": c.queue.size(),
                "history_size": c.history.size(),
            }))
        })
    });

    let c = core.clone();
    server.register_fn(Method::Input, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let text = params
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ErrorInfo::new("rpc.error", "missing 'text' param"))?
                .to_owned();
            let qid = c.queue.append(&text, QueueSource::Console)?;
            c.wake.notify_one();
            info!(agent_id = %c.agent_id, qid = %qid, "input queued");
            Ok(json!({"ok": true, "qid": qid}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::Interrupt, move |_params| {
        let c = c.clone();
        Box::pin(async move {
            c.runner.interrupt();
            Ok(json!({"ok": true}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::Cancel, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let hard = params.get("hard").and_then(|v| v.as_bool()).unwrap_or(false);
            c.runner.cancel(hard);
            Ok(json!({"ok": true}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::PromptSet, move |params| {
        let c = c.clone();
        Box::pin(async move {
            if let Some(base) = params.get("base").and_then(|v| v.as_str()) {
                c.prompts.set_base(base)?;
            }
            if let Some(overlay) = params.get("overlay").and_then(|v| v.as_str()) {
                c.prompts.set_overlay(overlay)?;
            }
            Ok(json!({"ok": true}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::PromptReload, move |_params| {
        let c = c.clone();
        Box::pin(async move {
            c.prompts.reload_from_disk()?;
            Ok(json!({"ok": true}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::PromptGet, move |_params| {
        let c = c.clone();
        Box::pin(async move {
            Ok(json!({
                "effective": c.prompts.effective(),
                "base": c.prompts.base(),
                "overlay": c.prompts.overlay(),
                "overlay_lines": c.prompts.overlay_lines(),
            }))
        })
    });

    let c = core.clone();
    server.register_fn(Method::PromptOverlay, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let line = params
                .get("line")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ErrorInfo::new("prompt.empty_line", "missing 'line' param"))?;
            c.prompts.append_overlay(line)?;
            Ok(json!({"ok": true}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::KbIngest, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let paths: Vec<String> = params
                .get("paths")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .ok_or_else(|| ErrorInfo::new("kb.ingest_failed", "missing 'paths' param"))?;
            let scope = parse_scope(&params, "kb.ingest_failed")?;
            let metadata = params.get("metadata").cloned();
            let ids = c.kb.ingest(&paths, scope, metadata)?;
            Ok(json!({"ids": ids}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::KbSearch, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let query = params
                .get("query")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ErrorInfo::new("kb.search_failed", "missing 'query' param"))?;
            let scope = parse_scope(&params, "kb.search_failed")?;
            let k = params.get("k").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
            let hits = c.kb.search(query, scope, k)?;
            Ok(json!({"hits": hits}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::KbGetItems, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let scope = parse_scope(&params, "kb.search_failed")?;
            let items = match params.get("ids").and_then(|v| v.as_array()) {
                Some(ids) => {
                    let ids: Vec<String> = ids
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect();
                    c.kb.get_by_ids(scope, &ids)?
                }
                None => {
                    let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(50) as usize;
                    let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    c.kb.get_items(scope, limit, offset)?
                }
            };
            Ok(json!({"items": items}))
        })
    });

    let c = core.clone();
    server.register_fn(Method::KbCopyFrom, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let source_agent = params
                .get("source_agent")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ErrorInfo::new("kb.copy_failed", "missing 'source_agent' param"))?
                .to_owned();
            let ids: Vec<String> = params
                .get("ids")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            let bus = c
                .bus
                .clone()
                .ok_or_else(|| ErrorInfo::new("kb.copy_failed", "no bus in standalone mode"))?;

            // Fetch the items over the source agent's read-only RPC surface.
            let client = RpcClient::new(bus, source_agent.clone());
            let mut fetch = Params::new();
            fetch.insert("scope".to_owned(), json!("agent"));
            fetch.insert("ids".to_owned(), json!(ids));
            let value = client.call(Method::KbGetItems, fetch).await?;
            let items: Vec<KbItem> = serde_json::from_value(
                value.get("items").cloned().unwrap_or(serde_json::Value::Null),
            )
            .map_err(|e| ErrorInfo::new("kb.copy_failed", e.to_string()))?;

            let mut copied = Vec::new();
            let found: std::collections::HashSet<String> =
                items.iter().map(|i| i.id.clone()).collect();
            let skipped: Vec<String> =
                ids.iter().filter(|id| !found.contains(*id)).cloned().collect();
            for item in items {
                let id = c.kb.insert(Scope::Agent, item)?;
                copied.push(id);
            }
            info!(
                agent_id = %c.agent_id,
                source = %source_agent,
                copied = copied.len(),
                "kb items copied"
            );
            Ok(json!({"copied": copied, "skipped": skipped}))
        })
    });

    let c = core;
    server.register_fn(Method::HistoryClear, move |params| {
        let c = c.clone();
        Box::pin(async move {
            let confirm = params.get("confirm").and_then(|v| v.as_bool()).unwrap_or(false);
            c.history.clear(confirm)?;
            c.memory.clear();
            Ok(json!({"ok": true}))
        })
    });
}

fn parse_scope(params: &Params, error_code: &str) -> CrewResult<Scope> {
    let name = params.get("scope").and_then(|v| v.as_str()).unwrap_or("agent");
    Scope::from_name(name)
        .ok_or_else(|| ErrorInfo::new(error_code, format!("unknown scope '{name}'")))
}

/// Map a bootstrap error to the process exit code contract.
pub fn exit_code_for(error: &ErrorInfo) -> i32 {
    if error.code == "agent.duplicate" {
        11
    } else {
        1
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
