// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orchestrator: agent configuration CRUD plus spawn, hosted on the
//! well-known `orchestrator` RPC target.
//!
//! Configurations persist to a JSON file under the orchestrator root.
//! `spawn_agent` either launches the current binary as a detached
//! subprocess or, for remote execution, returns the command line to run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::bus::{keys, Bus};
use crate::clock::iso8601_now;
use crate::error::{CrewResult, ErrorInfo};
use crate::identity::{derive_agent_id, IdentityInputs};
use crate::ownership::GrantAllOracle;
use crate::rpc::{Method, Params, RpcClient, RpcServer};

/// One configured agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub project: String,
    pub name: String,
    pub cwd: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_base: Option<String>,
    #[serde(default)]
    pub kb_seeds: Vec<String>,
    pub created_at: String,
}

struct SpecStore {
    path: PathBuf,
    specs: Mutex<HashMap<String, AgentSpec>>,
}

impl SpecStore {
    fn open(root: PathBuf) -> Self {
        let path = root.join("agents.json");
        let specs = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(specs) => specs,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "agents file unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, specs: Mutex::new(specs) }
    }

    fn persist(&self) -> CrewResult<()> {
        let specs = self.specs.lock().clone();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ErrorInfo::new("orchestrator.create_failed", e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&specs)
            .map_err(|e| ErrorInfo::new("orchestrator.create_failed", e.to_string()))?;
        std::fs::write(&tmp, content)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| ErrorInfo::new("orchestrator.create_failed", e.to_string()))
    }
}

/// Bus-hosted orchestrator service.
pub struct OrchestratorService {
    store: Arc<SpecStore>,
    server: RpcServer,
}

impl OrchestratorService {
    /// `root` holds `agents.json`; `bus_url` is baked into spawn commands.
    pub async fn start(bus: Arc<dyn Bus>, root: PathBuf, bus_url: String) -> CrewResult<Self> {
        let store = Arc::new(SpecStore::open(root));
        let mut server = RpcServer::new(
            bus,
            keys::ORCHESTRATOR_TARGET.to_owned(),
            Arc::new(GrantAllOracle),
        );
        register_handlers(&mut server, store.clone(), bus_url);
        server.start().await?;
        info!("orchestrator service started");
        Ok(Self { store, server })
    }

    pub fn specs(&self) -> Vec<AgentSpec> {
        let mut specs: Vec<AgentSpec> = self.store.specs.lock().values().cloned().collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    pub async fn stop(&mut self) {
        self.server.stop().await;
    }
}

fn register_handlers(server: &mut RpcServer, store: Arc<SpecStore>, bus_url: String) {
    let s = store.clone();
    server.register_fn(Method::OrchestratorCreateAgent, move |params| {
        let s = s.clone();
        Box::pin(async move { create_agent(&s, &params) })
    });

    let s = store.clone();
    let url = bus_url.clone();
    server.register_fn(Method::OrchestratorSpawnAgent, move |params| {
        let s = s.clone();
        let url = url.clone();
        Box::pin(async move { spawn_agent(&s, &url, &params) })
    });

    let s = store.clone();
    server.register_fn(Method::OrchestratorListAgents, move |_params| {
        let s = s.clone();
        Box::pin(async move {
            let mut specs: Vec<AgentSpec> = s.specs.lock().values().cloned().collect();
            specs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(json!({"agents": specs}))
        })
    });

    let s = store;
    server.register_fn(Method::OrchestratorDeleteAgent, move |params| {
        let s = s.clone();
        Box::pin(async move {
            let agent_id = required(&params, "agent_id", "orchestrator.delete_failed")?;
            if s.specs.lock().remove(&agent_id).is_none() {
                return Err(ErrorInfo::new(
                    "orchestrator.delete_failed",
                    format!("no configured agent {agent_id}"),
                ));
            }
            s.persist().map_err(|e| ErrorInfo::new("orchestrator.delete_failed", e.message))?;
            info!(agent_id = %agent_id, "agent configuration deleted");
            Ok(json!({"ok": true}))
        })
    });
}

fn create_agent(store: &SpecStore, params: &Params) -> CrewResult<serde_json::Value> {
    let project = required(params, "project", "orchestrator.create_failed")?;
    let name = required(params, "name", "orchestrator.create_failed")?;
    let cwd = required(params, "cwd", "orchestrator.create_failed")?;
    let model = params
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("echo")
        .to_owned();
    let system_base = params.get("system_base").and_then(|v| v.as_str()).map(str::to_owned);
    let kb_seeds: Vec<String> = params
        .get("kb_seeds")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let inputs = IdentityInputs {
        cwd: cwd.clone(),
        project_override: Some(project.clone()),
        name_override: Some(name.clone()),
        ..Default::default()
    };
    let agent_id = derive_agent_id(&inputs)?;
    if store.specs.lock().contains_key(&agent_id) {
        return Err(ErrorInfo::new(
            "orchestrator.create_failed",
            format!("agent {agent_id} already configured"),
        ));
    }

    // Seed the agent's prompt file so the first boot picks it up.
    if let Some(base) = &system_base {
        let base_path = PathBuf::from(&cwd)
            .join(".crew")
            .join("agents")
            .join(&name)
            .join("system_base.md");
        if let Some(parent) = base_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ErrorInfo::new("orchestrator.create_failed", e.to_string()))?;
        }
        std::fs::write(&base_path, base)
            .map_err(|e| ErrorInfo::new("orchestrator.create_failed", e.to_string()))?;
    }

    let spec = AgentSpec {
        id: agent_id.clone(),
        project,
        name,
        cwd,
        model,
        system_base,
        kb_seeds,
        created_at: iso8601_now(),
    };
    store.specs.lock().insert(agent_id.clone(), spec);
    store.persist()?;
    info!(agent_id = %agent_id, "agent configuration created");
    Ok(json!({"agent_id": agent_id}))
}

fn spawn_agent(store: &SpecStore, bus_url: &str, params: &Params) -> CrewResult<serde_json::Value> {
    let agent_id = required(params, "agent_id", "orchestrator.spawn_failed")?;
    let remote = params.get("remote").and_then(|v| v.as_bool()).unwrap_or(false);
    let spec = store
        .specs
        .lock()
        .get(&agent_id)
        .cloned()
        .ok_or_else(|| {
            ErrorInfo::new("orchestrator.spawn_failed", format!("no configured agent {agent_id}"))
        })?;

    let command = format!(
        "crew agent --bus {bus_url} --cwd {} --project {} --name {}",
        spec.cwd, spec.project, spec.name
    );
    if remote {
        return Ok(json!({"command": command}));
    }

    let exe = std::env::current_exe()
        .map_err(|e| ErrorInfo::new("orchestrator.spawn_failed", e.to_string()))?;
    let child = tokio::process::Command::new(exe)
        .arg("agent")
        .arg("--bus")
        .arg(bus_url)
        .arg("--cwd")
        .arg(&spec.cwd)
        .arg("--project")
        .arg(&spec.project)
        .arg("--name")
        .arg(&spec.name)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| ErrorInfo::new("orchestrator.spawn_failed", e.to_string()))?;

    let pid = child.id().unwrap_or_default();
    info!(agent_id = %agent_id, pid, "agent spawned");
    Ok(json!({"ok": true, "pid": pid}))
}

fn required(params: &Params, key: &str, error_code: &str) -> CrewResult<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ErrorInfo::new(error_code, format!("missing '{key}' param")))
}

/// Console-side orchestrator client.
#[derive(Clone)]
pub struct OrchestratorClient {
    client: RpcClient,
}

impl OrchestratorClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { client: RpcClient::new(bus, keys::ORCHESTRATOR_TARGET.to_owned()) }
    }

    /// Create a configuration and return the new agent id.
    pub async fn create_agent(
        &self,
        project: &str,
        name: &str,
        cwd: &str,
        model: &str,
        system_base: Option<&str>,
        kb_seeds: &[String],
    ) -> CrewResult<String> {
        let mut params = Params::new();
        params.insert("project".to_owned(), json!(project));
        params.insert("name".to_owned(), json!(name));
        params.insert("cwd".to_owned(), json!(cwd));
        params.insert("model".to_owned(), json!(model));
        if let Some(base) = system_base {
            params.insert("system_base".to_owned(), json!(base));
        }
        params.insert("kb_seeds".to_owned(), json!(kb_seeds));
        let reply = self.client.call(Method::OrchestratorCreateAgent, params).await?;
        reply
            .get("agent_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                ErrorInfo::new("orchestrator.invalid_response", "no agent_id in reply")
            })
    }

    /// Spawn locally (`Ok(None)`) or fetch the remote command (`Ok(Some)`).
    pub async fn spawn_agent(&self, agent_id: &str, remote: bool) -> CrewResult<Option<String>> {
        let mut params = Params::new();
        params.insert("agent_id".to_owned(), json!(agent_id));
        params.insert("remote".to_owned(), json!(remote));
        let reply = self.client.call(Method::OrchestratorSpawnAgent, params).await?;
        if remote {
            let command = reply
                .get("command")
                .and_then(|v| v.as_str())
                .map(str::to_owned)
                .ok_or_else(|| {
                    ErrorInfo::new("orchestrator.invalid_response", "no command in remote reply")
                })?;
            Ok(Some(command))
        } else {
            Ok(None)
        }
    }

    pub async fn list_agents(&self) -> CrewResult<Vec<AgentSpec>> {
        let reply = self.client.call(Method::OrchestratorListAgents, Params::new()).await?;
        serde_json::from_value(reply.get("agents").cloned().unwrap_or(json!([])))
            .map_err(|e| ErrorInfo::new("orchestrator.invalid_response", e.to_string()))
    }

    pub async fn delete_agent(&self, agent_id: &str) -> CrewResult<()> {
        let mut params = Params::new();
        params.insert("agent_id".to_owned(), json!(agent_id));
        self.client.call(Method::OrchestratorDeleteAgent, params).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
