// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for end-to-end scenario tests.
//!
//! Agents and consoles run in-process against a shared [`MemoryBus`], which
//! has the same key/channel/TTL semantics as the NATS binding, so the
//! coordination protocols (locking, ownership, RPC, tail) are exercised for
//! real without a server.

use std::sync::Arc;

use crew::agent::{AgentApp, AgentConfig};
use crew::bus::memory::MemoryBus;
use crew::session::{AttachOptions, Session};
use crew::tail::TailRecord;
use parking_lot::Mutex;

/// A bootstrapped in-process agent with its scratch directory.
pub struct TestAgent {
    pub app: AgentApp,
    pub dir: tempfile::TempDir,
}

impl TestAgent {
    /// Path of this agent's state directory.
    pub fn state_dir(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(".crew").join("agents").join(name).join("state")
    }
}

/// Bootstrap an agent as `project/name` on the shared bus.
pub async fn spawn_agent(bus: &MemoryBus, project: &str, name: &str) -> anyhow::Result<TestAgent> {
    let dir = tempfile::tempdir()?;
    let mut config = AgentConfig::new(dir.path().to_path_buf());
    config.project_override = Some(project.to_owned());
    config.name_override = Some(name.to_owned());
    let app = AgentApp::bootstrap(config, Some(Arc::new(bus.clone())), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(TestAgent { app, dir })
}

/// Tail records collected by an attached session.
pub type Collected = Arc<Mutex<Vec<TailRecord>>>;

/// Attach a session that records every tail event.
pub async fn attach_collecting(
    bus: &MemoryBus,
    agent_id: &str,
    options: AttachOptions,
) -> anyhow::Result<(Session, Collected)> {
    let collected: Collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let session = Session::attach(
        Arc::new(bus.clone()),
        agent_id,
        options,
        move |record| sink.lock().push(record),
        |_notice| {},
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok((session, collected))
}
