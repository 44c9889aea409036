// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Console-side session: one attached agent, one writer role.
//!
//! A session bundles the RPC client, the ownership token, a tail
//! subscription, and the read-only flag. Losing a takeover flips the
//! session to read-only instead of tearing it down: tail events keep
//! flowing, but mutating calls are refused locally (and would be refused
//! by the agent anyway, which checks the live ownership record itself).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::defaults::{NOTIFY_POLL, OWNERSHIP_TTL};
use crate::error::{CrewResult, ErrorInfo};
use crate::ownership::{OwnershipManager, TakeoverNotice};
use crate::rpc::{Method, Params, RpcClient};
use crate::tail::{TailRecord, TailSubscriber};

/// Attach options.
#[derive(Debug, Clone, Copy)]
pub struct AttachOptions {
    pub takeover: bool,
    pub grace: Duration,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self { takeover: false, grace: Duration::from_secs(30) }
    }
}

struct SessionState {
    token: Mutex<Option<String>>,
    read_only: AtomicBool,
}

/// A live console session against one agent.
pub struct Session {
    agent_id: String,
    client: RpcClient,
    ownership: Arc<OwnershipManager>,
    state: Arc<SessionState>,
    tail: TailSubscriber,
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl Session {
    /// Attach to an agent: connect RPC, acquire ownership (optionally with
    /// takeover), subscribe the tail, and start the notification poller.
    ///
    /// `on_event` receives every tail record; `on_read_only` fires once if
    /// the session loses ownership to a takeover.
    pub async fn attach<F, G>(
        bus: Arc<dyn Bus>,
        agent_id: &str,
        options: AttachOptions,
        on_event: F,
        on_read_only: G,
    ) -> CrewResult<Self>
    where
        F: Fn(TailRecord) + Send + Sync + 'static,
        G: Fn(TakeoverNotice) + Send + Sync + 'static,
    {
        info!(agent_id = %agent_id, takeover = options.takeover, "attaching");
        let client = RpcClient::new(bus.clone(), agent_id.to_owned());
        let ownership = Arc::new(OwnershipManager::new(bus.clone()));

        let token = ownership.acquire(agent_id, options.takeover, options.grace).await?;
        let state = Arc::new(SessionState {
            token: Mutex::new(Some(token)),
            read_only: AtomicBool::new(false),
        });

        let tail = TailSubscriber::start(bus, agent_id, on_event).await?;
        let shutdown = CancellationToken::new();
        let loops = vec![
            spawn_notification_loop(
                ownership.clone(),
                state.clone(),
                agent_id.to_owned(),
                shutdown.clone(),
                on_read_only,
            ),
            spawn_refresh_loop(ownership.clone(), state.clone(), agent_id.to_owned(), shutdown.clone()),
        ];

        info!(agent_id = %agent_id, session_id = %ownership.session_id(), "attached");
        Ok(Self { agent_id: agent_id.to_owned(), client, ownership, state, tail, shutdown, loops })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn session_id(&self) -> &str {
        self.ownership.session_id()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read_only.load(Ordering::SeqCst)
    }

    /// Stop the loops, release ownership (if still held), drop the tail.
    pub async fn detach(mut self) {
        self.shutdown.cancel();
        for handle in self.loops.drain(..) {
            let _ = handle.await;
        }
        self.tail.stop().await;

        let token = self.state.token.lock().clone();
        if let Some(token) = token {
            if let Err(e) = self.ownership.release(&self.agent_id, &token).await {
                warn!(agent_id = %self.agent_id, error = %e, "ownership release failed");
            }
        }
        info!(agent_id = %self.agent_id, "detached");
    }

    /// Queue text on the agent. Fails locally when read-only.
    pub async fn send_input(&self, text: &str) -> CrewResult<String> {
        let mut params = Params::new();
        params.insert("text".to_owned(), json!(text));
        params.insert("meta".to_owned(), json!({"source": "console"}));
        let reply = self.call_mutating(Method::Input, params).await?;
        Ok(reply.get("qid").and_then(|v| v.as_str()).unwrap_or_default().to_owned())
    }

    pub async fn status(&self) -> CrewResult<serde_json::Value> {
        self.client.call(Method::Status, Params::new()).await
    }

    pub async fn prompt_get(&self) -> CrewResult<serde_json::Value> {
        self.client.call(Method::PromptGet, Params::new()).await
    }

    pub async fn prompt_set_base(&self, base: &str) -> CrewResult<()> {
        let mut params = Params::new();
        params.insert("base".to_owned(), json!(base));
        self.call_mutating(Method::PromptSet, params).await.map(|_| ())
    }

    pub async fn prompt_reload(&self) -> CrewResult<()> {
        self.call_mutating(Method::PromptReload, Params::new()).await.map(|_| ())
    }

    pub async fn append_overlay(&self, line: &str) -> CrewResult<()> {
        let mut params = Params::new();
        params.insert("line".to_owned(), json!(line));
        self.call_mutating(Method::PromptOverlay, params).await.map(|_| ())
    }

    pub async fn interrupt(&self) -> CrewResult<()> {
        self.call_mutating(Method::Interrupt, Params::new()).await.map(|_| ())
    }

    pub async fn cancel(&self, hard: bool) -> CrewResult<()> {
        let mut params = Params::new();
        params.insert("hard".to_owned(), json!(hard));
        self.call_mutating(Method::Cancel, params).await.map(|_| ())
    }

    pub async fn clear_history(&self) -> CrewResult<()> {
        let mut params = Params::new();
        params.insert("confirm".to_owned(), json!(true));
        self.call_mutating(Method::HistoryClear, params).await.map(|_| ())
    }

    pub async fn kb_ingest(&self, paths: &[String], scope: &str) -> CrewResult<Vec<String>> {
        let mut params = Params::new();
        params.insert("paths".to_owned(), json!(paths));
        params.insert("scope".to_owned(), json!(scope));
        let reply = self.call_mutating(Method::KbIngest, params).await?;
        serde_json::from_value(reply.get("ids").cloned().unwrap_or(json!([])))
            .map_err(|e| ErrorInfo::new("kb.ingest_failed", e.to_string()))
    }

    pub async fn kb_search(&self, query: &str, scope: &str, k: usize) -> CrewResult<serde_json::Value> {
        let mut params = Params::new();
        params.insert("query".to_owned(), json!(query));
        params.insert("scope".to_owned(), json!(scope));
        params.insert("k".to_owned(), json!(k));
        self.client.call(Method::KbSearch, params).await
    }

    pub async fn kb_copy_from(&self, source_agent: &str, ids: &[String]) -> CrewResult<serde_json::Value> {
        let mut params = Params::new();
        params.insert("source_agent".to_owned(), json!(source_agent));
        params.insert("ids".to_owned(), json!(ids));
        self.call_mutating(Method::KbCopyFrom, params).await
    }

    /// Inject the owner token and refuse locally when read-only.
    async fn call_mutating(
        &self,
        method: Method,
        mut params: Params,
    ) -> CrewResult<serde_json::Value> {
        if self.is_read_only() {
            return Err(ErrorInfo::new(
                "ownership.not_owner",
                format!("session is read-only; {} was taken over", self.agent_id),
            ));
        }
        let token = self.state.token.lock().clone().ok_or_else(|| {
            ErrorInfo::new("ownership.not_owner", "session holds no owner token")
        })?;
        params.insert("token".to_owned(), json!(token));
        self.client.call(method, params).await
    }
}

/// Poll for a single-shot takeover notification; on receipt, drop the
/// token and flip to read-only.
fn spawn_notification_loop<G>(
    ownership: Arc<OwnershipManager>,
    state: Arc<SessionState>,
    agent_id: String,
    shutdown: CancellationToken,
    on_read_only: G,
) -> JoinHandle<()>
where
    G: Fn(TakeoverNotice) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(NOTIFY_POLL) => {}
                _ = shutdown.cancelled() => return,
            }
            match ownership.check_takeover_notification().await {
                Ok(Some(notice)) if notice.agent_id == agent_id => {
                    warn!(
                        agent_id = %agent_id,
                        new_session = %notice.new_session,
                        "ownership lost, session is now read-only"
                    );
                    *state.token.lock() = None;
                    state.read_only.store(true, Ordering::SeqCst);
                    on_read_only(notice);
                }
                Ok(_) => {}
                Err(e) => warn!(agent_id = %agent_id, error = %e, "notification poll failed"),
            }
        }
    })
}

/// Keep the ownership record's TTL refreshed while we hold the token.
fn spawn_refresh_loop(
    ownership: Arc<OwnershipManager>,
    state: Arc<SessionState>,
    agent_id: String,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = OWNERSHIP_TTL / 3;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.cancelled() => return,
            }
            let token = state.token.lock().clone();
            let Some(token) = token else { continue };
            if let Err(e) = ownership.refresh(&agent_id, &token).await {
                warn!(agent_id = %agent_id, error = %e, "ownership refresh failed");
            }
        }
    })
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
