// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ordered tail-event stream: tokens, tool calls, task lifecycle.
//!
//! The emitter stamps every event with a strictly increasing per-agent
//! offset, keeps the most recent records in a bounded ring for replay, and
//! publishes each record on `tail:<id>`. Consumers tolerate gaps (the bus
//! is lossy across disconnects) but never see reordering from one emitter.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{keys, Bus};
use crate::clock::now_ts;
use crate::defaults::{MAX_TAIL_FRAME, TAIL_RING_CAPACITY};
use crate::error::CrewResult;

/// Closed set of tail event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TailEvent {
    #[serde(rename = "token")]
    Token { text: String, model: String },
    #[serde(rename = "tool.start")]
    ToolStart { tool: String, arguments: serde_json::Value },
    #[serde(rename = "tool.result")]
    ToolResult { tool: String, result: serde_json::Value },
    #[serde(rename = "tool.end")]
    ToolEnd { tool: String },
    #[serde(rename = "tool")]
    Tool { name: String },
    #[serde(rename = "task.start")]
    TaskStart { id: String, prompt_id: String },
    #[serde(rename = "task.end")]
    TaskEnd { id: String, ok: bool },
    #[serde(rename = "warn")]
    Warn { msg: String },
    #[serde(rename = "error")]
    Error {
        msg: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
}

/// One record on the tail stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailRecord {
    pub offset: u64,
    pub ts: f64,
    pub event: TailEvent,
}

/// Capability interface for components that produce tail events.
///
/// The task runner talks to a sink, not to the emitter directly; standalone
/// mode plugs in [`NoopSink`] instead of branching on an `Option`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TailEvent);
}

/// Sink that drops everything (standalone mode).
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn emit(&self, _event: TailEvent) {}
}

struct EmitterState {
    offset: u64,
    ring: VecDeque<TailRecord>,
}

/// Agent-side tail emitter with an in-memory replay ring.
pub struct TailEmitter {
    agent_id: String,
    bus: Arc<dyn Bus>,
    capacity: usize,
    state: Mutex<EmitterState>,
}

impl TailEmitter {
    pub fn new(bus: Arc<dyn Bus>, agent_id: String) -> Self {
        Self::with_capacity(bus, agent_id, TAIL_RING_CAPACITY)
    }

    pub fn with_capacity(bus: Arc<dyn Bus>, agent_id: String, capacity: usize) -> Self {
        Self {
            agent_id,
            bus,
            capacity,
            state: Mutex::new(EmitterState { offset: 0, ring: VecDeque::with_capacity(capacity) }),
        }
    }

    /// Stamp, ring-append, and publish an event. Returns the offset.
    pub async fn publish(&self, event: TailEvent) -> CrewResult<u64> {
        let record = {
            let mut state = self.state.lock();
            state.offset += 1;
            let record = TailRecord { offset: state.offset, ts: now_ts(), event: clamp(event) };
            if state.ring.len() == self.capacity {
                state.ring.pop_front();
            }
            state.ring.push_back(record.clone());
            record
        };

        let raw = serde_json::to_vec(&record)
            .map_err(|e| crate::error::ErrorInfo::new("bus.publish_failed", e.to_string()))?;
        self.bus.publish(&keys::tail_channel(&self.agent_id), Bytes::from(raw)).await?;
        debug!(agent_id = %self.agent_id, offset = record.offset, "tail event published");
        Ok(record.offset)
    }

    /// Ring entries with offset strictly greater than `offset`.
    pub fn replay_from(&self, offset: u64) -> Vec<TailRecord> {
        self.state.lock().ring.iter().filter(|r| r.offset > offset).cloned().collect()
    }

    /// Highest offset assigned so far (0 before the first event).
    pub fn current_offset(&self) -> u64 {
        self.state.lock().offset
    }

    /// The most recent `count` event payloads, oldest first. Used for
    /// restart-context reconstruction.
    pub fn recent_events(&self, count: usize) -> Vec<TailEvent> {
        let state = self.state.lock();
        let skip = state.ring.len().saturating_sub(count);
        state.ring.iter().skip(skip).map(|r| r.event.clone()).collect()
    }
}

#[async_trait]
impl EventSink for TailEmitter {
    async fn emit(&self, event: TailEvent) {
        if let Err(e) = self.publish(event).await {
            warn!(agent_id = %self.agent_id, error = %e, "tail emit failed");
        }
    }
}

/// Keep frames under the tail bound by truncating the oversized text
/// fields producers are allowed to send.
fn clamp(event: TailEvent) -> TailEvent {
    // Leave generous headroom for the envelope and JSON escaping.
    let budget = MAX_TAIL_FRAME / 2;
    match event {
        TailEvent::Token { text, model } => {
            TailEvent::Token { text: truncate(text, budget), model }
        }
        TailEvent::ToolResult { tool, result } => {
            let compact = serde_json::to_string(&result).unwrap_or_default();
            if compact.len() > budget {
                TailEvent::ToolResult {
                    tool,
                    result: serde_json::Value::String(truncate(compact, budget)),
                }
            } else {
                TailEvent::ToolResult { tool, result }
            }
        }
        TailEvent::Error { msg, trace } => TailEvent::Error {
            msg: truncate(msg, budget),
            trace: trace.map(|t| truncate(t, budget)),
        },
        TailEvent::Warn { msg } => TailEvent::Warn { msg: truncate(msg, budget) },
        other => other,
    }
}

fn truncate(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = text[..cut].to_owned();
    out.push_str("…[truncated]");
    out
}

/// Console-side subscriber: decodes records and hands them to a callback.
pub struct TailSubscriber {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TailSubscriber {
    /// Subscribe `tail:<id>` and invoke `handler` per decoded record.
    /// Records with unknown event types are logged and dropped.
    pub async fn start<F>(bus: Arc<dyn Bus>, agent_id: &str, handler: F) -> CrewResult<Self>
    where
        F: Fn(TailRecord) + Send + Sync + 'static,
    {
        let mut sub = bus.subscribe(&keys::tail_channel(agent_id)).await?;
        let shutdown = CancellationToken::new();
        let loop_shutdown = shutdown.clone();
        let id = agent_id.to_owned();
        let handle = tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    raw = sub.recv() => raw,
                    _ = loop_shutdown.cancelled() => break,
                };
                let Some(raw) = raw else { break };
                if let Some(record) = decode_record(&raw) {
                    handler(record);
                }
            }
            debug!(agent_id = %id, "tail subscriber stopped");
        });
        Ok(Self { shutdown, handle: Some(handle) })
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Decode one tail frame; unknown event types come back as `None`.
pub fn decode_record(raw: &[u8]) -> Option<TailRecord> {
    match serde_json::from_slice::<TailRecord>(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(error = %e, "dropping unrecognized tail frame");
            None
        }
    }
}

/// Render a window of tail events as a short activity digest for restart
/// context. Token chunks are deliberately excluded.
pub fn digest(events: &[TailEvent]) -> String {
    let mut lines = Vec::new();
    for event in events {
        match event {
            TailEvent::Token { .. } | TailEvent::ToolResult { .. } | TailEvent::ToolEnd { .. } => {}
            TailEvent::ToolStart { tool, .. } => lines.push(format!("Tool call: {tool}")),
            TailEvent::Tool { name } => lines.push(format!("Tool call: {name}")),
            TailEvent::TaskStart { .. } => lines.push("Task started".to_owned()),
            TailEvent::TaskEnd { ok, .. } => {
                lines.push(format!("Task completed: {}", if *ok { "success" } else { "failed" }))
            }
            TailEvent::Warn { msg } => lines.push(format!("Warning: {msg}")),
            TailEvent::Error { msg, .. } => lines.push(format!("Error: {msg}")),
        }
    }
    if lines.is_empty() {
        "No recent activity".to_owned()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
#[path = "tail_tests.rs"]
mod tests;
