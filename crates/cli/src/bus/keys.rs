// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus key and channel name templates.
//!
//! Every coordination key and channel used across the fleet is minted here
//! so the namespace stays greppable in one place.

/// Single-instance lock for a running agent process.
pub fn lock_key(agent_id: &str) -> String {
    format!("agent:lock:{agent_id}")
}

/// Presence record for a live agent.
pub fn registry_key(agent_id: &str) -> String {
    format!("agents:{agent_id}")
}

/// Glob covering all presence records.
pub const REGISTRY_SCAN: &str = "agents:*";

/// Heartbeat timestamp for a live agent.
pub fn heartbeat_key(agent_id: &str) -> String {
    format!("heartbeat:{agent_id}")
}

/// Glob covering all heartbeat keys.
pub const HEARTBEAT_SCAN: &str = "heartbeat:*";

/// Exclusive-writer ownership record.
pub fn owner_key(agent_id: &str) -> String {
    format!("agent:owner:{agent_id}")
}

/// Single-shot takeover notification addressed to a console session.
pub fn takeover_key(session_id: &str) -> String {
    format!("takeover:notify:{session_id}")
}

/// RPC request channel for an agent (the agent subscribes).
pub fn req_channel(agent_id: &str) -> String {
    format!("req:{agent_id}")
}

/// RPC reply channel for one in-flight request (the caller subscribes).
pub fn res_channel(agent_id: &str, req_id: &str) -> String {
    format!("res:{agent_id}:{req_id}")
}

/// Ordered tail-event channel for an agent.
pub fn tail_channel(agent_id: &str) -> String {
    format!("tail:{agent_id}")
}

/// Registry change events (added/updated/removed).
pub const REGISTRY_EVENTS_CHANNEL: &str = "registry:events";

/// Well-known RPC target for the orchestrator service.
pub const ORCHESTRATOR_TARGET: &str = "orchestrator";
