// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent request/response RPC over bus pub/sub.
//!
//! Requests go out on `req:<id>`; each caller subscribes a fresh
//! `res:<id>:<req_id>` reply channel before publishing. Frames are
//! prost-encoded envelopes; the open-ended params map travels as JSON bytes
//! inside the envelope so handlers keep a dynamic parameter surface while
//! the framing stays binary and bounded.

use bytes::Bytes;
use prost::Message as _;

use crate::defaults::MAX_RPC_PAYLOAD;
use crate::error::{CrewResult, ErrorInfo};

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::RpcServer;

/// JSON object used for RPC parameters and results.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// The closed set of RPC methods, replacing dispatch on raw strings.
///
/// Adding a method means adding a variant here and a handler registration;
/// there is no other registry to keep in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Status,
    Input,
    Interrupt,
    Cancel,
    PromptSet,
    PromptReload,
    PromptGet,
    PromptOverlay,
    KbIngest,
    KbSearch,
    KbCopyFrom,
    KbGetItems,
    HistoryClear,
    OrchestratorCreateAgent,
    OrchestratorSpawnAgent,
    OrchestratorListAgents,
    OrchestratorDeleteAgent,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Input => "input",
            Self::Interrupt => "interrupt",
            Self::Cancel => "cancel",
            Self::PromptSet => "prompt.set",
            Self::PromptReload => "prompt.reload",
            Self::PromptGet => "prompt.get",
            Self::PromptOverlay => "prompt.overlay",
            Self::KbIngest => "kb.ingest",
            Self::KbSearch => "kb.search",
            Self::KbCopyFrom => "kb.copy_from",
            Self::KbGetItems => "kb.get_items",
            Self::HistoryClear => "history.clear",
            Self::OrchestratorCreateAgent => "orchestrator.create_agent",
            Self::OrchestratorSpawnAgent => "orchestrator.spawn_agent",
            Self::OrchestratorListAgents => "orchestrator.list_agents",
            Self::OrchestratorDeleteAgent => "orchestrator.delete_agent",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "status" => Self::Status,
            "input" => Self::Input,
            "interrupt" => Self::Interrupt,
            "cancel" => Self::Cancel,
            "prompt.set" => Self::PromptSet,
            "prompt.reload" => Self::PromptReload,
            "prompt.get" => Self::PromptGet,
            "prompt.overlay" => Self::PromptOverlay,
            "kb.ingest" => Self::KbIngest,
            "kb.search" => Self::KbSearch,
            "kb.copy_from" => Self::KbCopyFrom,
            "kb.get_items" => Self::KbGetItems,
            "history.clear" => Self::HistoryClear,
            "orchestrator.create_agent" => Self::OrchestratorCreateAgent,
            "orchestrator.spawn_agent" => Self::OrchestratorSpawnAgent,
            "orchestrator.list_agents" => Self::OrchestratorListAgents,
            "orchestrator.delete_agent" => Self::OrchestratorDeleteAgent,
            _ => return None,
        })
    }

    /// Mutating methods require the caller's owner token.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Input
                | Self::Interrupt
                | Self::Cancel
                | Self::PromptSet
                | Self::PromptReload
                | Self::PromptOverlay
                | Self::KbIngest
                | Self::KbCopyFrom
                | Self::HistoryClear
        )
    }

    /// Particularly final methods additionally require `confirm=true`.
    pub fn requires_confirm(&self) -> bool {
        matches!(self, Self::HistoryClear)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope for a request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestFrame {
    #[prost(string, tag = "1")]
    pub req_id: String,
    #[prost(string, tag = "2")]
    pub method: String,
    /// JSON-encoded params object.
    #[prost(bytes = "vec", tag = "3")]
    pub params: Vec<u8>,
    #[prost(double, tag = "4")]
    pub ts: f64,
}

/// Wire envelope for a reply.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplyFrame {
    #[prost(string, tag = "1")]
    pub req_id: String,
    #[prost(bool, tag = "2")]
    pub ok: bool,
    /// JSON-encoded value when `ok`, JSON-encoded [`ErrorInfo`] otherwise.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(double, tag = "4")]
    pub ts: f64,
}

/// Encode a request, enforcing the payload bound.
pub fn encode_request(frame: &RequestFrame) -> CrewResult<Bytes> {
    let encoded = frame.encode_to_vec();
    if encoded.len() > MAX_RPC_PAYLOAD {
        return Err(ErrorInfo::new(
            "bus.call_failed",
            format!("request frame of {} bytes exceeds {} byte limit", encoded.len(), MAX_RPC_PAYLOAD),
        ));
    }
    Ok(Bytes::from(encoded))
}

/// Decode a request, rejecting oversized frames before parsing.
pub fn decode_request(raw: &[u8]) -> CrewResult<RequestFrame> {
    if raw.len() > MAX_RPC_PAYLOAD {
        return Err(ErrorInfo::new(
            "bus.call_failed",
            format!("request frame of {} bytes exceeds {} byte limit", raw.len(), MAX_RPC_PAYLOAD),
        ));
    }
    RequestFrame::decode(raw).map_err(|e| ErrorInfo::new("bus.call_failed", e.to_string()))
}

pub fn encode_reply(frame: &ReplyFrame) -> Bytes {
    Bytes::from(frame.encode_to_vec())
}

pub fn decode_reply(raw: &[u8]) -> CrewResult<ReplyFrame> {
    ReplyFrame::decode(raw).map_err(|e| ErrorInfo::new("bus.call_failed", e.to_string()))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
