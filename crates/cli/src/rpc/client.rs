// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC client: one call = one fresh reply channel.
//!
//! The reply subscription is opened before the request is published so the
//! reply cannot slip through a subscribe race.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bus::{keys, Bus};
use crate::clock::now_ts;
use crate::defaults::RPC_TIMEOUT;
use crate::error::{CrewResult, ErrorInfo};

use super::{decode_reply, encode_request, Method, Params, RequestFrame};

/// Client half of the per-agent RPC channel pair.
#[derive(Clone)]
pub struct RpcClient {
    bus: Arc<dyn Bus>,
    target_id: String,
}

impl RpcClient {
    pub fn new(bus: Arc<dyn Bus>, target_id: String) -> Self {
        Self { bus, target_id }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Call with the default timeout.
    pub async fn call(&self, method: Method, params: Params) -> CrewResult<serde_json::Value> {
        self.call_with_timeout(method, params, RPC_TIMEOUT).await
    }

    /// Call with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        method: Method,
        params: Params,
        timeout: Duration,
    ) -> CrewResult<serde_json::Value> {
        let req_id = uuid::Uuid::new_v4().to_string();
        let frame = RequestFrame {
            req_id: req_id.clone(),
            method: method.as_str().to_owned(),
            params: serde_json::to_vec(&params)
                .map_err(|e| ErrorInfo::new("bus.call_failed", e.to_string()))?,
            ts: now_ts(),
        };
        let encoded = encode_request(&frame)?;

        // Subscribe before publish.
        let mut replies = self.bus.subscribe(&keys::res_channel(&self.target_id, &req_id)).await?;
        self.bus.publish(&keys::req_channel(&self.target_id), encoded).await?;
        debug!(target = %self.target_id, method = %method, req_id = %req_id, "rpc call sent");

        let raw = match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Err(ErrorInfo::new(
                    "bus.no_response",
                    format!("no reply for {method} from {}", self.target_id),
                ))
            }
            Err(_) => {
                return Err(ErrorInfo::new(
                    "bus.rpc_timeout",
                    format!("call to {method} on {} timed out", self.target_id),
                ))
            }
        };

        let reply = decode_reply(&raw)?;
        if reply.ok {
            serde_json::from_slice(&reply.payload)
                .map_err(|e| ErrorInfo::new("bus.call_failed", e.to_string()))
        } else {
            Err(serde_json::from_slice::<ErrorInfo>(&reply.payload)
                .unwrap_or_else(|_| ErrorInfo::new("rpc.error", "malformed error reply")))
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
