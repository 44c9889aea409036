// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC server: subscribes an agent's request channel and dispatches frames
//! to registered handlers.
//!
//! Ownership is enforced here, not in handlers: every mutating method must
//! carry a `token` param matching the live ownership record, and confirm-
//! gated methods must carry `confirm=true`. Requests are handled in the
//! order they are dequeued.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{keys, Bus};
use crate::clock::now_ts;
use crate::error::{CrewResult, ErrorInfo};
use crate::ownership::OwnershipOracle;

use super::{
    decode_request, encode_reply, Method, Params, ReplyFrame, RequestFrame,
};

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = CrewResult<serde_json::Value>> + Send>>;

/// A registered method handler.
pub type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

/// Per-target RPC server.
pub struct RpcServer {
    bus: Arc<dyn Bus>,
    target_id: String,
    oracle: Arc<dyn OwnershipOracle>,
    handlers: HashMap<Method, Handler>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub fn new(bus: Arc<dyn Bus>, target_id: String, oracle: Arc<dyn OwnershipOracle>) -> Self {
        Self {
            bus,
            target_id,
            oracle,
            handlers: HashMap::new(),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Register a handler. Re-registering a method replaces the handler.
    pub fn register(&mut self, method: Method, handler: Handler) {
        self.handlers.insert(method, handler);
    }

    /// Convenience for closures returning a boxed future.
    pub fn register_fn<F>(&mut self, method: Method, f: F)
    where
        F: Fn(Params) -> HandlerFuture + Send + Sync + 'static,
    {
        self.register(method, Arc::new(f));
    }

    /// Subscribe the request channel and start serving.
    pub async fn start(&mut self) -> CrewResult<()> {
        let mut sub = self.bus.subscribe(&keys::req_channel(&self.target_id)).await?;
        let bus = self.bus.clone();
        let target_id = self.target_id.clone();
        let oracle = self.oracle.clone();
        let handlers = self.handlers.clone();
        let shutdown = self.shutdown.clone();

        self.handle = Some(tokio::spawn(async move {
            info!(target = %target_id, "rpc server listening");
            loop {
                let raw = tokio::select! {
                    raw = sub.recv() => raw,
                    _ = shutdown.cancelled() => break,
                };
                let Some(raw) = raw else { break };

                let frame = match decode_request(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(target = %target_id, error = %e, "dropping undecodable request");
                        continue;
                    }
                };
                let reply = dispatch(&target_id, &oracle, &handlers, &frame).await;
                let channel = keys::res_channel(&target_id, &frame.req_id);
                if let Err(e) = bus.publish(&channel, encode_reply(&reply)).await {
                    warn!(target = %target_id, error = %e, "reply publish failed");
                }
            }
            info!(target = %target_id, "rpc server stopped");
        }));
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Decode params, vet ownership and confirmation, run the handler, and
/// fold any failure into an error reply.
async fn dispatch(
    target_id: &str,
    oracle: &Arc<dyn OwnershipOracle>,
    handlers: &HashMap<Method, Handler>,
    frame: &RequestFrame,
) -> ReplyFrame {
    let req_id = frame.req_id.clone();

    let Some(method) = Method::from_name(&frame.method) else {
        return error_reply(
            req_id,
            ErrorInfo::new("rpc.no_such_method", format!("unknown method '{}'", frame.method)),
        );
    };

    let params: Params = if frame.params.is_empty() {
        Params::new()
    } else {
        match serde_json::from_slice(&frame.params) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => {
                return error_reply(
                    req_id,
                    ErrorInfo::new("rpc.error", "params must be a JSON object"),
                )
            }
            Err(e) => return error_reply(req_id, ErrorInfo::new("rpc.error", e.to_string())),
        }
    };

    if method.is_mutating() {
        let token = params.get("token").and_then(|v| v.as_str()).unwrap_or_default();
        match oracle.is_owner(target_id, token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(target = %target_id, method = %method, "rejecting call without owner token");
                return error_reply(
                    req_id,
                    ErrorInfo::new(
                        "ownership.not_owner",
                        format!("caller does not own agent {target_id}"),
                    ),
                );
            }
            Err(e) => return error_reply(req_id, e),
        }
    }

    if method.requires_confirm()
        && !params.get("confirm").and_then(|v| v.as_bool()).unwrap_or(false)
    {
        return error_reply(
            req_id,
            ErrorInfo::new(
                "history.confirm_required",
                format!("{method} requires confirm=true"),
            ),
        );
    }

    let Some(handler) = handlers.get(&method) else {
        return error_reply(
            req_id,
            ErrorInfo::new("rpc.no_such_method", format!("no handler for '{method}'")),
        );
    };

    match handler(params).await {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(payload) => ReplyFrame { req_id, ok: true, payload, ts: now_ts() },
            Err(e) => error_reply(req_id, ErrorInfo::new("rpc.handler.error", e.to_string())),
        },
        Err(e) => error_reply(req_id, e),
    }
}

fn error_reply(req_id: String, error: ErrorInfo) -> ReplyFrame {
    let payload = serde_json::to_vec(&error).unwrap_or_default();
    ReplyFrame { req_id, ok: false, payload, ts: now_ts() }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
