// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus transport abstraction: pub/sub channels plus keyed values with TTL.
//!
//! The coordination substrate is consumed through the [`Bus`] trait so the
//! rest of the runtime never touches a concrete client. Two bindings exist:
//! [`nats::NatsBus`] for production and [`memory::MemoryBus`] for standalone
//! mode and tests. Subscriptions hand back a channel-backed [`Subscription`]
//! instead of registering callbacks; consumers drain it from their own task.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::CrewResult;

pub mod keys;
pub mod memory;
pub mod nats;

/// Shared coordination substrate: publish/subscribe plus a keyed value
/// store with per-key TTL, glob scans, and conditional set.
///
/// Every operation returns a tagged error rather than panicking; connection
/// loss surfaces as `bus.*` errors and callers decide whether to retry.
/// Messages published while a subscriber is disconnected are lost — the
/// presence and tail layers are built to tolerate gaps.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> CrewResult<()>;

    /// Subscribe to a channel. Each live subscription sees each message
    /// exactly once, in publication order.
    async fn subscribe(&self, channel: &str) -> CrewResult<Subscription>;

    /// Set a key, optionally with a TTL after which it reads as absent.
    async fn set_key(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CrewResult<()>;

    /// Get a key's value, or `None` if absent or expired.
    async fn get_key(&self, key: &str) -> CrewResult<Option<Bytes>>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete_key(&self, key: &str) -> CrewResult<()>;

    /// List live keys matching a glob pattern (`*` matches any run of
    /// characters, `?` a single character).
    async fn scan_keys(&self, pattern: &str) -> CrewResult<Vec<String>>;

    /// Set a key only if it is currently absent (or expired). Returns
    /// `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>)
        -> CrewResult<bool>;

    /// Close the underlying connection. Further calls fail with
    /// `bus.not_connected`.
    async fn close(&self) -> CrewResult<()>;
}

/// A live channel subscription.
///
/// Dropping the subscription tears down the forwarding task and, for the
/// NATS binding, the server-side subscription with it.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<Bytes>,
    forward: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        rx: mpsc::Receiver<Bytes>,
        forward: Option<JoinHandle<()>>,
    ) -> Self {
        Self { channel, rx, forward }
    }

    /// Receive the next message. Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking receive for drain loops.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.forward.take() {
            handle.abort();
        }
    }
}

/// Match a key name against a glob pattern (`*` and `?` wildcards).
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    match regex::Regex::new(&regex) {
        Ok(re) => re.is_match(name),
        Err(_) => false,
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
