// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process bus binding backing standalone mode and the test suites.
//!
//! A `MemoryBus` clone shares the same hub, so several components (or
//! several simulated processes in a test) coordinate exactly as they would
//! over a real bus: same key space, same channels, same TTL semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::{CrewResult, ErrorInfo};

use super::{glob_match, Bus, Subscription};

const TOPIC_BUFFER: usize = 1024;

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

struct Hub {
    keys: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    closed: Mutex<bool>,
}

/// Shared-hub in-memory bus. Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct MemoryBus {
    hub: Arc<Hub>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                keys: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                closed: Mutex::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> CrewResult<()> {
        if *self.hub.closed.lock() {
            return Err(ErrorInfo::new("bus.not_connected", "bus is closed"));
        }
        Ok(())
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Bytes> {
        let mut topics = self.hub.topics.lock();
        topics
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }

    /// Drop an expired entry under the lock; returns the live value if any.
    fn get_live(keys: &mut HashMap<String, Entry>, key: &str) -> Option<Bytes> {
        match keys.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                keys.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> CrewResult<()> {
        self.ensure_open()?;
        // A send error only means no subscriber is currently listening,
        // which matches the lossy pub/sub contract.
        let _ = self.sender_for(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CrewResult<Subscription> {
        self.ensure_open()?;
        let mut source = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        let name = channel.to_owned();
        let forward = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(channel = %name, dropped = n, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(channel.to_owned(), rx, Some(forward)))
    }

    async fn set_key(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CrewResult<()> {
        self.ensure_open()?;
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.hub.keys.lock().insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn get_key(&self, key: &str) -> CrewResult<Option<Bytes>> {
        self.ensure_open()?;
        let mut keys = self.hub.keys.lock();
        Ok(Self::get_live(&mut keys, key))
    }

    async fn delete_key(&self, key: &str) -> CrewResult<()> {
        self.ensure_open()?;
        self.hub.keys.lock().remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> CrewResult<Vec<String>> {
        self.ensure_open()?;
        let mut keys = self.hub.keys.lock();
        keys.retain(|_, entry| entry.live());
        let mut matched: Vec<String> =
            keys.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
        matched.sort();
        Ok(matched)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CrewResult<bool> {
        self.ensure_open()?;
        let mut keys = self.hub.keys.lock();
        if Self::get_live(&mut keys, key).is_some() {
            return Ok(false);
        }
        let expires_at = ttl.map(|d| Instant::now() + d);
        keys.insert(key.to_owned(), Entry { value, expires_at });
        Ok(true)
    }

    async fn close(&self) -> CrewResult<()> {
        *self.hub.closed.lock() = true;
        self.hub.topics.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
