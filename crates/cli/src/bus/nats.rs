// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS bus binding: core pub/sub for channels, JetStream KV for keys.
//!
//! Logical key names use `:` separators (`agent:lock:<id>`), which JetStream
//! KV key names do not allow, so keys are stored with `:` mapped to `.`.
//! Agent ids never contain `.`, making the mapping bijective. Per-key TTL is
//! carried in an 8-byte expiry prefix on the stored value; expired entries
//! read as absent and are purged lazily on access.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::now_ms;
use crate::error::{CrewResult, ErrorInfo};

use super::{glob_match, Bus, Subscription};

const KV_BUCKET: &str = "crew-coord";
const SUBJECT_PREFIX: &str = "crew";
const SUB_BUFFER: usize = 1024;

/// Production bus binding over a NATS server.
pub struct NatsBus {
    client: async_nats::Client,
    kv: jetstream::kv::Store,
    closed: AtomicBool,
}

impl NatsBus {
    /// Connect to the NATS server and open (or create) the coordination
    /// KV bucket.
    pub async fn connect(url: &str) -> CrewResult<Self> {
        info!(url = %url, "connecting to bus");
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect(url)
            .await
            .map_err(|e| ErrorInfo::new("bus.connect_failed", e.to_string()))?;

        let context = jetstream::new(client.clone());
        let kv = match context.get_key_value(KV_BUCKET).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(jetstream::kv::Config {
                    bucket: KV_BUCKET.to_owned(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| ErrorInfo::new("bus.connect_failed", e.to_string()))?,
        };

        info!("bus connected");
        Ok(Self { client, kv, closed: AtomicBool::new(false) })
    }

    fn ensure_open(&self) -> CrewResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorInfo::new("bus.not_connected", "bus is closed"));
        }
        Ok(())
    }

    /// Read a key and apply expiry, purging a stale entry.
    async fn get_live(&self, kv_key: &str) -> CrewResult<Option<Bytes>> {
        let raw = self
            .kv
            .get(kv_key)
            .await
            .map_err(|e| ErrorInfo::new("bus.get_failed", e.to_string()))?;
        let Some(raw) = raw else { return Ok(None) };
        match decode_envelope(&raw) {
            Some(value) => Ok(Some(value)),
            None => {
                // Expired (or garbage) — purge so scans stay clean.
                let _ = self.kv.purge(kv_key).await;
                Ok(None)
            }
        }
    }
}

/// Map a logical key (`agent:lock:demo/a`) to a KV key (`agent.lock.demo/a`).
fn encode_key(key: &str) -> String {
    key.replace(':', ".")
}

/// Inverse of [`encode_key`]; sound because logical names never contain `.`.
fn decode_key(kv_key: &str) -> String {
    kv_key.replace('.', ":")
}

/// Map a logical channel to a dotted NATS subject under the crew prefix.
fn encode_subject(channel: &str) -> String {
    let mut dotted = channel.replace([':', '/'], ".");
    if dotted.is_empty() {
        dotted.push('_');
    }
    format!("{SUBJECT_PREFIX}.{dotted}")
}

/// Prefix a value with its absolute expiry in unix milliseconds (0 = none).
fn encode_envelope(value: &Bytes, ttl: Option<Duration>) -> Bytes {
    let expires_at = ttl.map(|d| now_ms().saturating_add(d.as_millis() as u64)).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(8 + value.len());
    buf.extend_from_slice(&expires_at.to_be_bytes());
    buf.extend_from_slice(value);
    buf.freeze()
}

/// Strip the expiry prefix; `None` when the entry is expired or malformed.
fn decode_envelope(raw: &Bytes) -> Option<Bytes> {
    if raw.len() < 8 {
        return None;
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&raw[..8]);
    let expires_at = u64::from_be_bytes(prefix);
    if expires_at != 0 && now_ms() >= expires_at {
        return None;
    }
    Some(raw.slice(8..))
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> CrewResult<()> {
        self.ensure_open()?;
        self.client
            .publish(encode_subject(channel), payload)
            .await
            .map_err(|e| ErrorInfo::new("bus.publish_failed", e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> CrewResult<Subscription> {
        self.ensure_open()?;
        let mut subscriber = self
            .client
            .subscribe(encode_subject(channel))
            .await
            .map_err(|e| ErrorInfo::new("bus.subscribe_failed", e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUB_BUFFER);
        let name = channel.to_owned();
        let forward = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if tx.send(message.payload).await.is_err() {
                    break;
                }
            }
            debug!(channel = %name, "bus subscription closed");
        });
        Ok(Subscription::new(channel.to_owned(), rx, Some(forward)))
    }

    async fn set_key(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CrewResult<()> {
        self.ensure_open()?;
        self.kv
            .put(encode_key(key), encode_envelope(&value, ttl))
            .await
            .map(|_| ())
            .map_err(|e| ErrorInfo::new("bus.set_failed", e.to_string()))
    }

    async fn get_key(&self, key: &str) -> CrewResult<Option<Bytes>> {
        self.ensure_open()?;
        self.get_live(&encode_key(key)).await
    }

    async fn delete_key(&self, key: &str) -> CrewResult<()> {
        self.ensure_open()?;
        self.kv
            .purge(encode_key(key))
            .await
            .map_err(|e| ErrorInfo::new("bus.delete_failed", e.to_string()))
    }

    async fn scan_keys(&self, pattern: &str) -> CrewResult<Vec<String>> {
        self.ensure_open()?;
        let mut names = self
            .kv
            .keys()
            .await
            .map_err(|e| ErrorInfo::new("bus.scan_failed", e.to_string()))?;

        let mut matched = Vec::new();
        while let Some(entry) = names.next().await {
            let kv_key = entry.map_err(|e| ErrorInfo::new("bus.scan_failed", e.to_string()))?;
            let logical = decode_key(&kv_key);
            if !glob_match(pattern, &logical) {
                continue;
            }
            // Expiry lives in the value, so each candidate needs a read.
            if self.get_live(&kv_key).await?.is_some() {
                matched.push(logical);
            }
        }
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
        let kv_key = encode_key(key);
        let envelope = encode_envelope(&value, ttl);

        match self.kv.create(&kv_key, envelope.clone()).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == jetstream::kv::CreateErrorKind::AlreadyExists => {
                // The holder may be gone with only an expired envelope left
                // behind; reclaim it and retry the create once.
                if self.get_live(&kv_key).await?.is_some() {
                    return Ok(false);
                }
                match self.kv.create(&kv_key, envelope).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == jetstream::kv::CreateErrorKind::AlreadyExists => {
                        Ok(false)
                    }
                    Err(e) => Err(ErrorInfo::new("bus.set_failed", e.to_string())),
                }
            }
            Err(e) => Err(ErrorInfo::new("bus.set_failed", e.to_string())),
        }
    }

    async fn close(&self) -> CrewResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.client
            .flush()
            .await
            .map_err(|e| ErrorInfo::new("bus.call_failed", e.to_string()))
    }
}

#[cfg(test)]
#[path = "nats_tests.rs"]
mod tests;
