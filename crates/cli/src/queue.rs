// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable prompt queue: append-only JSONL log plus an in-memory FIFO.
//!
//! Every append is flushed to disk before the item id is returned, so a
//! crash after acknowledgment never loses input. Startup replays the log
//! in file order; unparseable lines are skipped with a warning.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::now_ts;
use crate::error::{CrewResult, ErrorInfo};

/// Where a queue item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueSource {
    Console,
    Local,
}

/// One queued prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub text: String,
    pub source: QueueSource,
    pub ts: f64,
}

/// FIFO prompt queue backed by `queue.jsonl`.
pub struct PromptQueue {
    path: PathBuf,
    items: Mutex<Vec<QueueItem>>,
}

impl PromptQueue {
    /// Open the queue, replaying any existing log.
    pub fn open(path: PathBuf) -> Self {
        let mut items = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<QueueItem>(line) {
                        Ok(item) => items.push(item),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping malformed queue line")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "queue log unreadable"),
        }
        if !items.is_empty() {
            info!(path = %path.display(), count = items.len(), "queue reloaded");
        }
        Self { path, items: Mutex::new(items) }
    }

    /// Append a prompt. The item is on disk before the id comes back.
    pub fn append(&self, text: &str, source: QueueSource) -> CrewResult<String> {
        let item = QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_owned(),
            source,
            ts: now_ts(),
        };
        self.persist(&item)
            .map_err(|e| ErrorInfo::new("queue.append_failed", e.to_string()))?;
        self.items.lock().push(item.clone());
        debug!(id = %item.id, source = ?source, "queue item appended");
        Ok(item.id)
    }

    fn persist(&self, item: &QueueItem) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }

    /// Head of the queue without removal.
    pub fn peek(&self) -> Option<QueueItem> {
        self.items.lock().first().cloned()
    }

    /// Remove and return the head.
    pub fn pop(&self) -> Option<QueueItem> {
        let mut items = self.items.lock();
        if items.is_empty() {
            None
        } else {
            let item = items.remove(0);
            debug!(id = %item.id, "queue item popped");
            Some(item)
        }
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Read-only snapshot in FIFO order.
    pub fn list(&self) -> Vec<QueueItem> {
        self.items.lock().clone()
    }

    /// Drop every queued item, in memory and on disk.
    pub fn clear(&self) -> CrewResult<()> {
        self.items.lock().clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ErrorInfo::new("queue.clear_failed", e.to_string())),
        }
        info!(path = %self.path.display(), "queue cleared");
        Ok(())
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
