// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Knowledge-base adapter: scope-indexed CRUD + search.
//!
//! The storage engine proper is an external collaborator; the runtime only
//! consumes this interface. [`FileKbStore`] is the bundled implementation —
//! one JSONL collection per scope with token-overlap search — which is
//! enough for ingest, search, and copy-between-agents flows.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::now_ts;
use crate::error::{CrewResult, ErrorInfo};

/// Which collection an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Agent,
    Project,
    User,
}

impl Scope {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "agent" => Some(Self::Agent),
            "project" => Some(Self::Project),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbItem {
    pub id: String,
    pub source: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub ts: f64,
}

/// A search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbHit {
    pub id: String,
    pub source: String,
    pub score: f64,
    pub snippet: String,
}

/// Scope-indexed CRUD + search, the only surface the runtime touches.
pub trait KbStore: Send + Sync {
    /// Ingest files by path, returning the new document ids.
    fn ingest(
        &self,
        paths: &[String],
        scope: Scope,
        metadata: Option<serde_json::Value>,
    ) -> CrewResult<Vec<String>>;

    /// Insert one document directly (used by copy-between-agents).
    fn insert(&self, scope: Scope, item: KbItem) -> CrewResult<String>;

    /// Top-k search within a scope.
    fn search(&self, query: &str, scope: Scope, k: usize) -> CrewResult<Vec<KbHit>>;

    /// Page through a scope's documents.
    fn get_items(&self, scope: Scope, limit: usize, offset: usize) -> CrewResult<Vec<KbItem>>;

    /// Fetch specific documents by id.
    fn get_by_ids(&self, scope: Scope, ids: &[String]) -> CrewResult<Vec<KbItem>>;
}

struct Collection {
    path: PathBuf,
    items: Vec<KbItem>,
}

impl Collection {
    fn open(path: PathBuf) -> Self {
        let mut items = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    match serde_json::from_str::<KbItem>(line) {
                        Ok(item) => items.push(item),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping malformed kb line")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "kb collection unreadable"),
        }
        Self { path, items }
    }

    fn append(&mut self, item: KbItem) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(&item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        self.items.push(item);
        Ok(())
    }
}

/// JSONL-backed store with one collection per scope.
pub struct FileKbStore {
    agent: Mutex<Collection>,
    project: Mutex<Collection>,
    user: Mutex<Collection>,
}

impl FileKbStore {
    /// `agent_dir` / `project_dir` / `user_dir` each get a `kb/items.jsonl`.
    pub fn open(agent_dir: PathBuf, project_dir: PathBuf, user_dir: PathBuf) -> Self {
        Self {
            agent: Mutex::new(Collection::open(agent_dir.join("kb").join("items.jsonl"))),
            project: Mutex::new(Collection::open(project_dir.join("kb").join("items.jsonl"))),
            user: Mutex::new(Collection::open(user_dir.join("kb").join("items.jsonl"))),
        }
    }

    fn collection(&self, scope: Scope) -> &Mutex<Collection> {
        match scope {
            Scope::Agent => &self.agent,
            Scope::Project => &self.project,
            Scope::User => &self.user,
        }
    }
}

impl KbStore for FileKbStore {
    fn ingest(
        &self,
        paths: &[String],
        scope: Scope,
        metadata: Option<serde_json::Value>,
    ) -> CrewResult<Vec<String>> {
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        let mut ids = Vec::new();
        let mut collection = self.collection(scope).lock();
        for path in paths {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ErrorInfo::new("kb.ingest_failed", format!("{path}: {e}")))?;
            if content.trim().is_empty() {
                warn!(path = %path, "skipping empty document");
                continue;
            }
            let item = KbItem {
                id: uuid::Uuid::new_v4().to_string(),
                source: path.clone(),
                content,
                metadata: metadata.clone(),
                ts: now_ts(),
            };
            let id = item.id.clone();
            collection
                .append(item)
                .map_err(|e| ErrorInfo::new("kb.ingest_failed", e.to_string()))?;
            ids.push(id);
        }
        info!(scope = %scope.as_str(), count = ids.len(), "kb ingest complete");
        Ok(ids)
    }

    fn insert(&self, scope: Scope, mut item: KbItem) -> CrewResult<String> {
        if item.id.is_empty() {
            item.id = uuid::Uuid::new_v4().to_string();
        }
        let id = item.id.clone();
        self.collection(scope)
            .lock()
            .append(item)
            .map_err(|e| ErrorInfo::new("kb.copy_failed", e.to_string()))?;
        Ok(id)
    }

    fn search(&self, query: &str, scope: Scope, k: usize) -> CrewResult<Vec<KbHit>> {
        let needles: HashSet<String> = tokenize(query).into_iter().collect();
        if needles.is_empty() {
            return Ok(Vec::new());
        }
        let collection = self.collection(scope).lock();
        let mut hits: Vec<KbHit> = collection
            .items
            .iter()
            .filter_map(|item| {
                let words: HashSet<String> = tokenize(&item.content).into_iter().collect();
                if words.is_empty() {
                    return None;
                }
                let matched = needles.iter().filter(|n| words.contains(*n)).count();
                if matched == 0 {
                    return None;
                }
                Some(KbHit {
                    id: item.id.clone(),
                    source: item.source.clone(),
                    score: matched as f64 / needles.len() as f64,
                    snippet: snippet(&item.content),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    fn get_items(&self, scope: Scope, limit: usize, offset: usize) -> CrewResult<Vec<KbItem>> {
        let collection = self.collection(scope).lock();
        Ok(collection.items.iter().skip(offset).take(limit).cloned().collect())
    }

    fn get_by_ids(&self, scope: Scope, ids: &[String]) -> CrewResult<Vec<KbItem>> {
        let wanted: HashSet<&String> = ids.iter().collect();
        let collection = self.collection(scope).lock();
        Ok(collection.items.iter().filter(|i| wanted.contains(&i.id)).cloned().collect())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

fn snippet(content: &str) -> String {
    const MAX: usize = 160;
    let trimmed = content.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_owned();
    }
    let mut cut = MAX;
    while cut > 0 && !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

#[cfg(test)]
#[path = "kb_tests.rs"]
mod tests;
