// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Conversation history: append-only turn log plus the summary chain.
//!
//! Turns are flushed to `history.jsonl` before an append returns. When the
//! summarizer folds turns into a digest, the turn log is rewritten
//! atomically to the preserved set so a restart reconstructs exactly the
//! post-summary state. Summaries land in `summary.jsonl`; past the chain
//! limit they are compacted into a single aggregate.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CrewResult, ErrorInfo};
use crate::model::ModelProvider;
use crate::summarize::{render_turns, Strategy, SummarizeConfig, SummarizeEngine, Summary};
use crate::tail::{self, TailEvent};

/// Speaker of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    /// Capitalized form used when rendering "Role: content".
    pub fn title(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::Tool => "Tool",
            Self::System => "System",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub ts: f64,
    pub role: Role,
    pub source: String,
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

/// Turn log + summary chain backed by two JSONL files.
pub struct HistoryStore {
    history_path: PathBuf,
    summary_path: PathBuf,
    engine: SummarizeEngine,
    turns: Mutex<Vec<Turn>>,
    summaries: Mutex<Vec<Summary>>,
}

impl HistoryStore {
    /// Open the store, replaying both logs. Malformed lines are skipped;
    /// summary lines from older formats are kept as opaque digests.
    pub fn open(history_path: PathBuf, summary_path: PathBuf, config: SummarizeConfig) -> Self {
        let turns = load_lines(&history_path, |line| match serde_json::from_str::<Turn>(line) {
            Ok(turn) => Some(turn),
            Err(e) => {
                warn!(path = %history_path.display(), error = %e, "skipping malformed history line");
                None
            }
        });
        let summaries = load_lines(&summary_path, |line| parse_summary_line(&summary_path, line));
        if !turns.is_empty() || !summaries.is_empty() {
            info!(
                turns = turns.len(),
                summaries = summaries.len(),
                "history reloaded"
            );
        }
        Self {
            history_path,
            summary_path,
            engine: SummarizeEngine::new(config),
            turns: Mutex::new(turns),
            summaries: Mutex::new(summaries),
        }
    }

    /// Append a turn; it is on disk before this returns.
    pub fn append(&self, turn: Turn) -> CrewResult<()> {
        append_line(&self.history_path, &turn)
            .map_err(|e| ErrorInfo::new("history.append_failed", e.to_string()))?;
        self.turns.lock().push(turn);
        Ok(())
    }

    /// Trailing `n` turns.
    pub fn tail(&self, n: usize) -> Vec<Turn> {
        let turns = self.turns.lock();
        let skip = turns.len().saturating_sub(n);
        turns[skip..].to_vec()
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.lock().clone()
    }

    pub fn size(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn summaries(&self) -> Vec<Summary> {
        self.summaries.lock().clone()
    }

    /// Total token mass across unsummarized turns.
    pub fn unsummarized_tokens(&self) -> u64 {
        self.turns
            .lock()
            .iter()
            .map(|t| u64::from(t.tokens_in) + u64::from(t.tokens_out))
            .sum()
    }

    /// Fold the current turns into a summary, keeping preserved turns.
    ///
    /// Returns `history.no_turns` when there is nothing at all and
    /// `history.summarization_not_needed` when the strategy does not fire
    /// (or everything would be preserved).
    pub async fn summarize(
        &self,
        model: Option<&Arc<dyn ModelProvider>>,
    ) -> CrewResult<Summary> {
        let turns = self.turns.lock().clone();
        if turns.is_empty() {
            return Err(ErrorInfo::new("history.no_turns", "no turns to summarize"));
        }
        let current_tokens: u64 =
            turns.iter().map(|t| u64::from(t.tokens_in) + u64::from(t.tokens_out)).sum();
        if !self.engine.should_summarize(&turns, current_tokens) {
            return Err(ErrorInfo::new(
                "history.summarization_not_needed",
                "strategy did not trigger for the current turns",
            ));
        }

        let (fold, preserved) = self.engine.split(&turns);
        let summary = self.engine.build_summary(&fold, preserved.clone(), model).await?;

        append_line(&self.summary_path, &summary)
            .map_err(|e| ErrorInfo::new("history.summarize_failed", e.to_string()))?;
        *self.turns.lock() = preserved;
        self.rewrite_history()
            .map_err(|e| ErrorInfo::new("history.summarize_failed", e.to_string()))?;

        let needs_compaction = {
            let mut summaries = self.summaries.lock();
            summaries.push(summary.clone());
            summaries.len() > self.engine.config().max_summaries
        };
        if needs_compaction {
            self.compact()?;
        }
        Ok(summary)
    }

    /// Collapse the summary chain into a single aggregate summary.
    pub fn compact(&self) -> CrewResult<()> {
        let chain = self.summaries.lock().clone();
        if chain.len() <= 1 {
            return Ok(());
        }
        let aggregate = self.engine.compact(&chain);
        rewrite_atomic(&self.summary_path, std::slice::from_ref(&aggregate))
            .map_err(|e| ErrorInfo::new("history.compaction_failed", e.to_string()))?;
        *self.summaries.lock() = vec![aggregate];
        info!(original = chain.len(), "summary chain compacted");
        Ok(())
    }

    /// Drop all turns and summaries. Gated on an explicit confirmation.
    pub fn clear(&self, confirm: bool) -> CrewResult<()> {
        if !confirm {
            return Err(ErrorInfo::new(
                "history.confirm_required",
                "pass confirm=true to clear history",
            ));
        }
        self.turns.lock().clear();
        self.summaries.lock().clear();
        for path in [&self.history_path, &self.summary_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ErrorInfo::new("history.clear_failed", e.to_string())),
            }
        }
        info!("history cleared");
        Ok(())
    }

    /// Rebuild the model context after a restart: the summary chain, the
    /// trailing raw turns, and optionally a digest of recent tail activity.
    pub fn reconstruct_context(&self, tail_events: &[TailEvent]) -> String {
        let turns = self.turns.lock().clone();
        let summaries = self.summaries.lock().clone();
        let mut parts = Vec::new();

        if !summaries.is_empty() {
            let rendered = summaries
                .iter()
                .enumerate()
                .map(|(k, s)| format!("Summary {}: {}", k + 1, s.content))
                .collect::<Vec<_>>()
                .join("\n\n");
            parts.push(format!("Previous conversation summaries:\n{rendered}"));
        }
        if !turns.is_empty() {
            parts.push(format!("Recent conversation:\n{}", render_turns(&turns)));
        }
        if !tail_events.is_empty() {
            parts.push(format!("Recent activity:\n{}", tail::digest(tail_events)));
        }

        if parts.is_empty() {
            "No conversation history available.".to_owned()
        } else {
            parts.join("\n\n")
        }
    }

    fn rewrite_history(&self) -> std::io::Result<()> {
        let turns = self.turns.lock().clone();
        rewrite_atomic(&self.history_path, &turns)
    }
}

fn load_lines<T>(path: &Path, mut parse: impl FnMut(&str) -> Option<T>) -> Vec<T> {
    let mut out = Vec::new();
    match std::fs::read_to_string(path) {
        Ok(content) => {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(value) = parse(line) {
                    out.push(value);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "log unreadable"),
    }
    out
}

/// Parse a summary line, downgrading unknown shapes to an opaque digest.
fn parse_summary_line(path: &Path, line: &str) -> Option<Summary> {
    if let Ok(summary) = serde_json::from_str::<Summary>(line) {
        return Some(summary);
    }
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping malformed summary line");
            return None;
        }
    };
    let content = value
        .get("summary")
        .or_else(|| value.get("content"))
        .and_then(|v| v.as_str())?
        .to_owned();
    Some(Summary {
        id: format!("legacy-{}", uuid::Uuid::new_v4()),
        ts: value.get("ts").and_then(|v| v.as_f64()).unwrap_or(0.0),
        strategy: Strategy::Legacy,
        turn_count: value.get("turn_count").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
        token_count: value.get("total_tokens_in").and_then(|v| v.as_u64()).unwrap_or(0)
            + value.get("total_tokens_out").and_then(|v| v.as_u64()).unwrap_or(0),
        content,
        metadata: serde_json::json!({"legacy": true}),
        preserved_turns: Vec::new(),
    })
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}

/// Write all records to a temp file and rename it into place.
fn rewrite_atomic<T: Serialize>(path: &Path, records: &[T]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
