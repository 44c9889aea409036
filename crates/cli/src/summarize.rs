// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Summarization strategies for conversation history.
//!
//! A strategy decides *when* to compact (token pressure, elapsed time,
//! density of important turns, or a hybrid) and *what the digest says*.
//! Turns carrying tool calls are preserved verbatim rather than folded into
//! the digest. With no model available the digest falls back to the
//! statistical form regardless of strategy.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::now_ts;
use crate::error::{CrewResult, ErrorInfo};
use crate::history::{Role, Turn};
use crate::model::ModelProvider;

/// User turns longer than this count as important.
const IMPORTANT_USER_CHARS: usize = 200;

/// When to trigger summarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    TokenBased,
    TimeBased,
    ImportanceBased,
    Hybrid,
    /// Tag found in summaries written by older releases; treated as opaque.
    Legacy,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBased => "token_based",
            Self::TimeBased => "time_based",
            Self::ImportanceBased => "importance_based",
            Self::Hybrid => "hybrid",
            Self::Legacy => "legacy",
        }
    }
}

// Unknown tags from older releases deserialize as `Legacy` instead of
// failing the whole summary line.
impl<'de> Deserialize<'de> for Strategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "token_based" => Self::TokenBased,
            "time_based" => Self::TimeBased,
            "importance_based" => Self::ImportanceBased,
            "hybrid" => Self::Hybrid,
            _ => Self::Legacy,
        })
    }
}

/// Tuning for the engine.
#[derive(Debug, Clone)]
pub struct SummarizeConfig {
    pub strategy: Strategy,
    /// Unsummarized token mass that triggers the token-based rule.
    pub token_threshold: u64,
    /// First-to-last turn timespan that triggers the time-based rule.
    pub time_threshold: Duration,
    /// Important-turn fraction that triggers the importance-based rule.
    pub importance_threshold: f64,
    /// Summary-chain length past which compaction runs.
    pub max_summaries: usize,
    /// Keep turns with tool calls out of the digest.
    pub preserve_tool_calls: bool,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::TokenBased,
            token_threshold: 1000,
            time_threshold: Duration::from_secs(3600),
            importance_threshold: 0.7,
            max_summaries: crate::defaults::MAX_SUMMARIES,
            preserve_tool_calls: true,
        }
    }
}

/// One summary in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub ts: f64,
    pub strategy: Strategy,
    /// Turns folded into this digest.
    pub turn_count: usize,
    /// Token mass folded into this digest.
    pub token_count: u64,
    pub content: String,
    pub metadata: serde_json::Value,
    /// Turns excluded from compaction (tool calls, marked important).
    #[serde(default)]
    pub preserved_turns: Vec<Turn>,
}

/// Strategy evaluation and digest construction.
#[derive(Debug, Clone)]
pub struct SummarizeEngine {
    config: SummarizeConfig,
}

impl SummarizeEngine {
    pub fn new(config: SummarizeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SummarizeConfig {
        &self.config
    }

    /// Should the current unsummarized turns be compacted?
    pub fn should_summarize(&self, turns: &[Turn], current_tokens: u64) -> bool {
        if turns.is_empty() {
            return false;
        }
        match self.config.strategy {
            Strategy::TokenBased => current_tokens >= self.config.token_threshold,
            Strategy::TimeBased => self.time_trigger(turns),
            Strategy::ImportanceBased => {
                let important = turns.iter().filter(|t| is_important(t)).count();
                important as f64 / turns.len() as f64 >= self.config.importance_threshold
            }
            Strategy::Hybrid => {
                current_tokens >= self.config.token_threshold || self.time_trigger(turns)
            }
            Strategy::Legacy => false,
        }
    }

    fn time_trigger(&self, turns: &[Turn]) -> bool {
        match (turns.first(), turns.last()) {
            (Some(first), Some(last)) if turns.len() >= 2 => {
                last.ts - first.ts >= self.config.time_threshold.as_secs_f64()
            }
            _ => false,
        }
    }

    /// Partition turns into (to-summarize, preserved).
    pub fn split(&self, turns: &[Turn]) -> (Vec<Turn>, Vec<Turn>) {
        if !self.config.preserve_tool_calls {
            return (turns.to_vec(), Vec::new());
        }
        let mut fold = Vec::new();
        let mut preserved = Vec::new();
        for turn in turns {
            if turn.tool_calls.is_some() {
                preserved.push(turn.clone());
            } else {
                fold.push(turn.clone());
            }
        }
        (fold, preserved)
    }

    /// Build a summary over `turns` (already filtered of preserved turns).
    ///
    /// Queries the model with a strategy-specific instruction when one is
    /// available; any model failure degrades to the statistical digest.
    pub async fn build_summary(
        &self,
        fold: &[Turn],
        preserved: Vec<Turn>,
        model: Option<&Arc<dyn ModelProvider>>,
    ) -> CrewResult<Summary> {
        if fold.is_empty() {
            return Err(ErrorInfo::new(
                "history.summarization_not_needed",
                "every unsummarized turn is preserved",
            ));
        }

        let content = match model {
            Some(model) => match model.generate(&self.digest_prompt(fold)).await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_owned(),
                Ok(_) => statistical_digest(fold),
                Err(e) => {
                    warn!(error = %e, "model digest failed, using statistical form");
                    statistical_digest(fold)
                }
            },
            None => statistical_digest(fold),
        };

        let token_count: u64 =
            fold.iter().map(|t| u64::from(t.tokens_in) + u64::from(t.tokens_out)).sum();
        let time_span = match (fold.first(), fold.last()) {
            (Some(first), Some(last)) => last.ts - first.ts,
            _ => 0.0,
        };
        let metadata = serde_json::json!({
            "strategy": self.config.strategy.as_str(),
            "total_tokens": token_count,
            "time_span": time_span,
            "tool_calls": fold.iter().filter(|t| t.tool_calls.is_some()).count(),
            "preserved_turns": preserved.len(),
        });

        let summary = Summary {
            id: format!("summary-{}", uuid::Uuid::new_v4()),
            ts: now_ts(),
            strategy: self.config.strategy,
            turn_count: fold.len(),
            token_count,
            content,
            metadata,
            preserved_turns: preserved,
        };
        info!(
            strategy = %summary.strategy.as_str(),
            turns = summary.turn_count,
            tokens = summary.token_count,
            "summary created"
        );
        Ok(summary)
    }

    /// Combine a chain of summaries into one aggregate, preserving the
    /// cumulative turn and token counts.
    pub fn compact(&self, summaries: &[Summary]) -> Summary {
        let turn_count = summaries.iter().map(|s| s.turn_count).sum();
        let token_count = summaries.iter().map(|s| s.token_count).sum();
        let content = if summaries.len() == 1 {
            summaries[0].content.clone()
        } else {
            let mut lines =
                vec![format!("Compacted conversation history covering {} periods:", summaries.len())];
            for (k, summary) in summaries.iter().enumerate() {
                lines.push(format!("Period {}: {}", k + 1, truncate_digest(&summary.content)));
            }
            lines.join("\n")
        };
        Summary {
            id: format!("compacted-{}", uuid::Uuid::new_v4()),
            ts: now_ts(),
            strategy: Strategy::Hybrid,
            turn_count,
            token_count,
            content,
            metadata: serde_json::json!({
                "compaction": true,
                "original_summaries": summaries.len(),
            }),
            preserved_turns: Vec::new(),
        }
    }

    fn digest_prompt(&self, turns: &[Turn]) -> String {
        let instruction = match self.config.strategy {
            Strategy::TokenBased | Strategy::Legacy => {
                "Summarize this conversation concisely, focusing on the key points and \
                 decisions made. Keep the summary under 200 words."
            }
            Strategy::TimeBased => {
                "Summarize this conversation chronologically, highlighting the progression \
                 of the discussion and any time-sensitive elements."
            }
            Strategy::ImportanceBased => {
                "Summarize this conversation by identifying the most important events, \
                 decisions, and outcomes. Focus on what matters most."
            }
            Strategy::Hybrid => {
                "Create a comprehensive summary of this conversation that captures the key \
                 points, decisions, and outcomes clearly and concisely."
            }
        };
        format!("{instruction}\n\nConversation:\n{}\n\nSummary:", render_turns(turns))
    }
}

/// True for turns the importance strategy counts: tool calls, system turns,
/// and long user messages.
pub fn is_important(turn: &Turn) -> bool {
    turn.tool_calls.is_some()
        || turn.role == Role::System
        || (turn.role == Role::User && turn.content.len() > IMPORTANT_USER_CHARS)
}

/// Digest used whenever no model answer is available.
fn statistical_digest(turns: &[Turn]) -> String {
    let total_tokens: u64 =
        turns.iter().map(|t| u64::from(t.tokens_in) + u64::from(t.tokens_out)).sum();
    let user = turns.iter().filter(|t| t.role == Role::User).count();
    let assistant = turns.iter().filter(|t| t.role == Role::Assistant).count();
    format!(
        "Conversation summary: {} turns ({user} user, {assistant} assistant), {total_tokens} total tokens.",
        turns.len()
    )
}

/// Render turns as "Role: content" blocks for digest prompts.
pub fn render_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role.title(), t.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_digest(content: &str) -> String {
    const MAX: usize = 200;
    if content.len() <= MAX {
        return content.to_owned();
    }
    let mut cut = MAX;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &content[..cut])
}

#[cfg(test)]
#[path = "summarize_tests.rs"]
mod tests;
