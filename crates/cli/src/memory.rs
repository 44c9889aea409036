// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Memory accountant: tracks tokens-in-context against the model's window.
//!
//! The accountant only counts; it never touches the history store. Crossing
//! the configured threshold is the signal the agent uses to trigger
//! summarization, after which [`MemoryAccountant::summarize`] resets the
//! tally.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CrewResult, ErrorInfo};

/// Snapshot of the accountant's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub tokens_in_ctx: u64,
    pub ctx_pct: f64,
    pub summarize_threshold: f64,
    pub should_summarize: bool,
}

/// Aggregate returned when the tally is folded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub total_turns: usize,
    pub total_tokens: u64,
    pub avg_tokens_per_turn: f64,
}

struct Tally {
    turns: usize,
    tokens: u64,
}

/// Token accountant for one agent's context window.
pub struct MemoryAccountant {
    ctx_limit_tokens: u64,
    threshold: f64,
    tally: Mutex<Tally>,
}

impl MemoryAccountant {
    /// `threshold` is a fraction of the context window in [0, 1].
    pub fn new(ctx_limit_tokens: u64, threshold: f64) -> CrewResult<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ErrorInfo::new(
                "agent.bootstrap_failed",
                format!("summarize threshold {threshold} outside [0, 1]"),
            ));
        }
        Ok(Self {
            ctx_limit_tokens,
            threshold,
            tally: Mutex::new(Tally { turns: 0, tokens: 0 }),
        })
    }

    /// Record one turn's token usage.
    pub fn add_turn(&self, tokens_in: u32, tokens_out: u32) {
        let mut tally = self.tally.lock();
        tally.turns += 1;
        tally.tokens += u64::from(tokens_in) + u64::from(tokens_out);
        debug!(tokens_in, tokens_out, total = tally.tokens, "memory turn recorded");
    }

    pub fn ctx_tokens(&self) -> u64 {
        self.tally.lock().tokens
    }

    /// Usage fraction clamped to [0, 1].
    pub fn ctx_pct(&self) -> f64 {
        if self.ctx_limit_tokens == 0 {
            return 0.0;
        }
        (self.ctx_tokens() as f64 / self.ctx_limit_tokens as f64).min(1.0)
    }

    /// True at or past the threshold, false strictly below it.
    pub fn should_summarize(&self) -> bool {
        self.ctx_pct() >= self.threshold
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            tokens_in_ctx: self.ctx_tokens(),
            ctx_pct: self.ctx_pct(),
            summarize_threshold: self.threshold,
            should_summarize: self.should_summarize(),
        }
    }

    /// Fold the tally into an aggregate and reset it. The history store is
    /// untouched; only the accountant forgets.
    pub fn summarize(&self) -> MemorySummary {
        let mut tally = self.tally.lock();
        let summary = MemorySummary {
            total_turns: tally.turns,
            total_tokens: tally.tokens,
            avg_tokens_per_turn: if tally.turns == 0 {
                0.0
            } else {
                tally.tokens as f64 / tally.turns as f64
            },
        };
        tally.turns = 0;
        tally.tokens = 0;
        info!(turns = summary.total_turns, tokens = summary.total_tokens, "memory tally folded");
        summary
    }

    pub fn clear(&self) {
        let mut tally = self.tally.lock();
        tally.turns = 0;
        tally.tokens = 0;
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
