// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use yare::parameterized;

use crate::error::ErrorInfo;
use crate::model::{EchoModel, ModelChunk};

use super::*;

fn turn(role: Role, content: &str, tokens: u32, ts: f64) -> Turn {
    Turn {
        ts,
        role,
        source: "console".to_owned(),
        content: content.to_owned(),
        tokens_in: tokens / 2,
        tokens_out: tokens - tokens / 2,
        tool_calls: None,
    }
}

fn tool_turn(content: &str, ts: f64) -> Turn {
    Turn {
        tool_calls: Some(serde_json::json!([{"name": "fs.read_file"}])),
        ..turn(Role::Assistant, content, 10, ts)
    }
}

fn engine(strategy: Strategy) -> SummarizeEngine {
    SummarizeEngine::new(SummarizeConfig {
        strategy,
        token_threshold: 100,
        time_threshold: std::time::Duration::from_secs(60),
        importance_threshold: 0.5,
        ..SummarizeConfig::default()
    })
}

#[parameterized(
    below = { 99, false },
    at = { 100, true },
    above = { 150, true },
)]
fn token_strategy_boundary(tokens: u64, expected: bool) {
    let e = engine(Strategy::TokenBased);
    let turns = vec![turn(Role::User, "hi", 4, 0.0)];
    assert_eq!(e.should_summarize(&turns, tokens), expected);
}

#[test]
fn time_strategy_uses_first_to_last_span() {
    let e = engine(Strategy::TimeBased);
    let narrow = vec![turn(Role::User, "a", 4, 0.0), turn(Role::Assistant, "b", 4, 59.0)];
    let wide = vec![turn(Role::User, "a", 4, 0.0), turn(Role::Assistant, "b", 4, 61.0)];
    assert!(!e.should_summarize(&narrow, 0));
    assert!(e.should_summarize(&wide, 0));
    // A single turn has no span.
    assert!(!e.should_summarize(&[turn(Role::User, "a", 4, 0.0)], 0));
}

#[test]
fn importance_strategy_counts_ratio() {
    let e = engine(Strategy::ImportanceBased);
    // 1 important of 3 => 0.33 < 0.5.
    let mostly_plain = vec![
        turn(Role::User, "a", 4, 0.0),
        turn(Role::Assistant, "b", 4, 1.0),
        tool_turn("c", 2.0),
    ];
    assert!(!e.should_summarize(&mostly_plain, 0));
    // 2 important of 3 => 0.66 >= 0.5.
    let mostly_important = vec![
        tool_turn("a", 0.0),
        turn(Role::System, "b", 4, 1.0),
        turn(Role::Assistant, "c", 4, 2.0),
    ];
    assert!(e.should_summarize(&mostly_important, 0));
}

#[test]
fn hybrid_fires_on_either_rule() {
    let e = engine(Strategy::Hybrid);
    let turns = vec![turn(Role::User, "a", 4, 0.0), turn(Role::Assistant, "b", 4, 61.0)];
    assert!(e.should_summarize(&turns, 0), "time rule");
    let turns = vec![turn(Role::User, "a", 4, 0.0)];
    assert!(e.should_summarize(&turns, 100), "token rule");
    assert!(!e.should_summarize(&turns, 0));
}

#[test]
fn important_turn_rules() {
    assert!(is_important(&tool_turn("x", 0.0)));
    assert!(is_important(&turn(Role::System, "x", 4, 0.0)));
    assert!(is_important(&turn(Role::User, &"x".repeat(201), 4, 0.0)));
    assert!(!is_important(&turn(Role::User, "short", 4, 0.0)));
    assert!(!is_important(&turn(Role::Assistant, &"x".repeat(201), 4, 0.0)));
}

#[test]
fn split_preserves_tool_call_turns() {
    let e = engine(Strategy::TokenBased);
    let turns = vec![
        turn(Role::User, "a", 4, 0.0),
        tool_turn("b", 1.0),
        turn(Role::Assistant, "c", 4, 2.0),
    ];
    let (fold, preserved) = e.split(&turns);
    assert_eq!(fold.len(), 2);
    assert_eq!(preserved.len(), 1);
    assert_eq!(preserved[0].content, "b");
}

#[tokio::test]
async fn statistical_digest_without_model() -> anyhow::Result<()> {
    let e = engine(Strategy::TokenBased);
    let fold = vec![turn(Role::User, "a", 10, 0.0), turn(Role::Assistant, "b", 30, 1.0)];
    let summary =
        e.build_summary(&fold, Vec::new(), None).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(summary.turn_count, 2);
    assert_eq!(summary.token_count, 40);
    assert_eq!(summary.content, "Conversation summary: 2 turns (1 user, 1 assistant), 40 total tokens.");
    Ok(())
}

#[tokio::test]
async fn model_digest_when_available() -> anyhow::Result<()> {
    let e = engine(Strategy::TokenBased);
    let model: Arc<dyn ModelProvider> = Arc::new(EchoModel::new());
    let fold = vec![turn(Role::User, "hello", 10, 0.0)];
    let summary =
        e.build_summary(&fold, Vec::new(), Some(&model)).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(summary.content.starts_with("Echo:"));
    assert!(summary.content.contains("User: hello"));
    Ok(())
}

struct FailingModel;

#[async_trait]
impl ModelProvider for FailingModel {
    fn model_id(&self) -> &str {
        "failing"
    }
    async fn generate(&self, _prompt: &str) -> crate::error::CrewResult<String> {
        Err(ErrorInfo::new("bus.call_failed", "provider offline"))
    }
    async fn stream(
        &self,
        _prompt: &str,
    ) -> crate::error::CrewResult<BoxStream<'static, crate::error::CrewResult<ModelChunk>>> {
        Err(ErrorInfo::new("bus.call_failed", "provider offline"))
    }
}

#[tokio::test]
async fn model_failure_degrades_to_statistical_digest() -> anyhow::Result<()> {
    let e = engine(Strategy::ImportanceBased);
    let model: Arc<dyn ModelProvider> = Arc::new(FailingModel);
    let fold = vec![turn(Role::User, "hello", 10, 0.0)];
    let summary =
        e.build_summary(&fold, Vec::new(), Some(&model)).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(summary.content.starts_with("Conversation summary:"));
    Ok(())
}

#[tokio::test]
async fn all_preserved_is_not_needed() -> anyhow::Result<()> {
    let e = engine(Strategy::TokenBased);
    let err = match e.build_summary(&[], vec![tool_turn("x", 0.0)], None).await {
        Err(err) => err,
        Ok(_) => anyhow::bail!("summary built from nothing"),
    };
    assert_eq!(err.code, "history.summarization_not_needed");
    Ok(())
}

#[tokio::test]
async fn compact_preserves_cumulative_counts() -> anyhow::Result<()> {
    let e = engine(Strategy::TokenBased);
    let first = e
        .build_summary(&[turn(Role::User, "a", 10, 0.0)], Vec::new(), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let second = e
        .build_summary(&[turn(Role::User, "b", 30, 1.0), turn(Role::Assistant, "c", 20, 2.0)], Vec::new(), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let aggregate = e.compact(&[first, second]);
    assert_eq!(aggregate.turn_count, 3);
    assert_eq!(aggregate.token_count, 60);
    assert!(aggregate.content.contains("Period 1:"));
    assert!(aggregate.content.contains("Period 2:"));
    assert_eq!(aggregate.metadata["compaction"], true);
    Ok(())
}

#[test]
fn legacy_strategy_tag_deserializes_via_other() -> anyhow::Result<()> {
    let s: Strategy = serde_json::from_str("\"token_based\"")?;
    assert_eq!(s, Strategy::TokenBased);
    let s: Strategy = serde_json::from_str("\"simple\"")?;
    assert_eq!(s, Strategy::Legacy);
    Ok(())
}
