// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Language-model provider interface.
//!
//! The runtime consumes a model only through this trait: produce tokens for
//! a prompt, streamed or whole. The bundled [`EchoModel`] exists for tests
//! and wiring checks; real providers live behind the same seam.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::CrewResult;

/// One streamed response fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChunk {
    pub text: String,
}

/// Streaming "produce tokens for a prompt" interface.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Rough token estimate (~4 characters per token).
    fn estimate_tokens(&self, text: &str) -> u32 {
        (text.len() / 4) as u32
    }

    /// Whole-response completion.
    async fn generate(&self, prompt: &str) -> CrewResult<String>;

    /// Chunked streaming completion.
    async fn stream(&self, prompt: &str) -> CrewResult<BoxStream<'static, CrewResult<ModelChunk>>>;
}

/// Echoes the prompt back in fixed-size chunks with a small delay, which is
/// enough to exercise streaming, interruption, and tail emission end to end.
pub struct EchoModel {
    chunk_size: usize,
    delay: Duration,
}

impl EchoModel {
    pub fn new() -> Self {
        Self { chunk_size: 10, delay: Duration::from_millis(10) }
    }

    pub fn with_timing(chunk_size: usize, delay: Duration) -> Self {
        Self { chunk_size: chunk_size.max(1), delay }
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for EchoModel {
    fn model_id(&self) -> &str {
        "echo"
    }

    async fn generate(&self, prompt: &str) -> CrewResult<String> {
        Ok(format!("Echo: {prompt}"))
    }

    async fn stream(&self, prompt: &str) -> CrewResult<BoxStream<'static, CrewResult<ModelChunk>>> {
        let response = format!("Echo: {prompt}");
        let chars: Vec<char> = response.chars().collect();
        let chunks: Vec<String> =
            chars.chunks(self.chunk_size).map(|c| c.iter().collect()).collect();
        let delay = self.delay;
        let stream = futures_util::stream::iter(chunks).then(move |text| async move {
            tokio::time::sleep(delay).await;
            Ok(ModelChunk { text })
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
