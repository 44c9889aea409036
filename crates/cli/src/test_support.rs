// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit tests and the spec suite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;

use crate::error::CrewResult;
use crate::model::{ModelChunk, ModelProvider};
use crate::tail::{EventSink, TailEvent};

/// Model that plays back a fixed chunk script, ignoring the prompt.
pub struct ScriptedModel {
    chunks: Vec<String>,
    delay: Duration,
}

impl ScriptedModel {
    pub fn new(chunks: Vec<String>) -> Self {
        Self { chunks, delay: Duration::ZERO }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _prompt: &str) -> CrewResult<String> {
        Ok(self.chunks.concat())
    }

    async fn stream(
        &self,
        _prompt: &str,
    ) -> CrewResult<BoxStream<'static, CrewResult<ModelChunk>>> {
        let delay = self.delay;
        let stream =
            futures_util::stream::iter(self.chunks.clone()).then(move |text| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ModelChunk { text })
            });
        Ok(stream.boxed())
    }
}

/// Sink that records every emitted event for assertions.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<TailEvent>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TailEvent> {
        self.events.lock().clone()
    }

    /// Event type tags in emission order, e.g. `["task.start", "token"]`.
    pub fn tags(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| serde_json::to_value(e).ok())
            .filter_map(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned))
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectSink {
    async fn emit(&self, event: TailEvent) {
        self.events.lock().push(event);
    }
}
