// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task runner: consumes queue items, drives the model stream, intercepts
//! tool calls, and narrates everything on the tail.
//!
//! At most one task runs at a time. `interrupt` stops the stream between
//! chunks and cancels the awaited future; `cancel(hard=true)` does the
//! same with a harder intent flag. Tool calls are detected with plain
//! `TOOL_CALL:` / `FUNCTION:` text markers so the runner stays independent
//! of any provider-specific tool protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::defaults::PROMPT_HISTORY_WINDOW;
use crate::history::HistoryStore;
use crate::memory::MemoryAccountant;
use crate::model::ModelProvider;
use crate::prompt_layer::PromptLayer;
use crate::queue::QueueItem;
use crate::summarize::render_turns;
use crate::tail::{EventSink, TailEvent};
use crate::tools::ToolRegistry;

/// One parsed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// What a finished task reports back to the queue pump.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub ok: bool,
    pub response: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
}

/// Drives one queue item at a time against the model.
pub struct TaskRunner {
    model: Arc<dyn ModelProvider>,
    sink: Arc<dyn EventSink>,
    prompts: Arc<PromptLayer>,
    history: Arc<HistoryStore>,
    memory: Arc<MemoryAccountant>,
    tools: Arc<ToolRegistry>,
    interrupted: AtomicBool,
    cancelled: AtomicBool,
    running: AtomicBool,
    abort: Mutex<Option<CancellationToken>>,
}

impl TaskRunner {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        sink: Arc<dyn EventSink>,
        prompts: Arc<PromptLayer>,
        history: Arc<HistoryStore>,
        memory: Arc<MemoryAccountant>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            model,
            sink,
            prompts,
            history,
            memory,
            tools,
            interrupted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            abort: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the current stream between chunks and cancel the awaited future.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(token) = self.abort.lock().as_ref() {
            token.cancel();
        }
        info!("task interrupted");
    }

    /// Flag cancellation; `hard` additionally cancels the awaited future.
    pub fn cancel(&self, hard: bool) {
        self.cancelled.store(true, Ordering::SeqCst);
        if hard {
            if let Some(token) = self.abort.lock().as_ref() {
                token.cancel();
            }
        }
        info!(hard, "task cancelled");
    }

    /// Run one queue item to completion (or interruption).
    pub async fn run_next(&self, item: &QueueItem) -> TaskOutcome {
        self.running.store(true, Ordering::SeqCst);
        self.interrupted.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        let abort = CancellationToken::new();
        *self.abort.lock() = Some(abort.clone());

        let outcome = self.execute(item, abort).await;

        *self.abort.lock() = None;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn execute(&self, item: &QueueItem, abort: CancellationToken) -> TaskOutcome {
        self.sink
            .emit(TailEvent::TaskStart { id: item.id.clone(), prompt_id: item.id.clone() })
            .await;

        let prompt = self.build_prompt(item);
        let tokens_in = self.model.estimate_tokens(&prompt);

        let mut stream = match self.model.stream(&prompt).await {
            Ok(stream) => stream,
            Err(e) => {
                self.sink
                    .emit(TailEvent::Error { msg: e.message.clone(), trace: Some(e.code.clone()) })
                    .await;
                return failure(tokens_in, e.to_string());
            }
        };

        let mut response = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut handled_calls = 0usize;

        loop {
            if self.interrupted.load(Ordering::SeqCst) || self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = abort.cancelled() => break,
            };
            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.sink
                        .emit(TailEvent::Error {
                            msg: e.message.clone(),
                            trace: Some(e.code.clone()),
                        })
                        .await;
                    return failure(tokens_in, e.to_string());
                }
            };

            response.push_str(&chunk.text);
            self.sink
                .emit(TailEvent::Token {
                    text: chunk.text.clone(),
                    model: self.model.model_id().to_owned(),
                })
                .await;

            if has_tool_marker(&chunk.text) {
                let parsed = extract_tool_calls(&response);
                for call in parsed.into_iter().skip(handled_calls) {
                    handled_calls += 1;
                    self.handle_tool_call(&call).await;
                    tool_calls.push(call);
                }
            }
        }

        // Final sweep for a marker completed by the last chunk.
        for call in extract_tool_calls(&response).into_iter().skip(handled_calls) {
            self.handle_tool_call(&call).await;
            tool_calls.push(call);
        }

        let tokens_out = self.model.estimate_tokens(&response);
        self.memory.add_turn(tokens_in, tokens_out);
        self.sink.emit(TailEvent::TaskEnd { id: item.id.clone(), ok: true }).await;
        info!(task_id = %item.id, tokens_out, tools = tool_calls.len(), "task completed");

        TaskOutcome { ok: true, response, tokens_in, tokens_out, tool_calls, error: None }
    }

    /// Effective system prompt, trailing history window, then the new input.
    fn build_prompt(&self, item: &QueueItem) -> String {
        let system = self.prompts.effective();
        let window = self.history.tail(PROMPT_HISTORY_WINDOW);
        let mut prompt = system;
        prompt.push_str("\n\n");
        if !window.is_empty() {
            prompt.push_str(&render_turns(&window));
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!("User: {}\nAssistant: ", item.text));
        prompt
    }

    async fn handle_tool_call(&self, call: &ToolCall) {
        self.sink
            .emit(TailEvent::ToolStart { tool: call.name.clone(), arguments: call.arguments.clone() })
            .await;

        match self.tools.get(&call.name) {
            Some(tool) => match tool(call.arguments.clone()).await {
                Ok(result) => {
                    self.sink.emit(TailEvent::ToolResult { tool: call.name.clone(), result }).await;
                }
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool execution failed");
                    self.sink
                        .emit(TailEvent::Error {
                            msg: format!("tool '{}' failed: {}", call.name, e.message),
                            trace: Some(e.code.clone()),
                        })
                        .await;
                }
            },
            None => {
                warn!(tool = %call.name, "tool not found");
                self.sink
                    .emit(TailEvent::Error {
                        msg: format!("tool '{}' not found", call.name),
                        trace: None,
                    })
                    .await;
            }
        }

        self.sink.emit(TailEvent::ToolEnd { tool: call.name.clone() }).await;
    }
}

fn failure(tokens_in: u32, error: String) -> TaskOutcome {
    TaskOutcome {
        ok: false,
        response: String::new(),
        tokens_in,
        tokens_out: 0,
        tool_calls: Vec::new(),
        error: Some(error),
    }
}

const MARKERS: [&str; 2] = ["TOOL_CALL:", "FUNCTION:"];

fn has_tool_marker(text: &str) -> bool {
    MARKERS.iter().any(|m| text.contains(m))
}

/// Pull every `TOOL_CALL: name {args}` / `FUNCTION: name {args}` line out
/// of the assembled response, in order. Arguments are a JSON object when
/// one parses; otherwise the raw text lands under `"text"`.
pub fn extract_tool_calls(response: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for line in response.lines() {
        let Some(rest) = MARKERS.iter().find_map(|m| {
            line.find(m).map(|at| line[at + m.len()..].trim())
        }) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let (name, args_text) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name.trim(), args.trim()),
            None => (rest, ""),
        };
        if name.is_empty() {
            continue;
        }
        let arguments = if args_text.is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str::<serde_json::Value>(args_text) {
                Ok(value) if value.is_object() => value,
                _ => serde_json::json!({"text": args_text}),
            }
        };
        calls.push(ToolCall { name: name.to_owned(), arguments });
    }
    calls
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
