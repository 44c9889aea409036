// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tool registry and the built-in filesystem tools.
//!
//! Tools are async functions from a JSON arguments object to a JSON result.
//! The built-ins are sandboxed to the agent's working directory; any path
//! that resolves outside it is refused before touching the filesystem.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::error::{CrewResult, ErrorInfo};

/// Boxed future returned by a tool.
pub type ToolFuture = Pin<Box<dyn Future<Output = CrewResult<serde_json::Value>> + Send>>;

/// A registered tool function.
pub type ToolFn = Arc<dyn Fn(serde_json::Value) -> ToolFuture + Send + Sync>;

/// Name-indexed tool table shared between the runner and the agent app.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, ToolFn>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, tool: ToolFn) {
        self.tools.lock().insert(name.to_owned(), tool);
        info!(tool = %name, "tool registered");
    }

    pub fn register_fn<F>(&self, name: &str, f: F)
    where
        F: Fn(serde_json::Value) -> ToolFuture + Send + Sync + 'static,
    {
        self.register(name, Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<ToolFn> {
        self.tools.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Resolve `candidate` against `base` and refuse paths that escape it.
pub fn resolve_within(base: &Path, candidate: &str) -> CrewResult<PathBuf> {
    let base = base
        .canonicalize()
        .map_err(|e| ErrorInfo::new("rpc.handler.error", e.to_string()))?;
    let joined = if Path::new(candidate).is_absolute() {
        PathBuf::from(candidate)
    } else {
        base.join(candidate)
    };
    // Canonicalize the nearest existing ancestor so new files still resolve.
    let resolved = normalize(&joined);
    if !resolved.starts_with(&base) {
        return Err(ErrorInfo::new(
            "rpc.handler.error",
            format!("path escapes sandbox: {} !~ {}", resolved.display(), base.display()),
        ));
    }
    Ok(resolved)
}

/// Lexically normalize `.` and `..` components without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Register the built-in filesystem tools, sandboxed to `cwd`.
pub fn register_builtin_tools(registry: &ToolRegistry, cwd: PathBuf) {
    let base = cwd.clone();
    registry.register_fn("fs.read_file", move |args| {
        let base = base.clone();
        Box::pin(async move {
            let path = required_str(&args, "path")?;
            let resolved = resolve_within(&base, &path)?;
            let content = std::fs::read_to_string(&resolved)
                .map_err(|e| ErrorInfo::new("rpc.handler.error", e.to_string()))?;
            Ok(serde_json::json!({"path": path, "content": content}))
        })
    });

    let base = cwd.clone();
    registry.register_fn("fs.write_file", move |args| {
        let base = base.clone();
        Box::pin(async move {
            let path = required_str(&args, "path")?;
            let content = required_str(&args, "content")?;
            let resolved = resolve_within(&base, &path)?;
            if let Some(parent) = resolved.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ErrorInfo::new("rpc.handler.error", e.to_string()))?;
            }
            std::fs::write(&resolved, content.as_bytes())
                .map_err(|e| ErrorInfo::new("rpc.handler.error", e.to_string()))?;
            Ok(serde_json::json!({"path": path, "bytes": content.len()}))
        })
    });

    let base = cwd.clone();
    registry.register_fn("fs.list_dir", move |args| {
        let base = base.clone();
        Box::pin(async move {
            let path = optional_str(&args, "path").unwrap_or_else(|| ".".to_owned());
            let resolved = resolve_within(&base, &path)?;
            let mut names = Vec::new();
            let entries = std::fs::read_dir(&resolved)
                .map_err(|e| ErrorInfo::new("rpc.handler.error", e.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|e| ErrorInfo::new("rpc.handler.error", e.to_string()))?;
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(serde_json::json!({"path": path, "entries": names}))
        })
    });

    let base = cwd;
    registry.register_fn("fs.stat_file", move |args| {
        let base = base.clone();
        Box::pin(async move {
            let path = required_str(&args, "path")?;
            let resolved = resolve_within(&base, &path)?;
            let meta = std::fs::metadata(&resolved)
                .map_err(|e| ErrorInfo::new("rpc.handler.error", e.to_string()))?;
            Ok(serde_json::json!({
                "path": path,
                "size": meta.len(),
                "is_dir": meta.is_dir(),
                "is_file": meta.is_file(),
            }))
        })
    });
}

fn required_str(args: &serde_json::Value, key: &str) -> CrewResult<String> {
    optional_str(args, key)
        .ok_or_else(|| ErrorInfo::new("rpc.handler.error", format!("missing '{key}' argument")))
}

fn optional_str(args: &serde_json::Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

#[cfg(test)]
#[path = "tools_tests.rs"]
mod tests;
