// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System prompt layering: a base document plus operator overlay lines.
//!
//! Both parts persist to text files next to the agent state. The effective
//! prompt is the base followed, when the overlay is non-empty, by an
//! "# Overlay" header and the joined overlay lines.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{CrewResult, ErrorInfo};

const DEFAULT_BASE: &str = "# System Prompt\n\nYou are a helpful AI assistant.";
const OVERLAY_HEADER: &str = "# Overlay";

struct LayerState {
    base: String,
    overlay_lines: Vec<String>,
}

/// Base + overlay prompt backed by `system_base.md` / `system_overlay.md`.
pub struct PromptLayer {
    base_path: PathBuf,
    overlay_path: PathBuf,
    state: Mutex<LayerState>,
}

impl PromptLayer {
    /// Load both files. A missing base file is initialized with a default
    /// prompt and persisted immediately.
    pub fn open(base_path: PathBuf, overlay_path: PathBuf) -> CrewResult<Self> {
        let layer = Self {
            base_path,
            overlay_path,
            state: Mutex::new(LayerState { base: String::new(), overlay_lines: Vec::new() }),
        };
        layer.reload_from_disk()?;
        Ok(layer)
    }

    /// Base, then the overlay section when any lines exist.
    pub fn effective(&self) -> String {
        let state = self.state.lock();
        if state.overlay_lines.is_empty() {
            return state.base.clone();
        }
        format!("{}\n\n{OVERLAY_HEADER}\n{}", state.base, state.overlay_lines.join("\n"))
    }

    pub fn base(&self) -> String {
        self.state.lock().base.clone()
    }

    pub fn overlay(&self) -> String {
        self.state.lock().overlay_lines.join("\n")
    }

    pub fn overlay_lines(&self) -> Vec<String> {
        self.state.lock().overlay_lines.clone()
    }

    /// Overwrite and persist the base prompt.
    pub fn set_base(&self, text: &str) -> CrewResult<()> {
        write_file(&self.base_path, text)
            .map_err(|e| ErrorInfo::new("prompt.set_base_failed", e.to_string()))?;
        self.state.lock().base = text.to_owned();
        info!(path = %self.base_path.display(), "base prompt updated");
        Ok(())
    }

    /// Overwrite and persist the overlay. Blank lines are dropped.
    pub fn set_overlay(&self, text: &str) -> CrewResult<()> {
        let lines = split_lines(text);
        write_file(&self.overlay_path, &lines.join("\n"))
            .map_err(|e| ErrorInfo::new("prompt.set_overlay_failed", e.to_string()))?;
        self.state.lock().overlay_lines = lines;
        info!(path = %self.overlay_path.display(), "overlay updated");
        Ok(())
    }

    /// Append one overlay line. Empty or whitespace-only input is refused.
    pub fn append_overlay(&self, line: &str) -> CrewResult<()> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ErrorInfo::new("prompt.empty_line", "overlay lines must be non-empty"));
        }
        let lines = {
            let mut state = self.state.lock();
            state.overlay_lines.push(line.to_owned());
            state.overlay_lines.clone()
        };
        write_file(&self.overlay_path, &lines.join("\n"))
            .map_err(|e| ErrorInfo::new("prompt.set_overlay_failed", e.to_string()))?;
        info!(line = %line, "overlay line appended");
        Ok(())
    }

    /// Drop every overlay line, in memory and on disk.
    pub fn clear_overlay(&self) -> CrewResult<()> {
        write_file(&self.overlay_path, "")
            .map_err(|e| ErrorInfo::new("prompt.set_overlay_failed", e.to_string()))?;
        self.state.lock().overlay_lines.clear();
        info!("overlay cleared");
        Ok(())
    }

    /// Re-read both files, replacing the in-memory state.
    pub fn reload_from_disk(&self) -> CrewResult<()> {
        let base = match std::fs::read_to_string(&self.base_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_file(&self.base_path, DEFAULT_BASE)
                    .map_err(|e| ErrorInfo::new("prompt.reload_failed", e.to_string()))?;
                warn!(path = %self.base_path.display(), "base prompt missing, wrote default");
                DEFAULT_BASE.to_owned()
            }
            Err(e) => return Err(ErrorInfo::new("prompt.reload_failed", e.to_string())),
        };
        let overlay_lines = match std::fs::read_to_string(&self.overlay_path) {
            Ok(text) => split_lines(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(ErrorInfo::new("prompt.reload_failed", e.to_string())),
        };

        let mut state = self.state.lock();
        state.base = base;
        state.overlay_lines = overlay_lines;
        Ok(())
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect()
}

fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
}

#[cfg(test)]
#[path = "prompt_layer_tests.rs"]
mod tests;
