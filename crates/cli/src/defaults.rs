// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime defaults shared across components.

use std::time::Duration;

/// Heartbeat tick period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// TTL for the heartbeat key, identity lock, and registry record.
/// Strictly greater than the heartbeat period (~3 ticks of slack).
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(10);

/// Default RPC call timeout.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// TTL for the exclusive-writer ownership record.
pub const OWNERSHIP_TTL: Duration = Duration::from_secs(300);

/// Poll period while waiting out a takeover grace window.
pub const TAKEOVER_POLL: Duration = Duration::from_secs(1);

/// Console-side poll period for takeover notifications.
pub const NOTIFY_POLL: Duration = Duration::from_secs(2);

/// Tail replay ring capacity (records).
pub const TAIL_RING_CAPACITY: usize = 2048;

/// Upper bound on an RPC request frame.
pub const MAX_RPC_PAYLOAD: usize = 256 * 1024;

/// Upper bound on a published tail frame.
pub const MAX_TAIL_FRAME: usize = 8 * 1024;

/// Default model context window, in tokens.
pub const CTX_LIMIT_TOKENS: u32 = 128_000;

/// Context fraction at which summarization triggers.
pub const SUMMARIZE_THRESHOLD: f64 = 0.8;

/// History window rendered into each task prompt.
pub const PROMPT_HISTORY_WINDOW: usize = 10;

/// Maximum summary-chain length before compaction.
pub const MAX_SUMMARIES: usize = 10;
