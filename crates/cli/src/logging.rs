// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tracing initialization shared by the agent and console subcommands.

use tracing_subscriber::EnvFilter;

/// Initialize tracing from the CLI log level and `CREW_LOG_FORMAT`.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / CREW_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("CREW_LOG_LEVEL").is_err() && log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    } else {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match log_format {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}
