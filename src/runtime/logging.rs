//! Two log streams with separate jobs.
//!
//! - The runtime log (`logs/runtime.log`) is a product artifact: one JSON object
//!   per line, always written, read by `jobloop status` and by operators.
//! - `tracing` output is developer diagnostics on stderr, filtered by `RUST_LOG`
//!   and never persisted. Every runtime log line is mirrored to it.

use super::StatePaths;
use std::fs;
use std::io::Write;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn append_runtime_log(paths: &StatePaths, level: &str, event: &str, message: &str) {
    match level {
        "error" => tracing::error!(event, "{message}"),
        "warn" => tracing::warn!(event, "{message}"),
        "debug" => tracing::debug!(event, "{message}"),
        _ => tracing::info!(event, "{message}"),
    }

    let payload = serde_json::json!({
        "timestamp": super::now_secs(),
        "level": level,
        "event": event,
        "pid": std::process::id(),
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    let path = paths.runtime_log_path();
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}

/// Reads the last `limit` runtime log lines, oldest first.
pub fn tail_runtime_log(paths: &StatePaths, limit: usize) -> Vec<String> {
    let Ok(raw) = fs::read_to_string(paths.runtime_log_path()) else {
        return Vec::new();
    };
    let lines: Vec<&str> = raw.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].iter().map(|line| line.to_string()).collect()
}

/// Installs the stderr diagnostics subscriber. Reads `RUST_LOG`, defaults to `warn`.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
