//! Structured logging for hive.
//!
//! Log levels:
//! - ERROR: the coordination store is unavailable or persistence failed
//! - WARN: expected but noteworthy recovery (reaper releases, compensation failures, retries)
//! - INFO: lifecycle notifications (startup, agent registration, health reports)
//! - DEBUG: per-operation traces (claims, conflicts, closed spans)
//! - TRACE: very detailed internal state
//!
//! Debug mode can be enabled with `--debug` flag or `HIVE_DEBUG=1` env var.
//! `RUST_LOG` overrides the filter entirely.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.hive/hive.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_with_debug(debug: bool) {
    let env_debug = debug_from_env(std::env::var("HIVE_DEBUG").ok().as_deref());
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false);

    let _ = match open_log_file() {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn debug_from_env(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn open_log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".hive");
    std::fs::create_dir_all(&dir).ok()?;
    // Truncate file on startup
    File::create(dir.join("hive.log")).ok()
}
