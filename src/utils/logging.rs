//! Diagnostic logging setup.
//!
//! The filter comes from `MIMIC_LOG`, then `RUST_LOG`, then defaults to
//! `warn`. HTTP client internals are held at `warn` unless the filter names
//! them explicitly.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MIMIC_LOG";

const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

/// Where diagnostic output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink<'a> {
    /// Append to this file.
    File(&'a Path),
    Stderr,
    /// Drop everything. Used while the full-screen UI owns the terminal.
    Discard,
}

fn build_filter(directives: Option<String>) -> EnvFilter {
    let base = directives
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "warn".to_string());
    let mut directives = base.clone();
    for module in NOISY_MODULES {
        if !base.contains(module) {
            directives.push_str(&format!(",{module}=warn"));
        }
    }
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn env_directives() -> Option<String> {
    std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(sink: LogSink<'_>) -> std::io::Result<()> {
    let filter = build_filter(env_directives());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // try_init only fails when a subscriber is already set.
    match sink {
        LogSink::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        LogSink::Stderr => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
        LogSink::Discard => {
            let _ = builder.with_writer(std::io::sink).try_init();
        }
    }
    Ok(())
}
