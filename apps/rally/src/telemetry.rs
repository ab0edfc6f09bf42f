//! Logging bootstrap.
//!
//! One global `tracing` subscriber for the whole process, writing to stderr
//! or an append-only file. `RALLY_LOG_FILTER` overrides the computed filter
//! outright; at trace verbosity the noisy HTTP dependencies are muted unless
//! `RALLY_TRACE_DEPS` opts back in.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Crates whose trace output drowns the interesting lines.
const NOISY_DEPS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "mio", "h2"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Debug and trace runs annotate events with their target module.
    fn verbose(self) -> bool {
        matches!(self, LogLevel::Debug | LogLevel::Trace)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}

static INSTALLED: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Idempotent, so the binary and embedding
/// tests can both call it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::LogFile {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let (filter, muted) = resolve_filter(config.level);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(config.level.verbose())
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Subscriber(err.to_string()))?;

    let _ = INSTALLED.set(guard);
    if muted {
        eprintln!(
            "[rally] muting dependency trace output; set RALLY_TRACE_DEPS=1 or RALLY_LOG_FILTER to override"
        );
    }
    Ok(())
}

/// Returns the filter directive string and whether dependency muting kicked
/// in.
fn resolve_filter(level: LogLevel) -> (String, bool) {
    if let Ok(custom) = std::env::var("RALLY_LOG_FILTER") {
        return (custom, false);
    }
    let base = level_directives(level);
    if level == LogLevel::Trace && !trace_deps_requested() {
        (mute_noisy_deps(base), true)
    } else {
        (base.to_string(), false)
    }
}

fn level_directives(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "info,rally_core=trace,rally=trace",
        LogLevel::Debug => "info,rally_core=debug,rally=debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn trace_deps_requested() -> bool {
    std::env::var("RALLY_TRACE_DEPS")
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false)
}

fn mute_noisy_deps(base: &str) -> String {
    let mut directives = vec![base.to_string()];
    directives.extend(NOISY_DEPS.iter().map(|dep| format!("{dep}=info")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::deadline]
    fn own_crates_get_the_requested_verbosity() {
        assert_eq!(level_directives(LogLevel::Warn), "warn");
        assert!(level_directives(LogLevel::Trace).contains("rally_core=trace"));
        assert!(level_directives(LogLevel::Debug).starts_with("info,"));
    }

    #[test_deadline::deadline]
    fn muting_appends_a_directive_per_noisy_dep() {
        let filter = mute_noisy_deps("info");
        assert!(filter.starts_with("info,"));
        for dep in NOISY_DEPS {
            assert!(filter.contains(&format!("{dep}=info")), "missing {dep}");
        }
    }

    #[test_deadline::deadline]
    fn only_debug_and_trace_are_verbose() {
        assert!(LogLevel::Trace.verbose());
        assert!(LogLevel::Debug.verbose());
        assert!(!LogLevel::Info.verbose());
        assert!(!LogLevel::Warn.verbose());
    }
}
