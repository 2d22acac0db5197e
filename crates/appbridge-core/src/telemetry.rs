//! Tracing initialisation and run-scoped spans.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::manifest::timestamp_slug;

/// Initialise the global subscriber.
///
/// * `json`: newline-delimited JSON on the console.
/// * `level`: default filter when `RUST_LOG` is unset.
/// * `log_dir`: when given, every line is also written to
///   `<log_dir>/run-<timestamp>.log`.
///
/// Returns the log file path. A log file that cannot be created leaves only
/// the console sink.
pub fn init_tracing(json: bool, level: &str, log_dir: Option<&Path>) -> Option<PathBuf> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file, log_path) = match log_dir.and_then(open_log_file) {
        Some((file, path)) => (Some(file), Some(path)),
        None => (None, None),
    };
    // The layer type depends on the subscriber stack, so it is built per branch.
    macro_rules! file_layer {
        () => {
            file.map(|f| {
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(f))
            })
        };
    }

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json().with_writer(std::io::stderr))
            .with(file_layer!())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(file_layer!())
            .try_init()
            .ok();
    }

    log_path
}

fn open_log_file(dir: &Path) -> Option<(File, PathBuf)> {
    std::fs::create_dir_all(dir).ok()?;
    let path = dir.join(format!("run-{}.log", timestamp_slug(Utc::now())));
    let file = File::create(&path).ok()?;
    Some((file, path))
}

/// Fresh run identifier.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// RAII guard that tags every event of one invocation with its `run_id`.
///
/// Only for synchronous scopes; async code should use [`RunSpan::span`]
/// with `tracing::Instrument`.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(command: &str, run_id: &str) -> Self {
        Self {
            _span: Self::span(command, run_id).entered(),
        }
    }

    pub fn span(command: &str, run_id: &str) -> tracing::Span {
        tracing::info_span!("appbridge.run", command = %command, run_id = %run_id)
    }
}
