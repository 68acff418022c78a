//! # Observability & Logging
//!
//! [`Logging`] is the logging component of a service. The container builds
//! one, registers its flags next to everybody else's and configures it right
//! after flags are parsed, so every later log line honours `log-level`.
//!
//! ## Configuration
//!
//! | Flag | Env | Default |
//! |------|-----|---------|
//! | `log-level` | `LOG_LEVEL` | `info` |
//! | `log-file` | `LOG_FILE` | empty, logs go to stderr |
//! | `log-format` | `LOG_FORMAT` | `text` (`json` for log shippers) |
//!
//! `RUST_LOG`, when set, replaces `log-level` entirely:
//!
//! ```bash
//! RUST_LOG=servicekit::pubsub=debug cargo run
//! ```
//!
//! ## Component Spans
//!
//! [`Logging::span`] hands a component a span tagged with its prefix.
//! Everything logged inside it carries `component=<prefix>`:
//!
//! ```text
//! INFO component{name="pubsub"}: started
//! DEBUG component{name="pubsub"}: event dequeued channel="chat"
//! ```
//!
//! ## Log Rotation
//!
//! With `log-file` set, output goes through a [`ReloadableFile`]. After an
//! external tool renames the file, call [`Logging::reopen`] (typically on
//! SIGHUP, which makes [`Service::start`](crate::Service::start) return).

mod reload_file;

pub use reload_file::ReloadableFile;

use crate::config::{Flag, FlagSet};
use crate::error::ComponentError;
use crate::lifecycle::Runnable;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn, Span};
use tracing_subscriber::EnvFilter;

/// The logging component.
#[derive(Default)]
pub struct Logging {
    default_file: Option<String>,
    level: Option<Flag<String>>,
    file: Option<Flag<String>>,
    format: Option<Flag<String>>,
    writer: Mutex<Option<Arc<ReloadableFile>>>,
    configured: AtomicBool,
}

impl Logging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes to `path` unless `log-file` says otherwise.
    pub fn with_file(path: impl Into<String>) -> Self {
        Self {
            default_file: Some(path.into()),
            ..Self::default()
        }
    }

    /// A span naming one component.
    pub fn span(&self, prefix: &str) -> Span {
        tracing::info_span!("component", name = %prefix)
    }

    /// The effective log level once flags are parsed.
    pub fn level(&self) -> String {
        self.level
            .as_ref()
            .map(Flag::get)
            .unwrap_or_else(|| "info".to_string())
    }

    /// Reopens the log file, if logging to one.
    pub fn reopen(&self) -> std::io::Result<()> {
        match self.current_writer() {
            Some(file) => {
                debug!(path = %file.path().display(), "reopening log file");
                file.reopen()
            }
            None => Ok(()),
        }
    }

    /// Installs the global subscriber from the parsed flags. Idempotent;
    /// the container calls it right after flag parsing.
    pub fn install(&self) -> Result<(), ComponentError> {
        if self.configured.load(Ordering::SeqCst) {
            return Ok(());
        }

        let level = normalize_level(&self.level());
        level
            .parse::<tracing::Level>()
            .map_err(|e| ComponentError::config(format!("log-level {level}: {e}")))?;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let json = self
            .format
            .as_ref()
            .map(|f| f.get() == "json")
            .unwrap_or(false);

        let writer = match self.file_path() {
            Some(path) => {
                let file = Arc::new(ReloadableFile::open(&path)?);
                *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(file.clone());
                Some(file)
            }
            None => None,
        };

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = match (writer, json) {
            (Some(file), true) => builder.json().with_writer(file).try_init(),
            (Some(file), false) => builder.with_ansi(false).with_writer(file).try_init(),
            (None, true) => builder.json().try_init(),
            (None, false) => builder.with_target(false).compact().try_init(),
        };
        if let Err(e) = installed {
            debug!(error = %e, "tracing subscriber already installed");
        }
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn current_writer(&self) -> Option<Arc<ReloadableFile>> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn file_path(&self) -> Option<String> {
        let from_flag = self.file.as_ref().map(Flag::get).filter(|p| !p.is_empty());
        from_flag.or_else(|| self.default_file.clone())
    }
}

#[async_trait]
impl Runnable for Logging {
    fn name(&self) -> String {
        "logger".to_string()
    }

    fn init_flags(&mut self, flags: &mut FlagSet) {
        self.level = Some(flags.string(
            "log-level",
            "info",
            "Log level: panic | fatal | error | warn | info | debug | trace",
        ));
        self.file = Some(flags.string(
            "log-file",
            "",
            "File to write log to. Default write to console",
        ));
        self.format = Some(flags.string("log-format", "text", "Log format: text | json"));
    }

    async fn configure(&self) -> Result<(), ComponentError> {
        self.install()
    }

    async fn run(&self) -> Result<(), ComponentError> {
        self.configure().await
    }

    async fn stop(&self) {
        if let Some(file) = self.current_writer() {
            if let Err(e) = file.sync() {
                warn!(error = %e, "flushing log file failed");
            }
        }
    }
}

/// Maps levels `tracing` lacks onto the closest one it has.
fn normalize_level(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        "panic" | "fatal" => "error".to_string(),
        "warning" => "warn".to_string(),
        other => other.to_string(),
    }
}
