//! # Errors
//!
//! Every layer of the kit owns one error enum. Component implementations
//! return [`ComponentError`]; the container wraps those into
//! [`ServiceError`] together with the name of the component that failed, so
//! the original cause is always reachable through `source()`.

use std::time::Duration;

/// Boxed error used for foreign failures (drivers, handlers, user code).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while loading the configuration surface.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("loading env file {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
    #[error("flag {0} is registered twice")]
    DuplicateFlag(String),
    #[error("unknown flag: {0}")]
    UnknownFlag(String),
    /// `-h`/`--help` was given; carries the rendered usage text.
    #[error("{0}")]
    Help(String),
    #[error("flag {0} needs an argument")]
    MissingValue(String),
    #[error("invalid value for flag {name}: {source}")]
    InvalidValue {
        name: String,
        #[source]
        source: Box<figment::Error>,
    },
}

/// Errors returned by a component's `configure` or `run`.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Flag(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(BoxError),
}

impl ComponentError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn other(err: impl Into<BoxError>) -> Self {
        Self::Other(err.into())
    }
}

/// Errors surfaced by the service container.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("prefix {0} is duplicated")]
    DuplicatePrefix(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("init component {name} failed: {source}")]
    Init {
        name: String,
        #[source]
        source: ComponentError,
    },
    #[error("component {name} failed: {source}")]
    Component {
        name: String,
        #[source]
        source: ComponentError,
    },
    #[error("component {name} stopped unexpectedly")]
    Aborted { name: String },
    #[error("installing signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Errors reported by a pub/sub provider.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("encoding event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("drain timed out after {0:?} with {1} events in flight")]
    DrainTimeout(Duration, usize),
}

/// Errors produced by async jobs and job groups.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {name} has failed after many retries")]
    TaskFailed { name: String },
    #[error("job {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("job {name} panicked: {message}")]
    Panicked { name: String, message: String },
    #[error("job {0} was cancelled")]
    Cancelled(String),
}
