//! # Mock Component
//!
//! A scriptable [`Runnable`]/[`PrefixRunnable`] for testing the container in
//! isolation. Every lifecycle call is written to a shared [`CallJournal`] so
//! tests can assert ordering across components.
//!
//! # Example
//! ```ignore
//! let journal = CallJournal::default();
//! let db = MockComponent::new("db").journal(&journal).fail_run("connection refused");
//!
//! let service = ServiceBuilder::new().with_init_runnable(db).build()?;
//! assert!(service.init().await.is_err());
//! assert_eq!(journal.entries(), ["db:init_flags", "db:configure", "db:run"]);
//! ```

use crate::config::{Flag, FlagSet};
use crate::error::ComponentError;
use crate::lifecycle::{Handle, PrefixRunnable, Runnable};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Ordered record of lifecycle calls, shared between mocks.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallJournal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Index of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// Handle exposed by a [`MockComponent`].
#[derive(Debug)]
pub struct MockHandle {
    pub name: String,
    runs: Arc<AtomicUsize>,
    setting: Option<Flag<String>>,
}

impl MockHandle {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Resolved value of the `{prefix}-setting` flag.
    pub fn setting(&self) -> Option<String> {
        self.setting.as_ref().map(Flag::get)
    }
}

/// A configurable component double.
pub struct MockComponent {
    name: String,
    prefix: String,
    journal: CallJournal,
    configure_error: Option<String>,
    run_error: Option<String>,
    run_delay: Duration,
    run_until_stopped: bool,
    stop_delay: Duration,
    setting: Option<Flag<String>>,
    runs: Arc<AtomicUsize>,
    stopped: CancellationToken,
}

impl MockComponent {
    /// A mock named `name`, registered under the same prefix.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            prefix: name.clone(),
            name,
            journal: CallJournal::default(),
            configure_error: None,
            run_error: None,
            run_delay: Duration::ZERO,
            run_until_stopped: false,
            stop_delay: Duration::ZERO,
            setting: None,
            runs: Arc::new(AtomicUsize::new(0)),
            stopped: CancellationToken::new(),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn journal(mut self, journal: &CallJournal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn fail_configure(mut self, msg: impl Into<String>) -> Self {
        self.configure_error = Some(msg.into());
        self
    }

    /// `run` fails with `msg` after the run delay.
    pub fn fail_run(mut self, msg: impl Into<String>) -> Self {
        self.run_error = Some(msg.into());
        self
    }

    pub fn run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// `run` blocks until `stop` is called, like a server loop.
    pub fn run_until_stopped(mut self) -> Self {
        self.run_until_stopped = true;
        self
    }

    pub fn stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Value of the `{prefix}-setting` flag.
    pub fn setting(&self) -> Option<String> {
        self.setting.as_ref().map(Flag::get)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) {
        self.journal.record(format!("{}:{call}", self.name));
    }
}

#[async_trait]
impl Runnable for MockComponent {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn init_flags(&mut self, flags: &mut FlagSet) {
        self.record("init_flags");
        self.setting = Some(flags.string(
            &format!("{}-setting", self.prefix),
            "",
            "Free-form setting of a mock component",
        ));
    }

    async fn configure(&self) -> Result<(), ComponentError> {
        self.record("configure");
        match &self.configure_error {
            Some(msg) => Err(ComponentError::config(msg.clone())),
            None => Ok(()),
        }
    }

    async fn run(&self) -> Result<(), ComponentError> {
        self.record("run");
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        if let Some(msg) = &self.run_error {
            return Err(ComponentError::other(msg.clone()));
        }
        if self.run_until_stopped {
            self.stopped.cancelled().await;
        }
        Ok(())
    }

    async fn stop(&self) {
        self.record("stop");
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.stopped.cancel();
        self.record("stopped");
    }
}

impl PrefixRunnable for MockComponent {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn handle(&self) -> Handle {
        Arc::new(MockHandle {
            name: self.name.clone(),
            runs: self.runs.clone(),
            setting: self.setting.clone(),
        })
    }
}
