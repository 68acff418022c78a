//! # Service Container
//!
//! [`ServiceBuilder`] collects components and options; [`Service`] drives
//! them through their lifecycle.
//!
//! ```text
//! build:  register flags ─▶ load .env ─▶ parse flags ─▶ install logging
//! init:   init components, one by one, fail fast
//! start:  always-running components concurrently ─▶ first error or signal
//! stop:   every component at once, each bounded by the stop timeout
//! ```
//!
//! Components reach each other through [`ServiceContext`]: init components
//! are looked up by prefix and downcast to their handle type.

use crate::config::{load_env_file, Flag, FlagSet};
use crate::error::{ComponentError, ServiceError};
use crate::httpserver::HttpServer;
use crate::lifecycle::runnable::{Handle, LifecycleState, PrefixRunnable, Runnable};
use crate::lifecycle::signals::{os_signals, ProcessSignal};
use crate::logging::Logging;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument, Span};

pub const DEV_ENV: &str = "dev";
pub const STG_ENV: &str = "stg";
pub const PRD_ENV: &str = "prd";
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// SERVICE CONTEXT
// =============================================================================

/// What a one-shot job or a request handler needs from the running service.
pub trait ServiceContext: Send + Sync {
    /// A span tagging everything logged inside it with `prefix`.
    fn logger(&self, prefix: &str) -> Span;

    /// Runtime handle of the init component registered under `prefix`.
    fn get_handle(&self, prefix: &str) -> Option<Handle>;

    /// Deployment environment (`dev`, `stg`, `prd`).
    fn env(&self) -> String;

    /// Typed lookup of an init component's handle.
    fn get<T: Any + Send + Sync>(&self, prefix: &str) -> Option<Arc<T>>
    where
        Self: Sized,
    {
        self.get_handle(prefix)?.downcast::<T>().ok()
    }
}

// =============================================================================
// COMPONENT SLOTS
// =============================================================================

enum Member {
    Plain(Arc<dyn Runnable>),
    Prefixed(Arc<dyn PrefixRunnable>),
}

/// One registered component and where it is in its lifecycle.
struct Slot {
    name: String,
    member: Member,
    state: Mutex<LifecycleState>,
}

impl Slot {
    fn new(member: Member) -> Self {
        let name = match &member {
            Member::Plain(r) => r.name(),
            Member::Prefixed(p) => p.name(),
        };
        Self {
            name,
            member,
            state: Mutex::new(LifecycleState::Uninitialized),
        }
    }

    fn prefix(&self) -> Option<&str> {
        match &self.member {
            Member::Plain(_) => None,
            Member::Prefixed(p) => Some(p.prefix()),
        }
    }

    fn handle(&self) -> Option<Handle> {
        match &self.member {
            Member::Plain(_) => None,
            Member::Prefixed(p) => Some(p.handle()),
        }
    }

    fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn configure(&self) -> Result<(), ComponentError> {
        let configured = match &self.member {
            Member::Plain(r) => r.configure().await,
            Member::Prefixed(p) => p.configure().await,
        };
        match &configured {
            Ok(()) => self.set_state(LifecycleState::Configured),
            Err(_) => self.set_state(LifecycleState::Failed),
        }
        configured
    }

    async fn run(&self) -> Result<(), ComponentError> {
        self.set_state(LifecycleState::Running);
        let ran = match &self.member {
            Member::Plain(r) => r.run().await,
            Member::Prefixed(p) => p.run().await,
        };
        if ran.is_err() {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != LifecycleState::Stopped {
                *state = LifecycleState::Failed;
            }
        }
        ran
    }

    async fn stop(&self) {
        match &self.member {
            Member::Plain(r) => r.stop().await,
            Member::Prefixed(p) => p.stop().await,
        }
        self.set_state(LifecycleState::Stopped);
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Assembles a [`Service`].
///
/// # Example
///
/// ```ignore
/// let service = ServiceBuilder::new()
///     .name("orders")
///     .version("1.0.0")
///     .with_init_runnable(LocalPubSub::new("pubsub"))
///     .build()?;
///
/// service.init().await?;
/// service.start().await?;
/// ```
pub struct ServiceBuilder {
    name: Option<String>,
    version: String,
    runnables: Vec<Box<dyn Runnable>>,
    init_runnables: Vec<Box<dyn PrefixRunnable>>,
    log_file: Option<String>,
    args: Option<Vec<String>>,
    stop_timeout: Duration,
    load_env_file: bool,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self {
            name: None,
            version: String::new(),
            runnables: Vec::new(),
            init_runnables: Vec::new(),
            log_file: None,
            args: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            load_env_file: true,
        }
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a component that runs for the whole life of the service.
    pub fn with_runnable(mut self, runnable: impl Runnable) -> Self {
        self.runnables.push(Box::new(runnable));
        self
    }

    /// Adds a component run once, in order, by [`Service::init`] and
    /// retrievable by its prefix.
    pub fn with_init_runnable(mut self, runnable: impl PrefixRunnable) -> Self {
        self.init_runnables.push(Box::new(runnable));
        self
    }

    /// Logs to `path` unless `log-file` overrides it.
    pub fn with_file_logger(mut self, path: impl Into<String>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Command-line arguments, without the program name. Defaults to the
    /// process arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Upper bound for each component's `stop`.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Skips loading the env file.
    pub fn without_env_file(mut self) -> Self {
        self.load_env_file = false;
        self
    }

    pub fn build(self) -> Result<Service, ServiceError> {
        let mut seen = HashSet::new();
        for runnable in &self.init_runnables {
            if !seen.insert(runnable.prefix().to_string()) {
                return Err(ServiceError::DuplicatePrefix(runnable.prefix().to_string()));
            }
        }

        let name = self.name.unwrap_or_else(name_from_argv);
        let mut flags = FlagSet::new(name.clone());
        let env = flags.string("app-env", DEV_ENV, "Env for service. Ex: dev | stg | prd");

        let mut logging = match self.log_file {
            Some(path) => Logging::with_file(path),
            None => Logging::new(),
        };
        logging.init_flags(&mut flags);

        let mut http = HttpServer::new();
        http.init_flags(&mut flags);
        let http = Arc::new(http);

        let mut always = Vec::with_capacity(self.runnables.len() + 1);
        for mut runnable in self.runnables {
            runnable.init_flags(&mut flags);
            always.push(Arc::new(Slot::new(Member::Plain(Arc::from(runnable)))));
        }
        always.push(Arc::new(Slot::new(Member::Plain(http.clone()))));

        let mut init = Vec::with_capacity(self.init_runnables.len());
        for mut runnable in self.init_runnables {
            runnable.init_flags(&mut flags);
            init.push(Arc::new(Slot::new(Member::Prefixed(Arc::from(runnable)))));
        }

        if self.load_env_file {
            if let Some(path) = load_env_file()? {
                debug!(path = %path, "env file loaded");
            }
        }
        let args = self
            .args
            .unwrap_or_else(|| std::env::args().skip(1).collect());
        flags.parse(args)?;
        for slot in always.iter().chain(&init) {
            slot.set_state(LifecycleState::FlagsRegistered);
        }

        logging
            .install()
            .map_err(|source| ServiceError::Init {
                name: logging.name(),
                source,
            })?;

        Ok(Service {
            name,
            version: self.version,
            env,
            flags,
            logging: Arc::new(logging),
            http,
            always,
            init,
            stop_timeout: self.stop_timeout,
        })
    }
}

fn name_from_argv() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|argv0| Path::new(argv0).file_stem())
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "service".to_string())
}

// =============================================================================
// SERVICE
// =============================================================================

/// The component container.
///
/// - **Init components** run one after another in registration order; the
///   first failure aborts [`Service::init`].
/// - **Always-running components** (the HTTP server last) run concurrently
///   under [`Service::start`], which returns on the first failure or on a
///   process signal.
/// - [`Service::stop`] stops everything at once and waits for all of it.
///
/// Registries are fixed once [`ServiceBuilder::build`] returns.
pub struct Service {
    name: String,
    version: String,
    env: Flag<String>,
    flags: FlagSet,
    logging: Arc<Logging>,
    http: Arc<HttpServer>,
    always: Vec<Arc<Slot>>,
    init: Vec<Arc<Slot>>,
    stop_timeout: Duration,
}

impl Service {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Service name, from the builder or the program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version string given to the builder, empty when unset.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Deployment environment, from `app-env`.
    pub fn env(&self) -> String {
        self.env.get()
    }

    /// The always-running HTTP component; attach routes before `start`.
    pub fn http_server(&self) -> &HttpServer {
        &self.http
    }

    pub fn logging(&self) -> &Logging {
        &self.logging
    }

    /// Every flag registered by the container and its components.
    pub fn flags(&self) -> &FlagSet {
        &self.flags
    }

    /// Prints a sample env file covering every registered flag.
    pub fn out_env(&self) {
        print!("{}", self.flags.sample_env());
    }

    /// Every registered component with its lifecycle state, init
    /// components first.
    pub fn component_states(&self) -> Vec<(String, LifecycleState)> {
        self.init
            .iter()
            .chain(&self.always)
            .map(|slot| (slot.name.clone(), slot.state()))
            .collect()
    }

    /// Runs every init component, strictly in registration order.
    pub async fn init(&self) -> Result<(), ServiceError> {
        for slot in &self.init {
            let label = slot.prefix().unwrap_or(&slot.name).to_string();
            let span = self.logging.span(&label);
            let outcome = async {
                slot.configure().await?;
                slot.run().await
            }
            .instrument(span)
            .await;

            if let Err(source) = outcome {
                error!(component = %slot.name, error = %source, "init component failed");
                return Err(ServiceError::Init {
                    name: slot.name.clone(),
                    source,
                });
            }
            debug!(component = %slot.name, "init component ready");
        }
        Ok(())
    }

    /// Runs the always-running components until one fails or a process
    /// signal arrives.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let signals = os_signals()?;
        self.start_with_signals(signals).await
    }

    /// [`Service::start`] with signals from `signals` instead of the OS.
    ///
    /// - `Interrupt` / `Terminate`: stops everything, returns `Ok(())`.
    /// - `Hangup`: returns `Ok(())`, components keep running.
    /// - A component error: stops everything, returns that error.
    pub async fn start_with_signals(
        &self,
        mut signals: mpsc::Receiver<ProcessSignal>,
    ) -> Result<(), ServiceError> {
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for slot in &self.always {
            let runner = slot.clone();
            let task = async move {
                runner.configure().await?;
                runner.run().await
            }
            .instrument(self.logging.span(&slot.name));
            let handle = tasks.spawn(task);
            names.insert(handle.id(), slot.name.clone());
        }
        info!(service = %self.name, version = %self.version, env = %self.env(), "service started");

        let mut listening = true;
        let outcome = loop {
            tokio::select! {
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let failure = match joined {
                        Some(Ok((id, Ok(())))) => {
                            info!(component = %component_name(&names, id), "component returned");
                            None
                        }
                        Some(Ok((id, Err(source)))) => Some(ServiceError::Component {
                            name: component_name(&names, id),
                            source,
                        }),
                        Some(Err(e)) => Some(ServiceError::Aborted {
                            name: component_name(&names, e.id()),
                        }),
                        None => None,
                    };
                    if let Some(err) = failure {
                        error!(error = %err, "stopping service");
                        self.stop().await;
                        break Err(err);
                    }
                }
                signal = signals.recv(), if listening => match signal {
                    Some(signal) if signal.stops_service() => {
                        info!(signal = ?signal, "shutting down");
                        self.stop().await;
                        break Ok(());
                    }
                    Some(signal) => {
                        info!(signal = ?signal, "reload requested, leaving components running");
                        break Ok(());
                    }
                    None => {
                        debug!("signal source closed");
                        listening = false;
                    }
                },
                else => break Ok(()),
            }
        };

        tasks.detach_all();
        outcome
    }

    /// Stops every component concurrently and waits for all of them, each
    /// bounded by the stop timeout.
    pub async fn stop(&self) {
        info!(service = %self.name, "stopping service");
        let mut stopping = JoinSet::new();
        for slot in self.always.iter().chain(&self.init) {
            let slot = slot.clone();
            let timeout = self.stop_timeout;
            let span = self.logging.span(&slot.name);
            stopping.spawn(
                async move {
                    match tokio::time::timeout(timeout, slot.stop()).await {
                        Ok(()) => debug!(component = %slot.name, "component stopped"),
                        Err(_) => error!(
                            component = %slot.name,
                            timeout = ?timeout,
                            "component did not stop in time, abandoned"
                        ),
                    }
                }
                .instrument(span),
            );
        }
        while let Some(joined) = stopping.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "stop task failed");
            }
        }

        info!(service = %self.name, "service stopped");
        self.logging.stop().await;
    }

    /// Runtime handle of the init component registered under `prefix`.
    pub fn get_handle(&self, prefix: &str) -> Option<Handle> {
        self.init
            .iter()
            .find(|slot| slot.prefix() == Some(prefix))
            .and_then(|slot| slot.handle())
    }

    /// Typed lookup; `None` for an unknown prefix or another handle type.
    pub fn get<T: Any + Send + Sync>(&self, prefix: &str) -> Option<Arc<T>> {
        self.get_handle(prefix)?.downcast::<T>().ok()
    }

    /// Typed lookup that treats a missing component as fatal.
    ///
    /// # Panics
    /// When nothing of type `T` is registered under `prefix`.
    pub fn must_get<T: Any + Send + Sync>(&self, prefix: &str) -> Arc<T> {
        match self.get::<T>(prefix) {
            Some(handle) => handle,
            None => {
                error!(prefix = %prefix, "component not found");
                panic!("no component of the requested type registered under prefix {prefix}");
            }
        }
    }

    /// Hands the service to a one-shot function, e.g. a migration or a
    /// maintenance command.
    pub async fn run_function<'a, F, Fut, E>(&'a self, function: F) -> Result<(), E>
    where
        F: FnOnce(&'a dyn ServiceContext) -> Fut,
        Fut: Future<Output = Result<(), E>> + 'a,
    {
        function(self).await
    }
}

impl ServiceContext for Service {
    fn logger(&self, prefix: &str) -> Span {
        self.logging.span(prefix)
    }

    fn get_handle(&self, prefix: &str) -> Option<Handle> {
        Service::get_handle(self, prefix)
    }

    fn env(&self) -> String {
        self.env.get()
    }
}

fn component_name(names: &HashMap<tokio::task::Id, String>, id: tokio::task::Id) -> String {
    names
        .get(&id)
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CallJournal, MockComponent, MockHandle};

    fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
            .name("test")
            .without_env_file()
            .with_args(Vec::<String>::new())
    }

    #[test]
    fn duplicate_prefix_is_rejected() {
        let err = builder()
            .with_init_runnable(MockComponent::new("a").prefix("db"))
            .with_init_runnable(MockComponent::new("b").prefix("db"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::DuplicatePrefix(p) if p == "db"));
    }

    #[test]
    fn http_server_is_last_always_running_component() {
        let service = builder()
            .with_runnable(MockComponent::new("worker"))
            .with_init_runnable(MockComponent::new("db"))
            .build()
            .unwrap();
        let names: Vec<_> = service.component_states().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["db", "worker", "http-server"]);
        assert!(service
            .component_states()
            .iter()
            .all(|(_, s)| *s == LifecycleState::FlagsRegistered));
    }

    #[test]
    fn slots_start_uninitialized_until_flags_resolve() {
        let slot = Slot::new(Member::Plain(Arc::new(MockComponent::new("fresh"))));
        assert_eq!(slot.state(), LifecycleState::Uninitialized);

        let service = builder()
            .with_init_runnable(MockComponent::new("resolved"))
            .build()
            .unwrap();
        assert!(!service
            .component_states()
            .iter()
            .any(|(_, s)| *s == LifecycleState::Uninitialized));
    }

    #[test]
    fn help_flag_surfaces_usage() {
        let err = builder()
            .with_args(["--help"])
            .with_init_runnable(MockComponent::new("cache"))
            .build()
            .err()
            .unwrap();
        match err {
            ServiceError::Config(crate::error::ConfigError::Help(usage)) => {
                assert!(usage.starts_with("Usage of test:"));
                assert!(usage.contains("-http-port"));
                assert!(usage.contains("-cache-setting"));
                assert!(usage.contains("[$APP_ENV]"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn env_defaults_to_dev() {
        let service = builder().build().unwrap();
        assert_eq!(service.env(), DEV_ENV);
        assert!(service.flags().sample_env().contains("APP_ENV"));
    }

    #[tokio::test]
    async fn init_runs_in_registration_order() {
        let journal = CallJournal::default();
        let service = builder()
            .with_init_runnable(MockComponent::new("first").journal(&journal))
            .with_init_runnable(MockComponent::new("second").journal(&journal))
            .build()
            .unwrap();

        service.init().await.unwrap();
        let run_first = journal.position("first:run").unwrap();
        let configure_second = journal.position("second:configure").unwrap();
        assert!(run_first < configure_second);
    }

    #[tokio::test]
    async fn typed_lookup() {
        let service = builder()
            .with_init_runnable(MockComponent::new("cache"))
            .build()
            .unwrap();
        assert_eq!(service.get::<MockHandle>("cache").unwrap().name, "cache");
        assert!(service.get::<String>("cache").is_none());
        assert!(service.get_handle("missing").is_none());

        let ran = service
            .run_function(|ctx| async move {
                ctx.get_handle("cache").map(|_| ()).ok_or("missing cache")
            })
            .await;
        assert!(ran.is_ok());
    }

    #[test]
    #[should_panic(expected = "prefix missing")]
    fn must_get_panics_on_missing_prefix() {
        let service = builder().build().unwrap();
        let _ = service.must_get::<MockHandle>("missing");
    }
}
