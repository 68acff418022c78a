//! # HTTP Server
//!
//! The always-running component every [`Service`](crate::Service) carries.
//! Applications attach routes before `start()`:
//!
//! ```ignore
//! service.http_server().add_handler(|router| {
//!     router.route("/ping", get(|| async { "pong" }))
//! });
//! ```
//!
//! A server without handlers stays disabled: `run()` returns at once and
//! no port is bound.
//!
//! | Flag | Env | Default |
//! |------|-----|---------|
//! | `http-port` | `HTTP_PORT` | `3000`, `0` picks a free port |
//! | `http-addr` | `HTTP_ADDR` | `0.0.0.0` |

use crate::config::{Flag, FlagSet};
use crate::error::ComponentError;
use crate::lifecycle::Runnable;
use async_trait::async_trait;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Span};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_ADDR: &str = "0.0.0.0";

type RouteHandler = Box<dyn FnOnce(Router) -> Router + Send>;

/// axum-backed HTTP component.
pub struct HttpServer {
    span: Span,
    port: Option<Flag<u16>>,
    addr: Option<Flag<String>>,
    handlers: Mutex<Vec<RouteHandler>>,
    enabled: AtomicBool,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    serving: watch::Sender<bool>,
}

impl Default for HttpServer {
    fn default() -> Self {
        Self {
            span: tracing::info_span!("component", name = "http"),
            port: None,
            addr: None,
            handlers: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            serving: watch::Sender::new(false),
        }
    }
}

impl HttpServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers routes. Handlers are applied in order when the server runs.
    pub fn add_handler(&self, handler: impl FnOnce(Router) -> Router + Send + 'static) {
        self.lock_handlers().push(Box::new(handler));
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        *self.serving.borrow()
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The listening port once bound, the configured one before.
    pub fn port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or_else(|| self.configured_port())
    }

    pub fn uri(&self) -> String {
        match self.local_addr() {
            Some(addr) => format!("http://{addr}"),
            None => format!(
                "http://{}",
                format_bind_addr(&self.configured_addr(), self.configured_port())
            ),
        }
    }

    fn configured_port(&self) -> u16 {
        self.port.as_ref().map_or(DEFAULT_PORT, Flag::get)
    }

    fn configured_addr(&self) -> String {
        self.addr
            .as_ref()
            .map(Flag::get)
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string())
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Vec<RouteHandler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn router(&self) -> Router {
        let handlers = std::mem::take(&mut *self.lock_handlers());
        handlers
            .into_iter()
            .fold(Router::new(), |router, handler| handler(router))
    }
}

#[async_trait]
impl Runnable for HttpServer {
    fn name(&self) -> String {
        "http-server".to_string()
    }

    fn init_flags(&mut self, flags: &mut FlagSet) {
        self.port = Some(flags.u16(
            "http-port",
            DEFAULT_PORT,
            "HTTP server port. If 0 => get a random port",
        ));
        self.addr = Some(flags.string("http-addr", DEFAULT_ADDR, "HTTP server bind address"));
    }

    async fn configure(&self) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn run(&self) -> Result<(), ComponentError> {
        if !self.is_enabled() {
            debug!(parent: &self.span, "no handler registered, http server disabled");
            return Ok(());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let bind = format_bind_addr(&self.configured_addr(), self.configured_port());
        debug!(parent: &self.span, addr = %bind, "start listen tcp");
        let listener = TcpListener::bind(&bind).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        info!(parent: &self.span, addr = %local, "listening");

        self.serving.send_replace(true);
        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        self.serving.send_replace(false);

        info!(parent: &self.span, "http server stopped");
        served.map_err(ComponentError::from)
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let mut serving = self.serving.subscribe();
        let _ = serving.wait_for(|serving| !serving).await;
    }
}

/// `host:port`, with IPv6 hosts bracketed.
fn format_bind_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.contains('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
