#![doc(html_logo_url = "https://www.rust-lang.org/logos/rust-logo-128x128.png")]
#![doc(html_favicon_url = "https://www.rust-lang.org/favicon.ico")]
//! # servicekit
//!
//! > **Bootstrap a microservice out of pluggable components.**
//!
//! A service is a container of components. Each component declares its
//! configuration, gets configured, runs, and is stopped, always by the
//! container and always through the same [`Runnable`] contract. The kit ships
//! the components most services need: an HTTP server, an in-process pub/sub
//! bus, logging, and a retryable job primitive.
//!
//! ## 🏗️ Design Philosophy
//!
//! ### Init components vs. always-running components
//! - **Init components** ([`ServiceBuilder::with_init_runnable`]) are the
//!   things a service *needs* before serving: a database pool, a bus, a
//!   client. They run one after another, fail fast, and can be looked up by
//!   prefix afterwards.
//! - **Always-running components** ([`ServiceBuilder::with_runnable`], plus
//!   the HTTP server) *are* the service. They run concurrently; the first one
//!   to fail brings the whole service down.
//!
//! ### Configuration is declared, not read
//! Components register typed flags on a shared [`FlagSet`] and keep the
//! returned [`Flag`] handles. Every flag is also an environment variable
//! (`pubsub-graceful-stop` -> `PUBSUB_GRACEFUL_STOP`), and a `.env` file is
//! loaded first, so the same binary runs on a laptop and in a container.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Contract ([`lifecycle`])
//! - **Role**: [`Runnable`] / [`PrefixRunnable`] and the [`Service`]
//!   container that drives them, plus signal handling.
//! - **Key items**: [`ServiceBuilder`], [`Service::init`], [`Service::start`],
//!   [`Service::stop`], [`Service::must_get`].
//!
//! ### 2. Configuration ([`config`])
//! - **Role**: flag registry resolved through `figment`, env-file loading
//!   through `dotenvy`.
//!
//! ### 3. Messaging ([`pubsub`])
//! - **Role**: the [`PubSub`](pubsub::PubSub) provider contract and
//!   [`LocalPubSub`](pubsub::LocalPubSub), an in-process broadcast bus with
//!   graceful drain.
//!
//! ### 4. Background Work ([`asyncjob`])
//! - **Role**: [`Job`](asyncjob::Job) with a retry schedule and
//!   [`Group`](asyncjob::Group) for parallel or sequential composition.
//!
//! ### 5. Plumbing ([`httpserver`], [`logging`], [`mock`])
//! - The axum-backed HTTP component, the `tracing` setup, and a scriptable
//!   component double for tests.
//!
//! ## 🚀 Quick Start
//!
//! ```ignore
//! use servicekit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ServiceBuilder::new()
//!         .name("orders")
//!         .version("1.0.0")
//!         .with_init_runnable(LocalPubSub::new("pubsub"))
//!         .build()?;
//!
//!     service.http_server().add_handler(|router| {
//!         router.route("/ping", axum::routing::get(|| async { "pong" }))
//!     });
//!
//!     service.init().await?;
//!     service.start().await?;
//!     Ok(())
//! }
//! ```

pub mod asyncjob;
pub mod config;
pub mod error;
pub mod httpserver;
pub mod lifecycle;
pub mod logging;
pub mod mock;
pub mod pubsub;

pub use config::{Flag, FlagSet};
pub use error::{BoxError, ComponentError, ConfigError, JobError, PubSubError, ServiceError};
pub use httpserver::HttpServer;
pub use lifecycle::{
    Handle, LifecycleState, PrefixRunnable, ProcessSignal, Runnable, Service, ServiceBuilder,
    ServiceContext,
};
pub use logging::Logging;

/// The items most services import.
pub mod prelude {
    pub use crate::asyncjob::{Group, Job, JobState};
    pub use crate::pubsub::{Channel, Event, EventReceiver, LocalPubSub, PubSub, Unsubscribe};
    pub use crate::{
        ComponentError, Flag, FlagSet, PrefixRunnable, Runnable, Service, ServiceBuilder,
        ServiceContext, ServiceError,
    };
}
