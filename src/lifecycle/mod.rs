//! # Lifecycle
//!
//! The component contract ([`Runnable`], [`PrefixRunnable`]), the container
//! that drives it ([`Service`]) and process signal forwarding.

mod runnable;
mod service;
mod signals;

pub use runnable::{Handle, LifecycleState, PrefixRunnable, Runnable};
pub use service::{
    Service, ServiceBuilder, ServiceContext, DEFAULT_STOP_TIMEOUT, DEV_ENV, PRD_ENV, STG_ENV,
};
pub use signals::{os_signals, ProcessSignal};
