//! # Runnable Contract
//!
//! The `Runnable` trait is the contract every pluggable component (HTTP
//! server, bus, database connector, third-party client) implements so the
//! [`Service`](super::Service) container can drive it through the same
//! lifecycle:
//!
//! ```text
//! Uninitialized -> FlagsRegistered -> Configured -> Running -> Stopped
//! ```
//!
//! # Architecture Note
//! Transitions are invoked by the container, never by the component itself.
//! `init_flags` takes `&mut self` because it only runs while the container is
//! being built, before anything is shared. From then on components live
//! behind an `Arc` and are driven concurrently, so `configure`, `run` and
//! `stop` take `&self` and keep their mutable state behind interior
//! mutability.
//!
//! # Idempotence
//! `configure` and `run` must be safe to call more than once: a second call
//! is a no-op returning `Ok(())`. `stop` must complete even when the
//! component was never started.

use crate::config::FlagSet;
use crate::error::ComponentError;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque runtime handle exposed by a [`PrefixRunnable`] (a DB pool, a
/// client, a bus). Recover the concrete type with `Arc::downcast`.
pub type Handle = Arc<dyn Any + Send + Sync>;

/// A component whose lifecycle is managed by the container.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Human-readable component name, used in logs.
    fn name(&self) -> String;

    /// Registers the component's configuration surface.
    fn init_flags(&mut self, flags: &mut FlagSet);

    /// Validates settings and prepares resources. Idempotent.
    async fn configure(&self) -> Result<(), ComponentError>;

    /// Starts the component. Long-running components may block here until
    /// stopped; others return as soon as their background work is spawned.
    /// Idempotent.
    async fn run(&self) -> Result<(), ComponentError>;

    /// Stops the component; the returned future resolves once teardown is
    /// complete.
    async fn stop(&self);
}

/// A runnable registered under a unique prefix whose handle can be looked
/// up through the container.
pub trait PrefixRunnable: Runnable {
    /// Registry key, also used as the flag prefix.
    fn prefix(&self) -> &str;

    /// The component's runtime handle.
    fn handle(&self) -> Handle;
}

/// Where a registered component is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Uninitialized,
    FlagsRegistered,
    Configured,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::FlagsRegistered => "flags-registered",
            LifecycleState::Configured => "configured",
            LifecycleState::Running => "running",
            LifecycleState::Failed => "failed",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
