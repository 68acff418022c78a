//! OS signal forwarding.

use crate::error::ServiceError;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A process signal the container reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// SIGINT / Ctrl-C: stop everything.
    Interrupt,
    /// SIGTERM: stop everything.
    Terminate,
    /// SIGHUP: hand control back without stopping (reload).
    Hangup,
}

impl ProcessSignal {
    pub fn stops_service(self) -> bool {
        !matches!(self, ProcessSignal::Hangup)
    }
}

/// Installs handlers for SIGINT, SIGTERM and SIGHUP and forwards them.
///
/// Handlers are installed before this returns, so a signal that arrives
/// right after is not lost.
#[cfg(unix)]
pub fn os_signals() -> Result<mpsc::Receiver<ProcessSignal>, ServiceError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).map_err(ServiceError::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(ServiceError::Signal)?;
    let mut hangup = signal(SignalKind::hangup()).map_err(ServiceError::Signal)?;
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = interrupt.recv() => ProcessSignal::Interrupt,
                Some(()) = terminate.recv() => ProcessSignal::Terminate,
                Some(()) = hangup.recv() => ProcessSignal::Hangup,
                else => break,
            };
            info!(signal = ?sig, "signal received");
            if tx.send(sig).await.is_err() {
                break;
            }
        }
        debug!("signal forwarder exited");
    });

    Ok(rx)
}

#[cfg(not(unix))]
pub fn os_signals() -> Result<mpsc::Receiver<ProcessSignal>, ServiceError> {
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = ?ProcessSignal::Interrupt, "signal received");
            if tx.send(ProcessSignal::Interrupt).await.is_err() {
                break;
            }
        }
        debug!("signal forwarder exited");
    });

    Ok(rx)
}
