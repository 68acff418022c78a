//! # Provider Contract
//!
//! [`PubSub`] is implemented by the in-process [`LocalPubSub`](super::LocalPubSub)
//! and by any broker-backed adapter. Callers only see a receive stream and an
//! unsubscribe closure, so they stay transport-agnostic.

use crate::error::PubSubError;
use crate::pubsub::event::{Channel, Event};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes `event` on `channel`. Never waits for delivery.
    async fn publish(&self, channel: &Channel, event: Event) -> Result<(), PubSubError>;

    /// Registers a new subscriber on `channel`.
    async fn subscribe(&self, channel: &Channel) -> (EventReceiver, Unsubscribe);
}

/// Buffered events of one subscription, shared by the provider and the
/// [`EventReceiver`].
///
/// Closing discards whatever is still buffered, so undelivered copies never
/// outlive the subscription.
#[derive(Debug)]
pub(crate) struct Mailbox {
    rx: Mutex<mpsc::Receiver<Event>>,
    closed: AtomicBool,
}

impl Mailbox {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Arc<Self> {
        Arc::new(Self {
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        rx.close();
        while rx.try_recv().is_ok() {}
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Poll::Ready(None);
        }
        rx.poll_recv(cx)
    }

    fn try_recv(&self) -> Option<Event> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return None;
        }
        rx.try_recv().ok()
    }
}

/// Receiving half of a subscription. Dropping it closes the subscription's
/// mailbox.
#[derive(Debug)]
pub struct EventReceiver {
    mailbox: Arc<Mailbox>,
}

impl EventReceiver {
    /// Wraps a channel fed by a provider adapter.
    pub fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self::from_mailbox(Mailbox::new(rx))
    }

    pub(crate) fn from_mailbox(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }

    /// Next event, or `None` once unsubscribed or the provider stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        std::future::poll_fn(|cx| self.mailbox.poll_recv(cx)).await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.mailbox.try_recv()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Ends the subscription's stream and discards buffered events.
    pub fn close(&mut self) {
        self.mailbox.close();
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}

type UnsubscribeFn = Box<dyn Fn() + Send + Sync>;

/// Removes a subscription. Runs its action at most once, however many
/// clones call it.
#[derive(Clone)]
pub struct Unsubscribe {
    done: Arc<AtomicBool>,
    action: Arc<UnsubscribeFn>,
}

impl Unsubscribe {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            done: Arc::new(AtomicBool::new(false)),
            action: Arc::new(Box::new(action)),
        }
    }

    pub fn unsubscribe(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.action)();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("done", &self.is_done())
            .finish()
    }
}
