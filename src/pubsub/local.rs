//! # Local Pub/Sub
//!
//! [`LocalPubSub`] is an in-process broadcast bus. Publishing only enqueues;
//! a single dispatch task pulls events in FIFO order and copies each one into
//! the mailbox of every subscriber of its channel.
//!
//! ```text
//! publish ──▶ [ingress queue] ──▶ dispatch task ──┬──▶ subscriber mailbox
//!                                                 ├──▶ subscriber mailbox
//!                                                 └──▶ ...
//! ```
//!
//! ## Configuration
//!
//! | Flag | Default | |
//! |------|---------|-|
//! | `{prefix}-log-enabled` | `true` | log enqueue and dequeue |
//! | `{prefix}-graceful-stop` | `false` | drain before stopping |
//! | `{prefix}-mailbox-size` | `64` | per-subscriber buffer |
//! | `{prefix}-drain-timeout` | `0` | seconds to wait for the drain, `0` waits forever |
//!
//! ## Graceful Stop
//!
//! Every accepted publish holds an in-flight slot until its event is dropped
//! for lack of subscribers or every delivered copy has been acknowledged or
//! dropped. Copies still buffered when a subscription ends are discarded and
//! stop counting. With `graceful-stop` on, [`Runnable::stop`] waits for all
//! slots before closing subscriptions.

use crate::config::{Flag, FlagSet};
use crate::error::{ComponentError, PubSubError};
use crate::lifecycle::{Handle, PrefixRunnable, Runnable};
use crate::pubsub::event::{Ack, Channel, Event};
use crate::pubsub::inflight::{Delivery, InFlight, InFlightGuard};
use crate::pubsub::provider::{EventReceiver, Mailbox, PubSub, Unsubscribe};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

pub const DEFAULT_PREFIX: &str = "pubsub";
pub const DEFAULT_MAILBOX_SIZE: usize = 64;

type Queued = (Event, InFlightGuard);
type Ingress = mpsc::UnboundedReceiver<Queued>;

/// Resolved settings of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubSubOptions {
    pub log_enabled: bool,
    pub graceful_stop: bool,
    pub mailbox_size: usize,
    pub drain_timeout: Option<Duration>,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            log_enabled: true,
            graceful_stop: false,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
            drain_timeout: None,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PubSubStats {
    /// Publishes accepted into the queue.
    pub published: u64,
    /// Copies placed into a subscriber mailbox.
    pub delivered: u64,
    /// Copies discarded because a mailbox was full.
    pub dropped: u64,
    /// Accepted events not yet finished.
    pub in_flight: usize,
}

struct PubSubFlags {
    log_enabled: Flag<bool>,
    graceful_stop: Flag<bool>,
    mailbox_size: Flag<usize>,
    drain_timeout: Flag<u64>,
}

impl PubSubFlags {
    fn resolve(&self) -> PubSubOptions {
        let secs = self.drain_timeout.get();
        PubSubOptions {
            log_enabled: self.log_enabled.get(),
            graceful_stop: self.graceful_stop.get(),
            mailbox_size: self.mailbox_size.get().max(1),
            drain_timeout: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    mailbox: Arc<Mailbox>,
}

type Registry = HashMap<Channel, Arc<Vec<Subscriber>>>;

struct Inner {
    prefix: String,
    span: Span,
    options: RwLock<PubSubOptions>,
    configured: AtomicBool,
    running: AtomicBool,
    stopping: AtomicBool,
    // Publishers enqueue under the read side; stop flips `stopping` under
    // the write side, so nothing is enqueued after the final drain.
    gate: RwLock<()>,
    subscribers: RwLock<Registry>,
    next_subscriber: AtomicU64,
    ingress_tx: mpsc::UnboundedSender<Queued>,
    ingress_rx: Mutex<Option<Ingress>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    dispatcher: Mutex<Option<JoinHandle<Ingress>>>,
    inflight: InFlight,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// In-process pub/sub bus. Clones share the same bus.
#[derive(Clone)]
pub struct LocalPubSub {
    inner: Arc<Inner>,
    flags: Option<Arc<PubSubFlags>>,
}

impl LocalPubSub {
    /// A bus registered under `prefix`, configured through flags.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_options(prefix, PubSubOptions::default())
    }

    /// A bus with fixed settings, for use outside a service container.
    pub fn with_options(prefix: impl Into<String>, options: PubSubOptions) -> Self {
        let prefix = prefix.into();
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            span: tracing::info_span!("component", name = %prefix),
            prefix,
            options: RwLock::new(options),
            configured: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            gate: RwLock::new(()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            stop_tx: Mutex::new(None),
            dispatcher: Mutex::new(None),
            inflight: InFlight::new(),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
            flags: None,
        }
    }

    /// Settings in effect; flag values once configured.
    pub fn options(&self) -> PubSubOptions {
        *self
            .inner
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the dispatch task is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            in_flight: self.inner.inflight.count(),
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, |list| list.len())
    }

    /// Waits until every accepted event is finished.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<(), PubSubError> {
        let idle = self.inner.inflight.wait_idle();
        match timeout {
            None => {
                idle.await;
                Ok(())
            }
            Some(limit) => tokio::time::timeout(limit, idle)
                .await
                .map_err(|_| PubSubError::DrainTimeout(limit, self.inner.inflight.count())),
        }
    }

    fn log_enabled(&self) -> bool {
        self.options().log_enabled
    }
}

impl Inner {
    fn dispatch(&self, event: Event, guard: InFlightGuard, log_enabled: bool) {
        if log_enabled {
            debug!(channel = %event.channel, event = %event, "event dequeued");
        }

        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.channel)
            .cloned();
        let Some(subscribers) = subscribers.filter(|list| !list.is_empty()) else {
            debug!(channel = %event.channel, "no subscriber, event dropped");
            return;
        };

        let delivery = Delivery::new(guard);
        let _hold = delivery.copy();
        for subscriber in subscribers.iter() {
            if subscriber.mailbox.is_closed() {
                continue;
            }
            let mut copy = event.clone();
            copy.bind_ack(Ack::new(delivery.copy()));
            match subscriber.tx.try_send(copy) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        channel = %event.channel,
                        subscriber = subscriber.id,
                        "subscriber mailbox full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = subscriber.id, "subscriber receiver dropped");
                }
            }
        }
    }

    fn remove_subscriber(&self, channel: &Channel, id: u64) {
        let mut registry = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = registry.get_mut(channel) else {
            return;
        };
        let remaining: Vec<Subscriber> = list.iter().filter(|s| s.id != id).cloned().collect();
        if remaining.is_empty() {
            registry.remove(channel);
        } else {
            *list = Arc::new(remaining);
        }
    }

    fn close_all(&self) {
        let mut registry = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for list in registry.values() {
            for subscriber in list.iter() {
                subscriber.mailbox.close();
            }
        }
        registry.clear();
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut ingress: Ingress,
    mut stop: oneshot::Receiver<()>,
    log_enabled: bool,
) -> Ingress {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            next = ingress.recv() => match next {
                Some((event, guard)) => inner.dispatch(event, guard, log_enabled),
                None => break,
            },
        }
    }
    ingress
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, channel: &Channel, mut event: Event) -> Result<(), PubSubError> {
        event.set_channel(channel.clone());
        let log_enabled = self.log_enabled();

        let _gate = self.inner.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.inner.stopping.load(Ordering::Acquire) {
            debug!(parent: &self.inner.span, channel = %channel, "bus stopping, publish ignored");
            return Ok(());
        }
        if log_enabled {
            debug!(parent: &self.inner.span, channel = %channel, event = %event, "new event enqueued");
        }
        let guard = self.inner.inflight.acquire();
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if self.inner.ingress_tx.send((event, guard)).is_err() {
            warn!(parent: &self.inner.span, channel = %channel, "dispatch queue closed, event dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &Channel) -> (EventReceiver, Unsubscribe) {
        let (tx, rx) = mpsc::channel(self.options().mailbox_size.max(1));
        let mailbox = Mailbox::new(rx);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let list = registry.entry(channel.clone()).or_default();
            let mut extended = list.as_ref().clone();
            extended.push(Subscriber {
                id,
                tx,
                mailbox: mailbox.clone(),
            });
            *list = Arc::new(extended);
        }
        debug!(parent: &self.inner.span, channel = %channel, subscriber = id, "subscribed");

        let weak = Arc::downgrade(&self.inner);
        let channel = channel.clone();
        let closing = mailbox.clone();
        let unsubscribe = Unsubscribe::new(move || {
            closing.close();
            if let Some(inner) = weak.upgrade() {
                inner.remove_subscriber(&channel, id);
                debug!(parent: &inner.span, channel = %channel, subscriber = id, "unsubscribed");
            }
        });

        (EventReceiver::from_mailbox(mailbox), unsubscribe)
    }
}

#[async_trait]
impl Runnable for LocalPubSub {
    fn name(&self) -> String {
        "pubsub".to_string()
    }

    fn init_flags(&mut self, flags: &mut FlagSet) {
        let prefix = &self.inner.prefix;
        let defaults = self.options();
        self.flags = Some(Arc::new(PubSubFlags {
            log_enabled: flags.bool(
                &format!("{prefix}-log-enabled"),
                defaults.log_enabled,
                "Enable log when publish and receive events",
            ),
            graceful_stop: flags.bool(
                &format!("{prefix}-graceful-stop"),
                defaults.graceful_stop,
                "Wait for published events to be handled before stopping",
            ),
            mailbox_size: flags.usize(
                &format!("{prefix}-mailbox-size"),
                defaults.mailbox_size,
                "Buffered events per subscriber",
            ),
            drain_timeout: flags.u64(
                &format!("{prefix}-drain-timeout"),
                defaults.drain_timeout.map_or(0, |d| d.as_secs()),
                "Seconds to wait for the graceful drain, 0 waits forever",
            ),
        }));
    }

    async fn configure(&self) -> Result<(), ComponentError> {
        if self.inner.configured.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(flags) = &self.flags {
            let resolved = flags.resolve();
            *self
                .inner
                .options
                .write()
                .unwrap_or_else(PoisonError::into_inner) = resolved;
        }
        Ok(())
    }

    async fn run(&self) -> Result<(), ComponentError> {
        self.configure().await?;
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ingress = self
            .inner
            .ingress_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(ingress) = ingress else {
            self.inner.running.store(false, Ordering::Release);
            return Err(ComponentError::config("dispatch queue is unavailable"));
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.inner.stop_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);
        self.inner.stopping.store(false, Ordering::Release);

        let task = dispatch_loop(self.inner.clone(), ingress, stop_rx, self.log_enabled())
            .instrument(self.inner.span.clone());
        *self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tokio::spawn(task));

        info!(parent: &self.inner.span, "pubsub started");
        Ok(())
    }

    async fn stop(&self) {
        info!(parent: &self.inner.span, "pubsub stopping");
        {
            let _gate = self.inner.gate.write().unwrap_or_else(PoisonError::into_inner);
            self.inner.stopping.store(true, Ordering::Release);
        }

        let options = self.options();
        if options.graceful_stop && self.is_running() {
            if let Err(e) = self.drain(options.drain_timeout).await {
                warn!(parent: &self.inner.span, error = %e, "graceful drain incomplete");
            }
        }

        let stop_tx = self
            .inner
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            match handle.await {
                Ok(mut ingress) => {
                    // Queued but never dispatched: release their slots.
                    while ingress.try_recv().is_ok() {}
                    *self
                        .inner
                        .ingress_rx
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(ingress);
                }
                Err(e) => error!(parent: &self.inner.span, error = %e, "dispatch task failed"),
            }
        }

        self.inner.close_all();
        self.inner.running.store(false, Ordering::Release);
        info!(parent: &self.inner.span, "pubsub stopped");
    }
}

impl PrefixRunnable for LocalPubSub {
    fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    fn handle(&self) -> Handle {
        Arc::new(self.clone())
    }
}

impl std::fmt::Debug for LocalPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPubSub")
            .field("prefix", &self.inner.prefix)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> LocalPubSub {
        LocalPubSub::with_options(
            DEFAULT_PREFIX,
            PubSubOptions {
                log_enabled: false,
                ..PubSubOptions::default()
            },
        )
    }

    async fn next(rx: &mut EventReceiver) -> Event {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event not delivered in time")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = bus();
        bus.run().await.unwrap();
        let chat = Channel::from("chat");
        let (mut rx, _unsub) = bus.subscribe(&chat).await;

        for n in 0..10 {
            bus.publish(&chat, Event::new("msg", json!(n))).await.unwrap();
        }
        for n in 0..10 {
            let event = next(&mut rx).await;
            assert_eq!(event.data, json!(n));
            assert_eq!(event.channel, chat);
        }
        bus.stop().await;
    }

    #[tokio::test]
    async fn event_on_dead_channel_is_dropped() {
        let bus = bus();
        bus.run().await.unwrap();
        bus.publish(&"nobody".into(), Event::new("lost", json!(null)))
            .await
            .unwrap();

        bus.drain(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(bus.stats().published, 1);
        assert_eq!(bus.stats().delivered, 0);
        bus.stop().await;
    }

    #[tokio::test]
    async fn full_mailbox_drops_copy() {
        let bus = LocalPubSub::with_options(
            DEFAULT_PREFIX,
            PubSubOptions {
                log_enabled: false,
                mailbox_size: 1,
                ..PubSubOptions::default()
            },
        );
        bus.run().await.unwrap();
        let chat = Channel::from("chat");
        let (mut rx, _unsub) = bus.subscribe(&chat).await;

        bus.publish(&chat, Event::new("a", json!(1))).await.unwrap();
        bus.publish(&chat, Event::new("b", json!(2))).await.unwrap();
        let err = bus.drain(Some(Duration::from_millis(100))).await.unwrap_err();
        assert!(matches!(err, PubSubError::DrainTimeout(_, 1)));

        let first = next(&mut rx).await;
        assert_eq!(first.title, "a");
        assert_eq!(bus.stats().dropped, 1);
        drop(first);
        bus.drain(Some(Duration::from_secs(1))).await.unwrap();
        bus.stop().await;
    }

    #[tokio::test]
    async fn stop_before_run_returns_and_ignores_publishes() {
        let bus = bus();
        bus.stop().await;
        bus.publish(&"chat".into(), Event::new("late", json!(null)))
            .await
            .unwrap();
        assert_eq!(bus.stats().published, 0);
    }

    #[tokio::test]
    async fn run_twice_is_noop() {
        let bus = bus();
        bus.run().await.unwrap();
        bus.run().await.unwrap();
        assert!(bus.is_running());
        bus.stop().await;
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn flags_configure_options() {
        let mut bus = LocalPubSub::new("bus");
        let mut flags = FlagSet::new("test");
        bus.init_flags(&mut flags);
        flags
            .parse(["--bus-graceful-stop", "--bus-mailbox-size=8", "--bus-drain-timeout=3"])
            .unwrap();
        bus.configure().await.unwrap();

        let options = bus.options();
        assert!(options.graceful_stop);
        assert!(options.log_enabled);
        assert_eq!(options.mailbox_size, 8);
        assert_eq!(options.drain_timeout, Some(Duration::from_secs(3)));
    }
}
