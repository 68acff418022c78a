//! # Pub/Sub
//!
//! Channel-based publish/subscribe. [`PubSub`] is the provider contract;
//! [`LocalPubSub`] is the in-process implementation, runnable inside a
//! [`Service`](crate::Service) and retrievable by its prefix.
//!
//! # Example
//!
//! ```ignore
//! let bus: Arc<LocalPubSub> = service.must_get("pubsub");
//! let (mut rx, unsubscribe) = bus.subscribe(&"chat".into()).await;
//! bus.publish(&"chat".into(), Event::new("hello", json!({"text": "hi"}))).await?;
//!
//! while let Some(event) = rx.recv().await {
//!     handle(&event);
//!     event.ack();
//! }
//! unsubscribe.unsubscribe();
//! ```

mod event;
mod inflight;
mod local;
mod provider;

pub use event::{Ack, Channel, Entity, EntityDetail, Event, EventBuilder, Image};
pub use local::{LocalPubSub, PubSubOptions, PubSubStats, DEFAULT_MAILBOX_SIZE, DEFAULT_PREFIX};
pub use provider::{EventReceiver, PubSub, Unsubscribe};
