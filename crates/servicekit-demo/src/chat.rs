//! Background component that logs every message posted to the `chat` channel.

use async_trait::async_trait;
use servicekit::pubsub::{Channel, LocalPubSub, PubSub};
use servicekit::{ComponentError, FlagSet, Runnable};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

pub struct ChatLogger {
    bus: Arc<LocalPubSub>,
    channel: Channel,
    stopped: Notify,
}

impl ChatLogger {
    pub fn new(bus: Arc<LocalPubSub>, channel: impl Into<Channel>) -> Self {
        Self {
            bus,
            channel: channel.into(),
            stopped: Notify::new(),
        }
    }
}

#[async_trait]
impl Runnable for ChatLogger {
    fn name(&self) -> String {
        "chat-logger".to_string()
    }

    fn init_flags(&mut self, _flags: &mut FlagSet) {}

    async fn configure(&self) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn run(&self) -> Result<(), ComponentError> {
        let (mut events, unsubscribe) = self.bus.subscribe(&self.channel).await;
        info!(channel = %self.channel, "listening");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        info!(id = %event.id, data = %event.data, "{event}");
                        event.ack();
                    }
                    None => break,
                },
                _ = self.stopped.notified() => break,
            }
        }
        unsubscribe.unsubscribe();
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.notify_one();
    }
}
