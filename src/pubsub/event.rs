//! # Events
//!
//! An [`Event`] is the unit carried by the bus: a title, optional author and
//! receiver references, a JSON payload, the channel it was published to and,
//! once dispatched, an acknowledgement handle for that delivered copy.

use crate::error::PubSubError;
use crate::pubsub::inflight::CopyToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A topic name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// An uploaded image attached to an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "img_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(rename = "org_width", default)]
    pub width: u32,
    #[serde(rename = "org_height", default)]
    pub height: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_id: String,
    #[serde(default)]
    pub dominant_color: String,
}

/// Something an event is about: a sender or a receiver.
pub trait Entity {
    fn entity_id(&self) -> String;
    fn entity_name(&self) -> String;
    fn entity_object(&self) -> String;
    fn entity_image(&self) -> Option<Image> {
        None
    }
}

/// Snapshot of an [`Entity`] carried inside an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDetail {
    pub id: String,
    pub name: String,
    pub object: String,
    pub image: Option<Image>,
}

impl EntityDetail {
    pub fn from_entity(entity: &dyn Entity) -> Self {
        Self {
            id: entity.entity_id(),
            name: entity.entity_name(),
            object: entity.entity_object(),
            image: entity.entity_image(),
        }
    }
}

/// Acknowledgement handle of one delivered copy of an event.
///
/// Each subscriber gets its own copy. The event counts as handled once every
/// delivered copy is acknowledged or dropped; clones of a single copy share
/// its acknowledgement.
#[derive(Clone)]
pub struct Ack {
    token: Arc<CopyToken>,
}

impl Ack {
    pub(crate) fn new(token: CopyToken) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    pub fn ack(&self) {
        self.token.finish();
    }

    /// Whether this copy was acknowledged.
    pub fn is_acked(&self) -> bool {
        self.token.is_finished()
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack").field("acked", &self.is_acked()).finish()
    }
}

/// An application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub author: Option<EntityDetail>,
    pub receiver: Option<EntityDetail>,
    pub channel: Channel,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_data: Option<Vec<u8>>,
    #[serde(skip)]
    ack: Option<Ack>,
}

impl Event {
    /// A new event with a fresh id and the current time.
    pub fn new(title: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            author: None,
            receiver: None,
            channel: Channel::default(),
            data,
            created_at: Utc::now(),
            remote_data: None,
            ack: None,
        }
    }

    /// Serializes `data` into the payload.
    pub fn with_data<T: Serialize>(title: impl Into<String>, data: &T) -> Result<Self, PubSubError> {
        Ok(Self::new(title, serde_json::to_value(data)?))
    }

    /// A new event about `author` addressed to `receiver`.
    pub fn between(
        title: impl Into<String>,
        author: Option<&dyn Entity>,
        receiver: Option<&dyn Entity>,
        data: serde_json::Value,
    ) -> Self {
        let mut event = Self::new(title, data);
        event.author = author.map(EntityDetail::from_entity);
        event.receiver = receiver.map(EntityDetail::from_entity);
        event
    }

    pub fn builder(title: impl Into<String>, data: serde_json::Value) -> EventBuilder {
        EventBuilder {
            event: Self::new(title, data),
        }
    }

    /// Decodes the payload into `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, PubSubError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Acknowledges this copy of the event. No-op when the event was never
    /// dispatched.
    pub fn ack(&self) {
        if let Some(ack) = &self.ack {
            ack.ack();
        }
    }

    /// The acknowledgement handle, present once the event was dispatched
    /// to at least one subscriber.
    pub fn ack_handle(&self) -> Option<&Ack> {
        self.ack.as_ref()
    }

    pub(crate) fn set_channel(&mut self, channel: Channel) {
        self.channel = channel;
    }

    pub(crate) fn bind_ack(&mut self, ack: Ack) {
        self.ack = Some(ack);
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.author, &self.receiver) {
            (Some(author), Some(receiver)) => write!(
                f,
                "Event '{}' | Author: {} - ID: {} ({}) | Receiver: {} - ID: {} ({})",
                self.title,
                author.name,
                author.id,
                author.object,
                receiver.name,
                receiver.id,
                receiver.object
            ),
            (None, Some(receiver)) => write!(
                f,
                "Event '{}' | Author: System | Receiver: {} - ID: {} ({})",
                self.title, receiver.name, receiver.id, receiver.object
            ),
            _ => write!(f, "Event '{}' | Data: {}", self.title, self.data),
        }
    }
}

/// Fills in author and receiver details step by step.
#[derive(Debug)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn sender(mut self, id: impl Into<String>, object: impl Into<String>) -> Self {
        let author = self.event.author.get_or_insert_with(EntityDetail::default);
        author.id = id.into();
        author.object = object.into();
        self
    }

    pub fn sender_profile(mut self, name: impl Into<String>, image: Option<Image>) -> Self {
        let author = self.event.author.get_or_insert_with(EntityDetail::default);
        author.name = name.into();
        author.image = image;
        self
    }

    pub fn receiver(mut self, id: impl Into<String>, object: impl Into<String>) -> Self {
        let receiver = self.event.receiver.get_or_insert_with(EntityDetail::default);
        receiver.id = id.into();
        receiver.object = object.into();
        self
    }

    pub fn receiver_profile(mut self, name: impl Into<String>, image: Option<Image>) -> Self {
        let receiver = self.event.receiver.get_or_insert_with(EntityDetail::default);
        receiver.name = name.into();
        receiver.image = image;
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}
