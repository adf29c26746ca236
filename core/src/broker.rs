//! Broker seam for the relay
//!
//! The relay talks to its message bus through three layers:
//!
//! - [`Broker`] builds a [`Transport`] (the network link)
//! - [`Transport`] opens a [`Session`] on top of the link
//! - [`Session`] publishes, and drives durable subscriptions into a
//!   [`DeliveryHandler`]
//!
//! Implementations must be `Send + Sync`; the pipelines hold them behind
//! `Arc<dyn Broker>` and `Box<dyn ...>` handles.

use crate::error::StageError;
use crate::restart::SessionLost;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Broker coordinates for one side of the relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Client identity, also used as the durable subscription name
    #[serde(default)]
    pub client_id: String,
    /// Broker-side stream that stores the subject
    #[serde(default)]
    pub cluster_id: String,
    /// Comma separated broker URLs
    #[serde(default)]
    pub urls: String,
    /// Subject published to or subscribed from
    #[serde(default)]
    pub topic: String,
}

/// Options for a durable subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Identity that pins the delivery cursor across reconnects
    pub durable_name: String,
    /// Maximum unacknowledged deliveries outstanding at once
    pub max_in_flight: usize,
    /// Start from everything stored since the durable cursor, not only new messages
    pub deliver_all: bool,
}

impl SubscribeOptions {
    /// Durable, manually acknowledged subscription delivering all available messages
    pub fn durable(name: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            durable_name: name.into(),
            max_in_flight,
            deliver_all: true,
        }
    }
}

/// Builds transport links to a broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name for logging (e.g. "nats", "memory")
    fn name(&self) -> &'static str;

    /// Establish the transport link
    ///
    /// Called repeatedly with backoff by the resilient connection; a single
    /// call must not retry internally.
    async fn connect(&self, stream: &StreamConfig) -> Result<Box<dyn Transport>, StageError>;
}

/// A live network link to the broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the session layer
    ///
    /// `on_lost` must be fired when the session is lost after this call
    /// succeeds. It fires at most once no matter how often it is invoked.
    async fn open_session(
        &self,
        stream: &StreamConfig,
        on_lost: SessionLost,
    ) -> Result<Box<dyn Session>, StageError>;

    /// Release the link; must tolerate being called after the link died
    async fn close(&self);
}

/// The session layer on top of a transport
#[async_trait]
pub trait Session: Send + Sync {
    /// Publish one payload and wait for the broker to accept it
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), StageError>;

    /// Start a durable subscription
    ///
    /// Deliveries are handed to `handler` one at a time. The broker stops
    /// delivering once `max_in_flight` deliveries are unacknowledged.
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), StageError>;

    /// Stop subscriptions and release the session
    async fn close(&self) -> Result<(), StageError>;
}

/// One message delivered by a subscription
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Raw message body
    fn payload(&self) -> &[u8];

    /// Acknowledge receipt to the broker
    async fn ack(&self) -> Result<(), StageError>;
}

/// Consumer of subscription deliveries
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Process one delivery; the handler owns the acknowledgement
    async fn handle(&self, delivery: Box<dyn Delivery>);
}
