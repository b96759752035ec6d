//! Pub/sub transport seam.
//!
//! The client only needs four capabilities from a transport: publish a
//! payload to a topic, subscribe and unsubscribe a topic (each with an
//! acknowledgment that may carry an error), and deliver inbound
//! `(topic, payload)` messages. Delivery guarantees, session upkeep and
//! reconnects belong to the transport.

pub mod memory;

use async_trait::async_trait;
use tether_core::Payload;

pub use memory::{MemoryBroker, MemoryTransport, SubscriptionStats};

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Options attached to one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

/// Options attached to one subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeOptions {
    pub qos: QoS,
}

/// A message received for one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Payload,
}

impl InboundMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Failure carried by a transport acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("unsubscribe from {topic} failed: {reason}")]
    Unsubscribe { topic: String, reason: String },
}

/// Topic-addressed publish/subscribe channel used by the client.
///
/// Inbound messages are delivered out of band: either through the inbox
/// receiver handed to `RpcClient::start`, or by the transport glue calling
/// `RpcClient::dispatch` from its own message callback.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes `payload` to `topic`, resolving once the transport
    /// acknowledged the publish at the requested QoS.
    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        opts: &PublishOptions,
    ) -> Result<(), TransportError>;

    /// Subscribes to `topic`, resolving once the subscription is active.
    async fn subscribe(&self, topic: &str, opts: &SubscribeOptions) -> Result<(), TransportError>;

    /// Removes the subscription for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}
