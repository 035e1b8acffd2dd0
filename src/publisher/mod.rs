//! Publish side: the publisher contract, broker clients and the buffered
//! delivery pump.
//!
//! A successful [`Publisher::publish`] means "accepted into the local send
//! buffer", never "acknowledged by the broker". Delivery outcomes surface through
//! [`PublisherStats`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{HookResult, PublishRejected};

/// Buffered publisher with backpressure and retry.
pub mod buffered;
/// Broker client trait and built-in clients.
pub mod client;
/// Broker configuration.
pub mod config;

pub use buffered::{BufferedPublisher, PublisherStats};
pub use client::{BrokerClient, DeliveryError, LogBroker, MemoryBroker, OutboundRecord};
pub use config::{Acks, BrokerConfig, Compression, Secret, SecurityProtocol};

/// Options for [`Publisher::create_topic`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicOptions {
    /// Partition count; broker default when unset.
    pub partitions: Option<u32>,
    /// Replication factor; broker default when unset.
    pub replication_factor: Option<u16>,
    /// Additional topic-level settings passed through verbatim.
    pub settings: BTreeMap<String, String>,
}

/// Contract between the serializer and whatever moves bytes to the broker.
pub trait Publisher: Send + Sync {
    /// Offer one message for delivery.
    ///
    /// # Errors
    /// The reason the message was refused. Refusals are never retried by the
    /// publisher; the caller decides.
    fn try_publish(&self, topic: &str, message: &[u8]) -> Result<(), PublishRejected>;

    /// Offer one message; true if it was accepted for delivery.
    fn publish(&self, topic: &str, message: &[u8]) -> bool {
        self.try_publish(topic, message).is_ok()
    }

    /// String convenience for [`publish`](Self::publish).
    fn publish_str(&self, topic: &str, message: &str) -> bool {
        self.publish(topic, message.as_bytes())
    }

    /// Create a topic on the broker.
    ///
    /// # Errors
    /// `HookError::UnsupportedOperation` for backends without dynamic topic creation.
    fn create_topic(&self, topic: &str, options: &TopicOptions) -> HookResult<()>;
}
