//! Broker client seam.
//!
//! The broker itself is an external collaborator. [`BrokerClient`] is the only
//! surface the publisher needs from it: hand over one record, and optionally
//! create a topic.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::error::{ConfigError, HookError, HookResult};

use super::TopicOptions;

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Destination topic.
    pub topic: String,
    /// Serialized message.
    pub payload: Vec<u8>,
}

/// Why the broker client could not take a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Retryable (broker unavailable, leader election, request timeout).
    #[error("Transient delivery failure: {message}")]
    Transient {
        message: String,
    },

    /// Retrying will not help (unknown topic, record rejected).
    #[error("Fatal delivery failure: {message}")]
    Fatal {
        message: String,
    },
}

impl DeliveryError {
    #[allow(missing_docs)]
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Contract a broker client must satisfy.
///
/// `send` is called from the publisher's pump thread only, one record at a time.
pub trait BrokerClient: Send + Sync + 'static {
    /// Apply the producer property map (see
    /// [`BrokerConfig::to_properties`](super::BrokerConfig::to_properties)).
    /// Called once, before the first `send`.
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` naming the first property the client refuses.
    fn configure(&self, properties: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        let _ = properties;
        Ok(())
    }

    /// Hand one record to the broker.
    ///
    /// # Errors
    /// `DeliveryError::Transient` to have the publisher retry with backoff,
    /// `DeliveryError::Fatal` to fail the record immediately.
    fn send(&self, record: &OutboundRecord) -> Result<(), DeliveryError>;

    /// Create a topic. Clients without admin support keep the default.
    ///
    /// # Errors
    /// `HookError::UnsupportedOperation` unless overridden.
    fn create_topic(&self, topic: &str, options: &TopicOptions) -> HookResult<()> {
        let _ = (topic, options);
        Err(HookError::unsupported("create_topic"))
    }
}

impl<T: BrokerClient> BrokerClient for Arc<T> {
    fn configure(&self, properties: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        (**self).configure(properties)
    }

    fn send(&self, record: &OutboundRecord) -> Result<(), DeliveryError> {
        (**self).send(record)
    }

    fn create_topic(&self, topic: &str, options: &TopicOptions) -> HookResult<()> {
        (**self).create_topic(topic, options)
    }
}

/// In-process broker that records everything it receives.
///
/// Failures can be scripted with [`fail_next`](Self::fail_next) or
/// [`set_offline`](Self::set_offline).
#[derive(Debug, Default)]
pub struct MemoryBroker {
    properties: Mutex<BTreeMap<String, String>>,
    refused: Mutex<Vec<String>>,
    delivered: Mutex<Vec<OutboundRecord>>,
    topics: Mutex<BTreeMap<String, TopicOptions>>,
    scripted: Mutex<VecDeque<DeliveryError>>,
    offline: AtomicBool,
    send_calls: AtomicU64,
}

impl MemoryBroker {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse `key` in any later `configure` call.
    pub fn refuse_property(&self, key: impl Into<String>) {
        self.refused.lock().unwrap_or_else(PoisonError::into_inner).push(key.into());
    }

    /// Properties received through `configure`.
    #[must_use]
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make the next `send` call fail with `err`. Calls queue up in order.
    pub fn fail_next(&self, err: DeliveryError) {
        self.scripted.lock().unwrap_or_else(PoisonError::into_inner).push_back(err);
    }

    /// While offline every `send` fails transiently.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Records accepted so far, in arrival order.
    #[must_use]
    pub fn delivered(&self) -> Vec<OutboundRecord> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Records accepted on `topic`.
    #[must_use]
    pub fn delivered_to(&self, topic: &str) -> Vec<OutboundRecord> {
        self.delivered()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect()
    }

    /// Names of created topics.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Total `send` invocations, including failed ones.
    #[must_use]
    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }
}

impl BrokerClient for MemoryBroker {
    fn configure(&self, properties: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        let refused = self.refused.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = refused.iter().find(|k| properties.contains_key(k.as_str())) {
            return Err(ConfigError::InvalidValue {
                field: key.clone(),
                reason: "rejected by broker client".to_string(),
            });
        }
        *self.properties.lock().unwrap_or_else(PoisonError::into_inner) = properties.clone();
        Ok(())
    }

    fn send(&self, record: &OutboundRecord) -> Result<(), DeliveryError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.scripted.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            return Err(err);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeliveryError::transient("broker offline"));
        }

        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn create_topic(&self, topic: &str, options: &TopicOptions) -> HookResult<()> {
        if topic.trim().is_empty() {
            return Err(HookError::internal("topic name must not be empty"));
        }
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(topic) {
            return Err(HookError::internal(format!("topic '{topic}' already exists")));
        }
        topics.insert(topic.to_string(), options.clone());
        Ok(())
    }
}

/// Client that writes each record to the `tracing` log instead of a broker.
///
/// Useful for dry runs; it has no admin surface, so `create_topic` is unsupported.
#[derive(Debug, Clone)]
pub struct LogBroker {
    client_id: String,
}

impl LogBroker {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

impl BrokerClient for LogBroker {
    fn configure(&self, properties: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        let servers = properties.get("bootstrap.servers").map_or("", String::as_str);
        let client_id = properties
            .get("client.id")
            .map_or(self.client_id.as_str(), String::as_str);
        tracing::info!(
            %servers,
            %client_id,
            acks = properties.get("acks").map_or("", String::as_str),
            "log broker configured"
        );
        Ok(())
    }

    fn send(&self, record: &OutboundRecord) -> Result<(), DeliveryError> {
        let preview: String = String::from_utf8_lossy(&record.payload).chars().take(96).collect();
        tracing::info!(
            client_id = %self.client_id,
            topic = %record.topic,
            bytes = record.payload.len(),
            %preview,
            "record delivered"
        );
        Ok(())
    }
}
