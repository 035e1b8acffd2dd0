//! The assembled pipeline: event bus, serializer and buffered publisher.
//!
//! ```text
//! emit ──▶ EventBus ──dispatch──▶ EventSerializer ──▶ BufferedPublisher ──▶ BrokerClient
//!                   └──────────▶ other subscribers
//! ```
//!
//! There is no process-wide instance. Construct one [`HookBridge`] at startup
//! and pass it (or its [`bus`](HookBridge::bus)) to whatever produces events.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::{BusStats, EventBus, EventBusConfig};
use crate::error::{ConfigError, HookResult};
use crate::event::{EventKind, Payload};
use crate::publisher::{BrokerClient, BrokerConfig, BufferedPublisher, PublisherStats};
use crate::registry::SubscriberHandle;
use crate::serializer::{EventSerializer, SerializerConfig, SerializerStats};

/// Complete bridge configuration, loadable from JSON.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookBridgeConfig {
    pub broker: BrokerConfig,
    pub serializer: SerializerConfig,
    pub bus: EventBusConfig,
}

impl HookBridgeConfig {
    /// Parse a JSON document. Missing sections and fields take their defaults.
    ///
    /// # Errors
    /// `ConfigError::Load` if the document is not valid JSON for this shape.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })
    }

    /// Read and parse a JSON file.
    ///
    /// # Errors
    /// `ConfigError::Load` if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&raw)
    }

    /// Validate every section.
    ///
    /// # Errors
    /// The first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;

        for (field, topic) in [
            ("serializer.events_topic", &self.serializer.events_topic),
            ("serializer.images_topic", &self.serializer.images_topic),
        ] {
            if topic.trim().is_empty() {
                return Err(ConfigError::EmptyField {
                    field: field.to_string(),
                });
            }
        }
        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bus.queue_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Aggregated counters across the pipeline.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    pub bus: BusStats,
    pub serializer: SerializerStats,
    pub publisher: PublisherStats,
}

/// Running pipeline from `emit` to the broker client.
pub struct HookBridge<C: BrokerClient> {
    bus: EventBus,
    serializer: Arc<EventSerializer>,
    publisher: Arc<BufferedPublisher<C>>,
    subscription: SubscriberHandle,
}

impl<C: BrokerClient> HookBridge<C> {
    /// Validate `cfg`, connect the publisher to `client`, attach the serializer
    /// and start dispatching.
    ///
    /// # Errors
    /// `Configuration` for invalid settings; nothing is started in that case.
    /// `Internal` if a worker thread cannot be spawned.
    pub fn new(cfg: HookBridgeConfig, client: C) -> HookResult<Self> {
        cfg.validate()?;

        let publisher = Arc::new(BufferedPublisher::new(cfg.broker, client)?);
        let serializer = Arc::new(EventSerializer::new(cfg.serializer, publisher.clone()));
        let bus = EventBus::new(cfg.bus);
        let subscription = serializer.attach(&bus);
        bus.start()?;

        tracing::info!(
            events_topic = %serializer.config().events_topic,
            images_topic = %serializer.config().images_topic,
            "hook bridge started"
        );

        Ok(Self {
            bus,
            serializer,
            publisher,
            subscription,
        })
    }

    /// Emit one event into the pipeline.
    ///
    /// # Errors
    /// See [`EventBus::emit`].
    pub fn emit(&self, kind: EventKind, payload: Payload) -> HookResult<u64> {
        self.bus.emit(kind, payload)
    }

    /// The bus, for registering additional subscribers.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn serializer(&self) -> &Arc<EventSerializer> {
        &self.serializer
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn publisher(&self) -> &Arc<BufferedPublisher<C>> {
        &self.publisher
    }

    /// Handle under which the serializer is subscribed.
    #[must_use]
    pub const fn serializer_subscription(&self) -> &SubscriberHandle {
        &self.subscription
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            bus: self.bus.stats(),
            serializer: self.serializer.stats(),
            publisher: self.publisher.stats(),
        }
    }

    /// Stop dispatching, then flush and close the publisher. Idempotent.
    ///
    /// Events still queued on the bus are discarded; messages already handed
    /// to the publisher get a bounded flush.
    pub fn shutdown(&self) {
        self.bus.stop();
        self.publisher.close();
        let stats = self.stats();
        tracing::info!(
            published = stats.serializer.published,
            delivered = stats.publisher.delivered,
            failed = stats.publisher.failed,
            "hook bridge stopped"
        );
    }
}

impl<C: BrokerClient> Drop for HookBridge<C> {
    fn drop(&mut self) {
        if !self.publisher.is_closed() {
            self.shutdown();
        }
    }
}

impl<C: BrokerClient> std::fmt::Debug for HookBridge<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBridge")
            .field("bus", &self.bus)
            .field("serializer", &self.serializer)
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}
