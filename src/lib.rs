//! # hookbus - typed event hooks for live match tracking
//!
//! hookbus decouples the parts of a tracking pipeline that produce match
//! events (camera capture, ball detection, trajectory prediction) from the
//! parts that consume them. Producers `emit` typed events onto a bounded
//! queue; a dispatch thread fans them out to subscribers; a built-in
//! serializer turns them into JSON messages for a message broker.
//!
//! ## Core Concepts
//!
//! - **`EventKind` / `Payload`**: the seven event kinds and the data each must carry
//! - **`EventBus`**: subscription registry plus bounded, ordered, asynchronous dispatch
//! - **`EventSerializer`**: subscriber that stamps `game_id`/`frame_id` and encodes messages
//! - **`Publisher`**: non-blocking hand-off to a broker with backpressure and retry
//! - **`HookBridge`**: the three wired together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hookbus::{EventKind, HookBridge, HookBridgeConfig, LogBroker, Payload, Point2};
//!
//! let bridge = HookBridge::new(HookBridgeConfig::default(), LogBroker::new("tracker"))?;
//! bridge.emit(EventKind::MatchStart, Payload::None)?;
//! bridge.emit(
//!     EventKind::BallPosition,
//!     Payload::ball_pair(Point2::new(412.0, 230.5), Point2::new(398.0, 228.0)),
//! )?;
//! bridge.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;
pub mod wire;

// Dispatch
pub mod bus;
pub mod registry;

// Publish side
pub mod bridge;
pub mod publisher;
pub mod serializer;

pub use bridge::{BridgeStats, HookBridge, HookBridgeConfig};
pub use bus::{BusStats, DispatchMode, EventBus, EventBusConfig};
pub use error::{ConfigError, HookError, HookResult, PublishRejected, SerializationError};
pub use event::{Envelope, EventKind, Frame, Payload, PayloadTag, PixelFormat, Point2, Point3};
pub use publisher::{
    BrokerClient, BrokerConfig, BufferedPublisher, DeliveryError, LogBroker, MemoryBroker, Publisher,
    PublisherStats, TopicOptions,
};
pub use registry::{HandlerError, HandlerResult, SubscriberHandle, SubscriptionId};
pub use serializer::{EventSerializer, ImageCodec, SerializerConfig, SerializerStats, SessionCounters, SessionSnapshot};
pub use wire::{WireEvent, WireMessage};
