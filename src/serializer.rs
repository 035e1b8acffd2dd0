//! Event serializer: the built-in subscriber that turns dispatched events into
//! wire messages and hands them to a [`Publisher`].
//!
//! It owns the session counters. `game_id` advances on every MatchStart;
//! `frame_id` resets to 0 on MatchStart and advances once per CameraStream.
//! Every other kind is stamped with the current values. The counters are only
//! written from the dispatch thread but can be read from anywhere.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::error::{HookError, HookResult, SerializationError};
use crate::event::{Envelope, EventKind, Frame, Payload, PixelFormat};
use crate::publisher::Publisher;
use crate::registry::SubscriberHandle;
use crate::wire::{WireEvent, WireMessage};

/// Compression applied to camera frames before base64 encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ImageCodec {
    /// Lossless PNG.
    #[default]
    Png,
    /// Lossy JPEG at the given quality (1-100).
    Jpeg {
        #[allow(missing_docs)]
        quality: u8,
    },
}

/// Serializer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    /// Topic for scalar events.
    pub events_topic: String,
    /// Topic for camera images, kept apart so large payloads never delay scalar events.
    pub images_topic: String,
    #[allow(missing_docs)]
    pub image_codec: ImageCodec,
    /// Kinds the serializer subscribes to when attached to a bus.
    pub kinds: Vec<EventKind>,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            events_topic: "test".to_string(),
            images_topic: "test_image".to_string(),
            image_codec: ImageCodec::Png,
            kinds: EventKind::ALL.to_vec(),
        }
    }
}

/// `game_id` / `frame_id` as seen at one instant.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub game_id: u32,
    pub frame_id: u32,
}

/// Match and frame counters.
#[derive(Debug, Default)]
pub struct SessionCounters {
    game_id: AtomicU32,
    frame_id: AtomicU32,
}

impl SessionCounters {
    /// Advance to the next game and reset the frame counter. Returns the new game id.
    pub fn start_match(&self) -> u32 {
        let game_id = self.game_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.frame_id.store(0, Ordering::Release);
        game_id
    }

    /// Advance the frame counter. Returns the new frame id.
    pub fn next_frame(&self) -> u32 {
        self.frame_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            game_id: self.game_id.load(Ordering::Acquire),
            frame_id: self.frame_id.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time serializer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerializerStats {
    /// Messages accepted by the publisher.
    pub published: u64,
    /// Messages the publisher refused.
    pub publish_rejected: u64,
    /// Messages skipped because they could not be encoded.
    pub serialization_failures: u64,
}

/// Subscriber that publishes every event it receives.
pub struct EventSerializer {
    cfg: SerializerConfig,
    publisher: Arc<dyn Publisher>,
    counters: SessionCounters,
    published: AtomicU64,
    publish_rejected: AtomicU64,
    serialization_failures: AtomicU64,
}

impl EventSerializer {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(cfg: SerializerConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            cfg,
            publisher,
            counters: SessionCounters::default(),
            published: AtomicU64::new(0),
            publish_rejected: AtomicU64::new(0),
            serialization_failures: AtomicU64::new(0),
        }
    }

    /// Subscribe this serializer to every configured kind on `bus`.
    ///
    /// One handle is shared by all kinds; pass it to
    /// [`EventBus::unsubscribe`] to detach.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriberHandle {
        let serializer = Arc::clone(self);
        let handle = SubscriberHandle::new(move |envelope| serializer.handle(envelope).map_err(Into::into));
        for kind in &self.cfg.kinds {
            bus.subscribe_handle(*kind, &handle);
        }
        handle
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn config(&self) -> &SerializerConfig {
        &self.cfg
    }

    /// Current session counters.
    #[must_use]
    pub fn session(&self) -> SessionSnapshot {
        self.counters.snapshot()
    }

    /// Snapshot of the publish counters.
    #[must_use]
    pub fn stats(&self) -> SerializerStats {
        SerializerStats {
            published: self.published.load(Ordering::Relaxed),
            publish_rejected: self.publish_rejected.load(Ordering::Relaxed),
            serialization_failures: self.serialization_failures.load(Ordering::Relaxed),
        }
    }

    /// Serialize and publish one event.
    ///
    /// Encoding failures and publisher refusals are logged and counted, never
    /// returned; one bad frame does not stop its sibling from being sent.
    ///
    /// # Errors
    /// `InvalidEventType` if the envelope's payload does not fit its kind.
    pub fn handle(&self, envelope: &Envelope) -> HookResult<()> {
        match (envelope.kind, &envelope.payload) {
            (EventKind::MatchStart, Payload::None) => {
                let game_id = self.counters.start_match();
                tracing::debug!(game_id, "match started");
                self.send(&WireMessage::bare(WireEvent::MatchStart, game_id, 0));
            }
            (EventKind::MatchEnd, Payload::None) => {
                let s = self.counters.snapshot();
                tracing::debug!(game_id = s.game_id, frame_id = s.frame_id, "match ended");
                self.send(&WireMessage::bare(WireEvent::MatchEnd, s.game_id, s.frame_id));
            }
            (EventKind::CameraStream, Payload::Stereo { left, right }) => {
                // Captured once so both sides share it.
                let frame_id = self.counters.next_frame();
                let game_id = self.counters.snapshot().game_id;
                self.send_frame(WireEvent::CameraStreamLeft, "left", left, game_id, frame_id);
                self.send_frame(WireEvent::CameraStreamRight, "right", right, game_id, frame_id);
            }
            (EventKind::BallPosition, Payload::BallPair { left, right }) => {
                let s = self.counters.snapshot();
                self.send(&WireMessage {
                    left: Some(left.to_array()),
                    right: Some(right.to_array()),
                    ..WireMessage::bare(WireEvent::BallPosition, s.game_id, s.frame_id)
                });
            }
            (kind @ (EventKind::PredictedTrajectory | EventKind::ActualTrajectory), Payload::Points(points)) => {
                let event = if kind == EventKind::PredictedTrajectory {
                    WireEvent::PredTrackBallPosition
                } else {
                    WireEvent::RealTrackBallPosition
                };
                let s = self.counters.snapshot();
                self.send(&WireMessage {
                    positions: Some(points.iter().map(|p| p.to_array()).collect()),
                    ..WireMessage::bare(event, s.game_id, s.frame_id)
                });
            }
            (EventKind::HitPoint, Payload::Point(point)) => {
                let s = self.counters.snapshot();
                self.send(&WireMessage {
                    position: Some(point.to_array()),
                    ..WireMessage::bare(WireEvent::ShuttlecockPosition, s.game_id, s.frame_id)
                });
            }
            (kind, payload) => {
                return Err(HookError::InvalidEventType {
                    kind,
                    payload: payload.tag(),
                });
            }
        }
        Ok(())
    }

    fn send_frame(&self, event: WireEvent, side: &'static str, frame: &Frame, game_id: u32, frame_id: u32) {
        match encode_frame(frame, side, self.cfg.image_codec) {
            Ok(data) => self.send(&WireMessage {
                data: Some(data),
                ..WireMessage::bare(event, game_id, frame_id)
            }),
            Err(err) => self.skip(event, &err),
        }
    }

    fn send(&self, msg: &WireMessage) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(err) => return self.skip(msg.event, &err),
        };
        let topic = if msg.event.is_image() {
            &self.cfg.images_topic
        } else {
            &self.cfg.events_topic
        };

        match self.publisher.try_publish(topic, &bytes) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => {
                self.publish_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(event = ?msg.event, %topic, %reason, "publish rejected");
            }
        }
    }

    fn skip(&self, event: WireEvent, err: &SerializationError) {
        self.serialization_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(?event, error = %err, "message skipped");
    }
}

impl std::fmt::Debug for EventSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSerializer")
            .field("cfg", &self.cfg)
            .field("session", &self.session())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Compress `frame` with `codec` and return it base64 encoded.
///
/// # Errors
/// `EmptyFrame` for zero-sized frames, `BufferMismatch` when the pixel buffer
/// disagrees with the dimensions, `Encode` when the codec fails.
pub fn encode_frame(frame: &Frame, side: &'static str, codec: ImageCodec) -> Result<String, SerializationError> {
    if frame.width() == 0 || frame.height() == 0 || frame.data().is_empty() {
        return Err(SerializationError::EmptyFrame {
            side,
            width: frame.width(),
            height: frame.height(),
            len: frame.data().len(),
        });
    }
    let Some(expected) = frame.expected_len() else {
        return Err(SerializationError::DimensionOverflow {
            side,
            width: frame.width(),
            height: frame.height(),
        });
    };
    if frame.data().len() != expected {
        return Err(SerializationError::BufferMismatch {
            side,
            expected,
            actual: frame.data().len(),
        });
    }

    let color = match frame.format() {
        PixelFormat::Gray8 => ExtendedColorType::L8,
        PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
        PixelFormat::Rgba8 => ExtendedColorType::Rgba8,
    };

    let mut buf = Vec::new();
    let written = match codec {
        ImageCodec::Png => PngEncoder::new(&mut buf).write_image(frame.data(), frame.width(), frame.height(), color),
        ImageCodec::Jpeg { quality } => JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).write_image(
            frame.data(),
            frame.width(),
            frame.height(),
            color,
        ),
    };
    written.map_err(|e| SerializationError::Encode {
        message: e.to_string(),
    })?;

    Ok(BASE64.encode(&buf))
}
