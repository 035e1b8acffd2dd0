//! Event model: kinds, payloads and envelopes.
//!
//! An [`Envelope`] is one occurrence of a typed event. It is created by
//! [`EventBus::emit`](crate::bus::EventBus::emit), consumed once by dispatch and
//! then dropped.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of things that can happen during a tracked match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new match (game) begins.
    MatchStart,
    /// The current match ends.
    MatchEnd,
    /// A synchronized pair of camera frames.
    CameraStream,
    /// Ball detected in both camera views.
    BallPosition,
    /// Predicted 3D ball trajectory.
    PredictedTrajectory,
    /// Observed 3D ball trajectory.
    ActualTrajectory,
    /// 3D point where the ball was hit.
    HitPoint,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::MatchStart,
        Self::MatchEnd,
        Self::CameraStream,
        Self::BallPosition,
        Self::PredictedTrajectory,
        Self::ActualTrajectory,
        Self::HitPoint,
    ];

    /// The payload shape this kind must be emitted with.
    #[must_use]
    pub const fn payload_tag(self) -> PayloadTag {
        match self {
            Self::MatchStart | Self::MatchEnd => PayloadTag::None,
            Self::CameraStream => PayloadTag::Stereo,
            Self::BallPosition => PayloadTag::BallPair,
            Self::PredictedTrajectory | Self::ActualTrajectory => PayloadTag::Points,
            Self::HitPoint => PayloadTag::Point,
        }
    }
}

/// Discriminant of [`Payload`], used for validation and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadTag {
    /// No data.
    None,
    /// Left and right frames.
    Stereo,
    /// Left and right 2D positions.
    BallPair,
    /// Ordered 3D points.
    Points,
    /// A single 3D point.
    Point,
}

/// 2D image-space position.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    /// Create a point.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// `[x, y]`
    #[must_use]
    pub const fn to_array(self) -> [f32; 2] {
        [self.x, self.y]
    }
}

/// 3D world-space position.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    /// Create a point.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// `[x, y, z]`
    #[must_use]
    pub const fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Pixel layout of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// One byte per pixel.
    Gray8,
    /// Three bytes per pixel, red first.
    Rgb8,
    /// Four bytes per pixel, red first, alpha last.
    Rgba8,
}

impl PixelFormat {
    /// Bytes per pixel.
    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::Gray8 => 1,
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
        }
    }
}

/// Raw raster image handed over by the capture pipeline.
///
/// Pixel bytes are reference counted, so cloning a frame (for example when a
/// payload is moved through the queue) never copies the image.
#[derive(Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Arc<[u8]>,
}

impl Frame {
    /// Wrap raw pixel bytes.
    ///
    /// No size check happens here; a frame whose buffer disagrees with its
    /// dimensions is reported when it is encoded.
    #[must_use]
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            width,
            height,
            format,
            data: data.into(),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw pixel bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Byte length implied by the dimensions and pixel format, or `None` if
    /// it does not fit in `usize`.
    #[must_use]
    pub fn expected_len(&self) -> Option<usize> {
        usize::try_from(self.width)
            .ok()?
            .checked_mul(usize::try_from(self.height).ok()?)?
            .checked_mul(self.format.channels())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Data carried by one event. The variant must match the emitted [`EventKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// MatchStart / MatchEnd.
    None,
    /// CameraStream.
    Stereo {
        /// Left camera frame.
        left: Frame,
        /// Right camera frame.
        right: Frame,
    },
    /// BallPosition.
    BallPair {
        /// Position in the left view.
        left: Point2,
        /// Position in the right view.
        right: Point2,
    },
    /// PredictedTrajectory / ActualTrajectory.
    Points(Vec<Point3>),
    /// HitPoint.
    Point(Point3),
}

impl Payload {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn tag(&self) -> PayloadTag {
        match self {
            Self::None => PayloadTag::None,
            Self::Stereo { .. } => PayloadTag::Stereo,
            Self::BallPair { .. } => PayloadTag::BallPair,
            Self::Points(_) => PayloadTag::Points,
            Self::Point(_) => PayloadTag::Point,
        }
    }

    /// Whether this payload may be emitted as `kind`.
    #[must_use]
    pub fn matches(&self, kind: EventKind) -> bool {
        self.tag() == kind.payload_tag()
    }

    /// Stereo payload from two frames.
    #[must_use]
    pub fn stereo(left: Frame, right: Frame) -> Self {
        Self::Stereo { left, right }
    }

    /// Ball pair payload from two 2D positions.
    #[must_use]
    pub const fn ball_pair(left: Point2, right: Point2) -> Self {
        Self::BallPair { left, right }
    }
}

/// One event occurrence as it travels through the bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Monotonic per-bus emission number, starting at 1.
    pub sequence: u64,
    /// What happened.
    pub kind: EventKind,
    /// Data for `kind`.
    pub payload: Payload,
    /// Wall clock time of the `emit` call.
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_matching_payload_shape() {
        let frame = Frame::new(1, 1, PixelFormat::Gray8, vec![0u8]);
        let samples = [
            Payload::None,
            Payload::stereo(frame.clone(), frame),
            Payload::ball_pair(Point2::new(1.0, 2.0), Point2::new(3.0, 4.0)),
            Payload::Points(vec![Point3::new(1.0, 2.0, 3.0)]),
            Payload::Point(Point3::new(7.0, 8.0, 9.0)),
        ];

        for kind in EventKind::ALL {
            let matching: Vec<_> = samples.iter().filter(|p| p.matches(kind)).collect();
            assert_eq!(matching.len(), 1, "{kind:?} should accept exactly one payload shape");
        }
    }

    #[test]
    fn mismatched_payload_is_detected() {
        assert!(!Payload::None.matches(EventKind::CameraStream));
        assert!(!Payload::Point(Point3::default()).matches(EventKind::PredictedTrajectory));
        assert!(Payload::Points(Vec::new()).matches(EventKind::ActualTrajectory));
    }

    #[test]
    fn frame_expected_len_uses_channels() {
        let frame = Frame::new(4, 3, PixelFormat::Rgba8, vec![0u8; 48]);
        assert_eq!(frame.expected_len(), Some(48));
        assert_eq!(frame.data().len(), 48);
        assert!(format!("{frame:?}").contains("bytes: 48"));
    }

    #[test]
    fn huge_dimensions_do_not_overflow() {
        let frame = Frame::new(u32::MAX, u32::MAX, PixelFormat::Rgba8, vec![0u8; 4]);
        if usize::BITS <= 64 {
            assert_eq!(frame.expected_len(), None);
        }
    }

    #[test]
    fn frame_clone_shares_pixels() {
        let frame = Frame::new(2, 2, PixelFormat::Gray8, vec![1u8, 2, 3, 4]);
        let copy = frame.clone();
        assert!(std::ptr::eq(frame.data().as_ptr(), copy.data().as_ptr()));
    }
}
