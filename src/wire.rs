//! Wire format for published events.
//!
//! Every message is one UTF-8 JSON object. Fields are emitted in a fixed order
//! (`event`, `game_id`, `frame_id`, then the kind-specific fields) and absent
//! fields are omitted rather than sent as `null`.

use serde::{Deserialize, Serialize};

use crate::error::SerializationError;

/// Value of the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireEvent {
    #[allow(missing_docs)]
    MatchStart,
    #[allow(missing_docs)]
    MatchEnd,
    /// Left camera image.
    CameraStreamLeft,
    /// Right camera image.
    CameraStreamRight,
    #[allow(missing_docs)]
    BallPosition,
    /// Predicted trajectory.
    PredTrackBallPosition,
    /// Observed trajectory.
    RealTrackBallPosition,
    /// Hit point.
    ShuttlecockPosition,
}

impl WireEvent {
    /// True for messages routed to the image topic.
    #[must_use]
    pub const fn is_image(self) -> bool {
        matches!(self, Self::CameraStreamLeft | Self::CameraStreamRight)
    }
}

/// One outgoing message.
///
/// Coordinates are `f32` and always serialize as JSON floats (`[1.0,2.0]`,
/// never `[1,2]`); consumers should compare them numerically.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: WireEvent,
    pub game_id: u32,
    pub frame_id: u32,
    /// Base64 of the compressed image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<[f32; 3]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f32; 3]>,
}

impl WireMessage {
    /// Message with only the common fields set.
    #[must_use]
    pub const fn bare(event: WireEvent, game_id: u32, frame_id: u32) -> Self {
        Self {
            event,
            game_id,
            frame_id,
            data: None,
            left: None,
            right: None,
            positions: None,
            position: None,
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    /// `SerializationError::Json` if a coordinate is not representable (NaN or
    /// infinity serialize as `null`, which is rejected here).
    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        let has_non_finite = self.left.iter().chain(self.right.iter()).flatten().any(|v| !v.is_finite())
            || self.position.iter().flatten().any(|v| !v.is_finite())
            || self.positions.iter().flatten().flatten().any(|v| !v.is_finite());
        if has_non_finite {
            return Err(SerializationError::Json {
                message: format!("{:?} carries a non-finite coordinate", self.event),
            });
        }

        serde_json::to_vec(self).map_err(|e| SerializationError::Json {
            message: e.to_string(),
        })
    }

    /// Parse a message produced by [`encode`](Self::encode).
    ///
    /// # Errors
    /// `SerializationError::Json` on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Json {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_start_has_exact_fields() {
        let bytes = WireMessage::bare(WireEvent::MatchStart, 3, 0).encode().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"event":"match_start","game_id":3,"frame_id":0}"#
        );
    }

    #[test]
    fn ball_position_field_order() {
        let msg = WireMessage {
            left: Some([1.0, 2.0]),
            right: Some([3.0, 4.5]),
            ..WireMessage::bare(WireEvent::BallPosition, 1, 2)
        };
        let text = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert_eq!(
            text,
            r#"{"event":"ball_position","game_id":1,"frame_id":2,"left":[1.0,2.0],"right":[3.0,4.5]}"#
        );
        assert_eq!(WireMessage::decode(text.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        let msg = WireMessage {
            position: Some([f32::NAN, 0.0, 0.0]),
            ..WireMessage::bare(WireEvent::ShuttlecockPosition, 1, 1)
        };
        assert!(matches!(msg.encode(), Err(SerializationError::Json { .. })));
    }

    #[test]
    fn image_events_are_flagged() {
        assert!(WireEvent::CameraStreamLeft.is_image());
        assert!(WireEvent::CameraStreamRight.is_image());
        assert!(!WireEvent::BallPosition.is_image());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(WireMessage::decode(b"{not json").is_err());
        assert!(WireMessage::decode(br#"{"event":"nope","game_id":1,"frame_id":1}"#).is_err());
    }
}
