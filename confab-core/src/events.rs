//! Event types emitted to the UI collaborator.
//!
//! The engine never touches presentation; it broadcasts these on tokio
//! channels and whatever renders the conversation (chat log, typewriter,
//! status line) subscribes. All types serialize camelCase so a JSON
//! bridge to a web/desktop frontend needs no mapping layer.
//!
//! | Event | Channel |
//! |-------|---------|
//! | `CallEvent` | `CallEngine::subscribe_events` |
//! | `CallStatusEvent` | `CallEngine::subscribe_status` |
//! | `AudioActivityEvent` | `CallEngine::subscribe_activity` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Conversation events
// ---------------------------------------------------------------------------

/// Emitted for every observable change to the active conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Turn this event belongs to.
    pub turn_id: String,
    pub payload: CallPayload,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CallPayload {
    /// The user's utterance was sent; the AI response stream is opening.
    TurnStarted,
    /// Incremental assistant text to append.
    Text { content: String },
    /// Incremental spoken-response transcript to append (quote policy
    /// already applied).
    Transcript { content: String },
    /// The turn finished normally. `text` is the full accumulated text.
    TurnCompleted { text: String },
    /// The turn was interrupted (barge-in or explicit cancel).
    TurnInterrupted,
    /// The server reported a failure for this turn.
    ServerError { message: String },
}

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// Emitted once per analyzed VAD frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Normalized voice-band level of the frame in [0.0, 1.0].
    pub level: f32,
    /// Debounced speaking flag from the gate.
    pub is_speaking: bool,
}

// ---------------------------------------------------------------------------
// Call status events
// ---------------------------------------------------------------------------

/// Emitted when the call lifecycle state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusEvent {
    pub status: CallStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the call engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Opening devices and the server session.
    Connecting,
    /// Capturing audio and waiting for user speech.
    Listening,
    /// An AI response is streaming/playing.
    Responding,
    /// Call ended; the engine may be restarted.
    Stopped,
    /// Unrecoverable error — restart required.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_event_serializes_with_camel_case_and_tagged_payload() {
        let event = CallEvent {
            seq: 7,
            turn_id: "turn-1".into(),
            payload: CallPayload::Text {
                content: "hello".into(),
            },
        };

        let json = serde_json::to_value(&event).expect("serialize call event");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["turnId"], "turn-1");
        assert_eq!(json["payload"]["kind"], "text");
        assert_eq!(json["payload"]["content"], "hello");

        let round_trip: CallEvent = serde_json::from_value(json).expect("deserialize call event");
        assert_eq!(round_trip.seq, 7);
        assert_eq!(
            round_trip.payload,
            CallPayload::Text {
                content: "hello".into()
            }
        );
    }

    #[test]
    fn lifecycle_payloads_use_camel_case_kinds() {
        let json = serde_json::to_value(CallPayload::TurnCompleted {
            text: "done".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "turnCompleted");

        let json = serde_json::to_value(CallPayload::TurnInterrupted).unwrap();
        assert_eq!(json["kind"], "turnInterrupted");
    }

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = CallStatusEvent {
            status: CallStatus::Responding,
            detail: Some("streaming".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "responding");
        assert_eq!(json["detail"], "streaming");

        let round_trip: CallStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, CallStatus::Responding);
    }

    #[test]
    fn activity_event_serializes_with_camel_case_fields() {
        let event = AudioActivityEvent {
            seq: 3,
            level: 0.18,
            is_speaking: true,
        };

        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 3);
        let level = json["level"].as_f64().expect("level should be a number");
        assert!((level - 0.18).abs() < 1e-5);
        assert_eq!(json["isSpeaking"], true);
    }
}
