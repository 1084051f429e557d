//! Wire protocol consumed from the server's streaming responses.
//!
//! Each record is one JSON object `{ "type": ..., "content": ... }`.
//! Records arrive SSE-framed (see [`sse`]); this module owns the typed
//! event representation and the audio payload decoding rules.

pub mod sse;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;

use crate::error::{ConfabError, Result};

/// One decoded server event.
///
/// `Audio` content stays base64 here; it is decoded to bytes at the
/// playback boundary so the dialog manager can drop stale events cheaply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Incremental assistant text.
    Text(String),
    /// Base64 audio payload (optionally data-URI prefixed).
    Audio(String),
    /// Spoken-response transcript text.
    Transcript(String),
    /// Token accounting blob — logged, never rendered.
    Usage(String),
    /// Server-reported failure; terminates the turn.
    Error(String),
    /// Server acknowledged a client interrupt; terminates the turn quietly.
    Interrupted,
}

/// Raw wire shape. Kept separate from [`Event`] so unknown types and a
/// missing `content` field fail loudly in exactly one place.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
}

impl Event {
    /// Parse one JSON record body.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawEvent = serde_json::from_str(json)
            .map_err(|e| ConfabError::Protocol(format!("bad event record: {e}")))?;

        let content = raw.content.unwrap_or_default();
        match raw.kind.as_str() {
            "text" => Ok(Event::Text(content)),
            "audio" => Ok(Event::Audio(content)),
            "transcript" => Ok(Event::Transcript(content)),
            "usage" => Ok(Event::Usage(content)),
            "error" => Ok(Event::Error(content)),
            "interrupted" => Ok(Event::Interrupted),
            other => Err(ConfabError::Protocol(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

/// Decode an `audio` event payload to raw bytes.
///
/// Payloads may arrive bare base64 or already data-URI wrapped
/// (`data:audio/wav;base64,...`); the prefix is stripped before decoding.
pub fn decode_audio_content(content: &str) -> Result<Vec<u8>> {
    let b64 = match content.strip_prefix("data:") {
        Some(rest) => match rest.find("base64,") {
            Some(idx) => &rest[idx + "base64,".len()..],
            None => {
                return Err(ConfabError::Protocol(
                    "audio data URI without base64 marker".into(),
                ))
            }
        },
        None => content,
    };

    BASE64
        .decode(b64.trim())
        .map_err(|e| ConfabError::Protocol(format!("bad audio base64: {e}")))
}
