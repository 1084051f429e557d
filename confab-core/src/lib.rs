//! # confab-core
//!
//! Realtime voice-chat client engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → MicCapture → SPSC ring → CapturePipeline(spawn_blocking)
//!                                            │
//!                                  BandEnergy → SpeechGate
//!                                            │
//!                                   Recorder (size/speech gates)
//!                                            │
//!              TurnRunner ◄── committed WAV+base64 utterance
//!                  │
//!        ResponseStreamController (one streaming POST per turn)
//!                  │
//!            SSE events ──► DialogQueueManager (drop-if-not-active)
//!                  │                │
//!          text/transcript      audio chunks
//!                  │                │
//!        broadcast::Sender   StreamingAudioPlayer → output SPSC ring
//!        (UI collaborator)        → cpal output device
//! ```
//!
//! The speech gate also watches for barge-in while a response is playing;
//! a confirmed interruption cancels the stream, resets the player and
//! drops every late event of the cancelled turn.
//!
//! Both device callbacks are zero-alloc. All heap work happens on the
//! pipeline thread or the async tasks.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod dialog;
pub mod engine;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod stream;
pub mod vad;

// Convenience re-exports for downstream crates
pub use engine::{CallConfig, CallEngine, DiagnosticsSnapshot};
pub use error::ConfabError;
pub use events::{AudioActivityEvent, CallEvent, CallPayload, CallStatus, CallStatusEvent};
pub use stream::{ApiConfig, StreamOutcome};
