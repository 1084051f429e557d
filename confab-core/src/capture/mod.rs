//! Utterance recording: accumulation, gating and WAV framing.
//!
//! The pipeline pushes resampled 16 kHz mono samples into the single-flight
//! [`Recorder`] while the user speaks. When the silence timeout (or the
//! 30 s hard cap) fires, `finalize` runs two gates before anything touches
//! the network:
//!
//! 1. **Size gate** — encoded recordings under ~1 kB are noise; discard
//!    and start a fresh cycle.
//! 2. **Speech gate** — a two-path check over the moving-average envelope:
//!    sustained moderate speech (overall RMS + enough hot 100 ms windows)
//!    OR a short sharp utterance (peak + a run of consecutive hot
//!    windows). Either path accepts. If the analysis cannot run, the
//!    recording is accepted (fail-open) rather than silently dropped.
//!
//! Accepted recordings are WAV-framed with `hound` and shipped base64
//! data-URI encoded.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info, warn};

use crate::error::{ConfabError, Result};
use crate::vad::gate::{Clock, MonotonicClock};

/// Tunables for the recording gates.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Recording sample rate (Hz) after capture-side resampling.
    pub sample_rate: u32,
    /// Hard cap on a single recording. Default: 30 s.
    pub max_duration: Duration,
    /// Encoded recordings below this many bytes are discarded as noise.
    pub min_wav_bytes: usize,
    /// Overall envelope RMS floor for the sustained-speech path.
    pub rms_floor: f32,
    /// Per-window envelope RMS above which a window counts as "hot".
    pub window_rms_threshold: f32,
    /// Hot windows required by the sustained-speech path.
    pub min_hot_windows: usize,
    /// Envelope peak floor for the short-utterance path.
    pub peak_floor: f32,
    /// Consecutive hot windows required by the short-utterance path.
    pub min_consecutive_hot_windows: usize,
    /// Analysis window length in milliseconds.
    pub validity_window_ms: u64,
    /// Moving-average span for envelope smoothing, in samples.
    pub smoothing_span: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_duration: Duration::from_secs(30),
            min_wav_bytes: 1_000,
            rms_floor: 0.01,
            window_rms_threshold: 0.02,
            min_hot_windows: 3,
            peak_floor: 0.10,
            min_consecutive_hot_windows: 2,
            validity_window_ms: 100,
            smoothing_span: 5,
        }
    }
}

/// A finalized, gate-approved recording ready to send.
#[derive(Debug, Clone)]
pub struct CommittedRecording {
    /// Complete WAV file bytes (44-byte header + 16-bit LE PCM).
    pub wav: Vec<u8>,
    /// Container mime type of `wav`.
    pub mime_type: &'static str,
    /// Recording length in seconds.
    pub duration_secs: f64,
    pub sample_rate: u32,
}

impl CommittedRecording {
    /// Data-URI base64 payload, as the send-turn endpoint expects it.
    pub fn as_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.wav))
    }
}

/// Why a finalized recording was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No samples were buffered at all.
    Empty,
    /// Encoded size under the noise floor.
    TooSmall,
    /// The speech gate judged the audio to be non-speech.
    NotSpeech,
}

/// Result of `Recorder::finalize`.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// Not recording — stop when idle is a no-op.
    Idle,
    /// Recording discarded; a new cycle should start.
    Discarded(DiscardReason),
    /// Recording accepted for sending.
    Committed(CommittedRecording),
}

/// Single-flight utterance recorder.
pub struct Recorder {
    config: RecorderConfig,
    clock: Box<dyn Clock>,
    session: Option<RecordingSession>,
}

/// One in-progress recording. Owned exclusively by the recorder; cleared on
/// every completed or discarded cycle.
struct RecordingSession {
    samples: Vec<f32>,
    started_at: Instant,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self::with_clock(config, Box::new(MonotonicClock))
    }

    pub fn with_clock(config: RecorderConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            session: None,
        }
    }

    /// Begin a new recording. Returns false (and changes nothing) if one is
    /// already in flight.
    pub fn start(&mut self) -> bool {
        if self.session.is_some() {
            return false;
        }
        self.session = Some(RecordingSession {
            samples: Vec::with_capacity(self.config.sample_rate as usize),
            started_at: self.clock.now(),
        });
        debug!("recording started");
        true
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Append captured samples to the in-flight recording, if any.
    pub fn push(&mut self, samples: &[f32]) {
        if let Some(session) = self.session.as_mut() {
            session.samples.extend_from_slice(samples);
        }
    }

    /// Time since the current recording began, or zero when idle.
    pub fn elapsed(&self) -> Duration {
        self.session
            .as_ref()
            .map(|s| self.clock.now().duration_since(s.started_at))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the hard duration cap has been reached.
    pub fn max_duration_reached(&self) -> bool {
        self.elapsed() >= self.config.max_duration
    }

    /// Stop and gate the current recording.
    ///
    /// Idempotent-safe: finalizing while idle returns `Idle`.
    pub fn finalize(&mut self) -> FinalizeOutcome {
        let Some(session) = self.session.take() else {
            return FinalizeOutcome::Idle;
        };

        if session.samples.is_empty() {
            debug!("recording had no samples, discarding");
            return FinalizeOutcome::Discarded(DiscardReason::Empty);
        }

        let wav = match encode_wav(&session.samples, self.config.sample_rate) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "WAV framing failed, discarding recording");
                return FinalizeOutcome::Discarded(DiscardReason::Empty);
            }
        };

        if wav.len() < self.config.min_wav_bytes {
            info!(
                bytes = wav.len(),
                floor = self.config.min_wav_bytes,
                "recording below size floor, treating as noise"
            );
            return FinalizeOutcome::Discarded(DiscardReason::TooSmall);
        }

        if !looks_like_speech(&session.samples, &self.config) {
            info!(
                samples = session.samples.len(),
                "recording failed the speech gate, discarding"
            );
            return FinalizeOutcome::Discarded(DiscardReason::NotSpeech);
        }

        let duration_secs = session.samples.len() as f64 / self.config.sample_rate as f64;
        FinalizeOutcome::Committed(CommittedRecording {
            wav,
            mime_type: "audio/wav",
            duration_secs,
            sample_rate: self.config.sample_rate,
        })
    }

    /// Drop the in-flight recording without gating (call teardown).
    pub fn discard(&mut self) {
        self.session = None;
    }
}

/// Frame mono f32 samples as a 16-bit PCM WAV file in memory.
fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes: Vec<u8> = Vec::with_capacity(44 + samples.len() * 2);
    {
        let cursor = std::io::Cursor::new(&mut bytes);
        let mut writer = hound::WavWriter::new(cursor, spec)
            .map_err(|e| ConfabError::Protocol(format!("wav writer: {e}")))?;
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer
                .write_sample(value)
                .map_err(|e| ConfabError::Protocol(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| ConfabError::Protocol(format!("wav finalize: {e}")))?;
    }
    Ok(bytes)
}

/// Two-path speech validity check over the moving-average envelope.
fn looks_like_speech(samples: &[f32], config: &RecorderConfig) -> bool {
    let window_len = (config.sample_rate as u64 * config.validity_window_ms / 1_000) as usize;
    if window_len == 0 || config.smoothing_span == 0 {
        // Misconfigured analysis — fail open rather than eat legit audio.
        return true;
    }

    let envelope = moving_average_envelope(samples, config.smoothing_span);
    if envelope.is_empty() {
        return true;
    }

    let overall_rms = rms(&envelope);
    let peak = envelope.iter().cloned().fold(0f32, f32::max);

    let window_count = envelope.len().div_ceil(window_len);
    let mut hot_windows = 0usize;
    let mut max_run = 0usize;
    let mut run = 0usize;
    for window in envelope.chunks(window_len) {
        if rms(window) > config.window_rms_threshold {
            hot_windows += 1;
            run += 1;
            max_run = max_run.max(run);
        } else {
            run = 0;
        }
    }

    // Short recordings cannot produce the full window quota; scale the
    // requirements down so a single loud window still passes.
    let needed_hot = config.min_hot_windows.min(window_count).max(1);
    let needed_run = config.min_consecutive_hot_windows.min(window_count).max(1);

    let sustained = overall_rms > config.rms_floor && hot_windows >= needed_hot;
    let sharp = peak > config.peak_floor && max_run >= needed_run;

    debug!(
        overall_rms,
        peak, hot_windows, max_run, sustained, sharp, "speech gate analysis"
    );
    sustained || sharp
}

/// Moving average of absolute sample values: a cheap envelope that
/// suppresses single-sample spikes.
fn moving_average_envelope(samples: &[f32], span: usize) -> Vec<f32> {
    if samples.len() < span {
        return samples.iter().map(|s| s.abs()).collect();
    }
    let mut out = Vec::with_capacity(samples.len() - span + 1);
    let mut sum: f32 = samples[..span].iter().map(|s| s.abs()).sum();
    out.push(sum / span as f32);
    for i in span..samples.len() {
        sum += samples[i].abs() - samples[i - span].abs();
        out.push(sum / span as f32);
    }
    out
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
