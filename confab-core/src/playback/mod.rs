//! Streaming audio playback.
//!
//! ## Scheduling model
//!
//! ```text
//! add_chunk(bytes) ──► strip 44-byte WAV header (first chunk only)
//!                  ──► i16 LE → f32 (sample / 32768.0)
//!                  ──► append to the pending sample buffer
//!                  ──► play_next_window()
//!
//! play_next_window(): while a full half-second window is buffered,
//!     schedule it at max(device_now, playback_cursor) and advance the
//!     cursor by its duration.
//! ```
//!
//! Two triggers request the next window after one is scheduled: the
//! device's "ended" notification and a proactive timer at 80 % of the
//! window duration. Either may fire first and either may fire late; both
//! funnel into the same idempotent `play_next_window`, so a missed or
//! duplicated trigger can neither gap nor double-schedule the stream.
//!
//! A final partial window (< half a second) is only emitted by an explicit
//! [`StreamingAudioPlayer::flush`] at end-of-turn; it is never scheduled
//! early and never stranded.

use tracing::{debug, warn};

use crate::audio::output::AudioOutput;
use crate::error::{ConfabError, Result};

/// Size of the WAV container header carried by the first chunk of a turn.
pub const WAV_HEADER_LEN: usize = 44;

/// Fraction of a window's duration after which the proactive trigger fires.
pub const PROACTIVE_TRIGGER_FRACTION: f64 = 0.8;

/// Timing of one scheduled window, for the driver to arm its triggers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowTiming {
    /// Absolute device-clock time the window starts.
    pub starts_at: f64,
    /// Window duration in seconds.
    pub duration: f64,
}

impl WindowTiming {
    /// Device-clock time of the proactive (80 %) trigger.
    pub fn proactive_at(&self) -> f64 {
        self.starts_at + self.duration * PROACTIVE_TRIGGER_FRACTION
    }

    /// Device-clock time of the ended trigger.
    pub fn ends_at(&self) -> f64 {
        self.starts_at + self.duration
    }
}

/// Gapless scheduler for incrementally-arriving PCM audio.
pub struct StreamingAudioPlayer {
    output: Box<dyn AudioOutput>,
    /// Server contract constant — the AI audio stream is always mono
    /// 16-bit PCM at this rate; it is not negotiated.
    sample_rate: u32,
    /// Samples per scheduling window (half a second).
    window_samples: usize,
    /// Decoded samples not yet handed to the output device. Strict FIFO.
    pending: Vec<f32>,
    /// Absolute device-clock time of the next scheduled sample.
    cursor: f64,
    playing: bool,
    /// True until the turn's first chunk (carrying the WAV header) arrives.
    awaiting_header: bool,
    /// Header extracted from the first chunk. Unused after extraction but
    /// retained so a caller can reconstruct a complete WAV if needed.
    wav_header: Option<[u8; WAV_HEADER_LEN]>,
}

impl StreamingAudioPlayer {
    pub fn new(output: Box<dyn AudioOutput>, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            window_samples: (sample_rate / 2) as usize,
            pending: Vec::new(),
            cursor: 0.0,
            playing: false,
            awaiting_header: false,
            wav_header: None,
        }
    }

    /// Arm the player for a new turn: the next chunk is expected to carry
    /// the WAV container header.
    pub fn begin_turn(&mut self) {
        self.awaiting_header = true;
        self.wav_header = None;
    }

    /// Append one incoming audio chunk and schedule whatever is ready.
    ///
    /// Returns the most recently scheduled window so the driver can arm
    /// its ended/proactive triggers, or `None` if nothing was scheduled.
    ///
    /// # Errors
    /// `ConfabError::Protocol` for undecodable chunks. The player's state
    /// is untouched by a bad chunk; the caller logs it and the turn
    /// continues with subsequent chunks.
    pub fn add_chunk(&mut self, bytes: &[u8]) -> Result<Option<WindowTiming>> {
        let pcm = if self.awaiting_header {
            if bytes.len() < WAV_HEADER_LEN {
                return Err(ConfabError::Protocol(format!(
                    "first audio chunk shorter than WAV header: {} bytes",
                    bytes.len()
                )));
            }
            let mut header = [0u8; WAV_HEADER_LEN];
            header.copy_from_slice(&bytes[..WAV_HEADER_LEN]);
            self.wav_header = Some(header);
            // Consumed exactly once; the remainder — and every later
            // chunk — is headerless PCM.
            self.awaiting_header = false;
            &bytes[WAV_HEADER_LEN..]
        } else {
            bytes
        };

        if pcm.is_empty() {
            debug!("audio chunk carried no samples");
            return Ok(None);
        }
        if pcm.len() % 2 != 0 {
            warn!(len = pcm.len(), "odd-length PCM payload, dropping trailing byte");
        }

        self.pending.reserve(pcm.len() / 2);
        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            self.pending.push(sample as f32 / 32768.0);
        }

        Ok(self.begin_playback())
    }

    /// Start playback if idle. Idempotent — a no-op while already playing.
    fn begin_playback(&mut self) -> Option<WindowTiming> {
        self.playing = true;
        self.play_next_window()
    }

    /// Device "ended" notification for the current window.
    pub fn handle_buffer_ended(&mut self) -> Option<WindowTiming> {
        self.play_next_window()
    }

    /// Proactive trigger, armed at 80 % of the current window's duration.
    pub fn handle_proactive_tick(&mut self) -> Option<WindowTiming> {
        self.play_next_window()
    }

    /// Schedule full windows off the front of the pending buffer.
    ///
    /// No-op when not playing or when less than one full window is
    /// buffered — partial windows wait for [`Self::flush`].
    fn play_next_window(&mut self) -> Option<WindowTiming> {
        if !self.playing {
            return None;
        }
        let mut last = None;
        while self.pending.len() >= self.window_samples {
            last = Some(self.schedule_front(self.window_samples));
        }
        last
    }

    /// Schedule whatever remains, including a final short window.
    ///
    /// Called on the explicit end-of-turn signal so no residual samples
    /// are stranded below the window size.
    pub fn flush(&mut self) -> Option<WindowTiming> {
        if self.pending.is_empty() {
            return None;
        }
        self.playing = true;
        let len = self.pending.len().min(self.window_samples);
        Some(self.schedule_front(len))
    }

    fn schedule_front(&mut self, len: usize) -> WindowTiming {
        let window: Vec<f32> = self.pending.drain(..len).collect();
        let now = self.output.current_time();
        let starts_at = now.max(self.cursor);
        let duration = window.len() as f64 / self.sample_rate as f64;

        self.output.schedule(&window, starts_at);
        self.cursor = starts_at + duration;

        debug!(
            samples = window.len(),
            starts_at,
            cursor = self.cursor,
            "scheduled playback window"
        );
        WindowTiming {
            starts_at,
            duration,
        }
    }

    /// Drop everything queued and silence the device.
    ///
    /// Used when a turn is interrupted so no stale audio keeps playing.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.cursor = 0.0;
        self.playing = false;
        self.awaiting_header = false;
        self.wav_header = None;
        self.output.reset();
    }

    /// Decoded samples awaiting scheduling.
    pub fn buffered_samples(&self) -> &[f32] {
        &self.pending
    }

    /// Absolute device-clock time of the next scheduled sample.
    pub fn playback_cursor(&self) -> f64 {
        self.cursor
    }

    /// Current output device clock, for the driver's trigger timers.
    pub fn device_time(&self) -> f64 {
        self.output.current_time()
    }

    /// Whether the player currently has an active output graph.
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Header captured from the turn's first chunk, if any.
    pub fn wav_header(&self) -> Option<&[u8; WAV_HEADER_LEN]> {
        self.wav_header.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const RATE: u32 = 24_000;

    /// Scripted output device with a hand-advanced clock.
    #[derive(Clone, Default)]
    struct MockOutput {
        inner: Arc<Mutex<MockState>>,
    }

    #[derive(Default)]
    struct MockState {
        now: f64,
        scheduled: Vec<(usize, f64)>,
        resets: usize,
    }

    impl MockOutput {
        fn advance(&self, secs: f64) {
            self.inner.lock().now += secs;
        }

        fn scheduled(&self) -> Vec<(usize, f64)> {
            self.inner.lock().scheduled.clone()
        }

        fn resets(&self) -> usize {
            self.inner.lock().resets
        }
    }

    impl AudioOutput for MockOutput {
        fn current_time(&self) -> f64 {
            self.inner.lock().now
        }

        fn schedule(&mut self, samples: &[f32], start_at: f64) {
            self.inner.lock().scheduled.push((samples.len(), start_at));
        }

        fn reset(&mut self) {
            self.inner.lock().resets += 1;
        }
    }

    fn player(output: &MockOutput) -> StreamingAudioPlayer {
        let mut p = StreamingAudioPlayer::new(Box::new(output.clone()), RATE);
        p.begin_turn();
        p
    }

    /// A synthetic 44-byte WAV header followed by the given samples.
    fn first_chunk(samples: &[i16]) -> Vec<u8> {
        let mut bytes = synthetic_header(samples.len());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    fn pcm_chunk(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn synthetic_header(sample_count: usize) -> Vec<u8> {
        let data_len = (sample_count * 2) as u32;
        let mut h = Vec::with_capacity(WAV_HEADER_LEN);
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&(36 + data_len).to_le_bytes());
        h.extend_from_slice(b"WAVEfmt ");
        h.extend_from_slice(&16u32.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes()); // PCM
        h.extend_from_slice(&1u16.to_le_bytes()); // mono
        h.extend_from_slice(&RATE.to_le_bytes());
        h.extend_from_slice(&(RATE * 2).to_le_bytes());
        h.extend_from_slice(&2u16.to_le_bytes());
        h.extend_from_slice(&16u16.to_le_bytes());
        h.extend_from_slice(b"data");
        h.extend_from_slice(&data_len.to_le_bytes());
        assert_eq!(h.len(), WAV_HEADER_LEN);
        h
    }

    #[test]
    fn first_chunk_header_is_stripped_and_samples_decoded() {
        let out = MockOutput::default();
        let mut p = player(&out);

        p.add_chunk(&first_chunk(&[16384, -16384])).unwrap();

        let decoded = p.buffered_samples();
        assert_eq!(decoded.len(), 2);
        assert_relative_eq!(decoded[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(decoded[1], -0.5, epsilon = 1e-6);
        // Header retained, not reinterpreted as sample data
        assert!(p.wav_header().is_some());
    }

    #[test]
    fn later_chunks_are_headerless_pcm() {
        let out = MockOutput::default();
        let mut p = player(&out);
        p.add_chunk(&first_chunk(&[0; 4])).unwrap();
        p.add_chunk(&pcm_chunk(&[16384, -16384])).unwrap();
        let decoded = p.buffered_samples();
        assert_eq!(decoded.len(), 6);
        assert_relative_eq!(decoded[4], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn sub_window_audio_is_not_scheduled_until_flush() {
        let out = MockOutput::default();
        let mut p = player(&out);

        // 0.1 s of samples — well under the half-second window
        let samples = vec![1000i16; (RATE / 10) as usize];
        let timing = p.add_chunk(&first_chunk(&samples)).unwrap();
        assert!(timing.is_none());
        assert!(out.scheduled().is_empty());

        // End-of-turn flush forces the final short window out
        let timing = p.flush().expect("flush schedules the remainder");
        assert_relative_eq!(timing.duration, 0.1, epsilon = 1e-6);
        assert_eq!(out.scheduled().len(), 1);
        assert!(p.buffered_samples().is_empty());
    }

    #[test]
    fn cursor_is_monotonic_and_never_behind_the_clock() {
        let out = MockOutput::default();
        let mut p = player(&out);

        let window = vec![100i16; (RATE / 2) as usize];
        p.add_chunk(&first_chunk(&window)).unwrap();

        let mut last_cursor = 0.0;
        // Arbitrary inter-arrival delays, including one longer than a
        // whole window.
        for delay in [0.0, 0.1, 0.7, 0.02, 1.3] {
            out.advance(delay);
            let before = out.current_time();
            p.add_chunk(&pcm_chunk(&window)).unwrap();
            let cursor = p.playback_cursor();
            assert!(cursor >= last_cursor, "cursor regressed: {cursor}");
            assert!(cursor >= before, "cursor behind clock: {cursor} < {before}");
            last_cursor = cursor;
        }

        // Every scheduled start honours max(now, cursor): starts never
        // decrease.
        let starts: Vec<f64> = out.scheduled().iter().map(|(_, s)| *s).collect();
        for pair in starts.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn both_triggers_are_idempotent_when_empty() {
        let out = MockOutput::default();
        let mut p = player(&out);
        p.add_chunk(&first_chunk(&vec![100i16; (RATE / 2) as usize]))
            .unwrap();
        assert_eq!(out.scheduled().len(), 1);

        // Ended and proactive both fire with nothing buffered — no-ops
        assert!(p.handle_buffer_ended().is_none());
        assert!(p.handle_proactive_tick().is_none());
        assert_eq!(out.scheduled().len(), 1);
    }

    #[test]
    fn short_first_chunk_is_rejected_without_state_damage() {
        let out = MockOutput::default();
        let mut p = player(&out);
        let err = p.add_chunk(&[0u8; 10]);
        assert!(matches!(err, Err(ConfabError::Protocol(_))));

        // The turn continues: the next chunk is still treated as first
        p.add_chunk(&first_chunk(&[16384])).unwrap();
        assert_eq!(p.buffered_samples().len(), 1);
    }

    #[test]
    fn reset_drops_pending_audio_and_silences_the_device() {
        let out = MockOutput::default();
        let mut p = player(&out);
        p.add_chunk(&first_chunk(&vec![500i16; 1000])).unwrap();
        assert!(!p.buffered_samples().is_empty());

        p.reset();
        assert!(p.buffered_samples().is_empty());
        assert_eq!(p.playback_cursor(), 0.0);
        assert!(!p.is_playing());
        assert_eq!(out.resets(), 1);

        // Late chunks after reset decode but need a new begin_turn for the
        // header contract; flush of an empty buffer is a no-op.
        assert!(p.flush().is_none());
    }

    #[test]
    fn burst_arrival_schedules_back_to_back_windows() {
        let out = MockOutput::default();
        let mut p = player(&out);

        // Two full windows in one chunk
        let burst = vec![100i16; RATE as usize];
        p.add_chunk(&first_chunk(&burst)).unwrap();

        let scheduled = out.scheduled();
        assert_eq!(scheduled.len(), 2);
        let (len0, start0) = scheduled[0];
        let (len1, start1) = scheduled[1];
        assert_eq!(len0, (RATE / 2) as usize);
        assert_eq!(len1, (RATE / 2) as usize);
        // Gapless: second window starts exactly where the first ends
        assert_relative_eq!(start1, start0 + 0.5, epsilon = 1e-9);
    }
}
