//! Blocking capture pipeline loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Drain capture ring → Vec<f32> (one chunk per iteration)
//! 2. Resample to the 16 kHz recording rate
//! 3. Cut into fixed VAD frames → voice-band level → speech gate
//! 4. Gate events drive the recorder:
//!      SpeechStart     → begin recording (and barge-in check)
//!      SilenceTimeout  → finalize → size/speech gates → commit turn
//! 5. Committed recordings go to the async turn runner
//! ```
//!
//! The whole loop runs under `spawn_blocking`, keeping the Tokio executor
//! free for the network stream and the playback driver. The microphone
//! stays live during AI playback so the gate can detect barge-in.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{chunk::AudioFrame, Consumer, SampleConsumer},
    capture::{FinalizeOutcome, Recorder},
    engine::{CallConfig, TurnPayload},
    events::AudioActivityEvent,
    vad::{gate::GateEvent, EnergyEstimator, SpeechGate},
};

/// Chunk size drained from the capture ring per iteration.
/// 20 ms at 48 kHz = 960 samples, a reasonable stride for most devices.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY_MS: u64 = 5;

/// Rolling pipeline counters for observability.
pub struct CallDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_resampled: AtomicUsize,
    pub vad_frames: AtomicUsize,
    pub vad_speech_frames: AtomicUsize,
    pub recordings_committed: AtomicUsize,
    pub recordings_discarded: AtomicUsize,
    pub turns_started: AtomicUsize,
    pub turns_completed: AtomicUsize,
    pub turns_interrupted: AtomicUsize,
    pub events_dropped: AtomicUsize,
    pub audio_chunks_played: AtomicUsize,
    pub protocol_errors: AtomicUsize,
}

impl Default for CallDiagnostics {
    fn default() -> Self {
        Self {
            frames_in: AtomicUsize::new(0),
            frames_resampled: AtomicUsize::new(0),
            vad_frames: AtomicUsize::new(0),
            vad_speech_frames: AtomicUsize::new(0),
            recordings_committed: AtomicUsize::new(0),
            recordings_discarded: AtomicUsize::new(0),
            turns_started: AtomicUsize::new(0),
            turns_completed: AtomicUsize::new(0),
            turns_interrupted: AtomicUsize::new(0),
            events_dropped: AtomicUsize::new(0),
            audio_chunks_played: AtomicUsize::new(0),
            protocol_errors: AtomicUsize::new(0),
        }
    }
}

impl CallDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_resampled.store(0, Ordering::Relaxed);
        self.vad_frames.store(0, Ordering::Relaxed);
        self.vad_speech_frames.store(0, Ordering::Relaxed);
        self.recordings_committed.store(0, Ordering::Relaxed);
        self.recordings_discarded.store(0, Ordering::Relaxed);
        self.turns_started.store(0, Ordering::Relaxed);
        self.turns_completed.store(0, Ordering::Relaxed);
        self.turns_interrupted.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.audio_chunks_played.store(0, Ordering::Relaxed);
        self.protocol_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_resampled: self.frames_resampled.load(Ordering::Relaxed),
            vad_frames: self.vad_frames.load(Ordering::Relaxed),
            vad_speech_frames: self.vad_speech_frames.load(Ordering::Relaxed),
            recordings_committed: self.recordings_committed.load(Ordering::Relaxed),
            recordings_discarded: self.recordings_discarded.load(Ordering::Relaxed),
            turns_started: self.turns_started.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_interrupted: self.turns_interrupted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            audio_chunks_played: self.audio_chunks_played.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_resampled: usize,
    pub vad_frames: usize,
    pub vad_speech_frames: usize,
    pub recordings_committed: usize,
    pub recordings_discarded: usize,
    pub turns_started: usize,
    pub turns_completed: usize,
    pub turns_interrupted: usize,
    pub events_dropped: usize,
    pub audio_chunks_played: usize,
    pub protocol_errors: usize,
}

/// All context the pipeline needs, passed as one struct so the closure
/// stays tidy.
pub struct PipelineContext {
    pub config: CallConfig,
    pub estimator: Box<dyn EnergyEstimator>,
    pub gate: SpeechGate,
    pub recorder: Recorder,
    pub consumer: SampleConsumer,
    pub running: Arc<AtomicBool>,
    /// Set by the turn runner while an AI response is streaming/playing.
    pub ai_speaking: Arc<AtomicBool>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub turn_tx: mpsc::UnboundedSender<TurnPayload>,
    /// Engine hook invoked on barge-in: cancels the active turn, resets
    /// playback and notifies the server.
    pub interrupt: Box<dyn Fn() + Send>,
    pub capture_sample_rate: u32,
    pub diagnostics: Arc<CallDiagnostics>,
}

/// Run the blocking pipeline until `ctx.running` becomes false.
pub fn run(mut ctx: PipelineContext) {
    info!("capture pipeline started");

    let mut resampler = match RateConverter::new(
        ctx.capture_sample_rate,
        ctx.config.recording_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("failed to create capture resampler: {e}");
            return;
        }
    };

    if !resampler.is_passthrough() {
        info!(
            from = ctx.capture_sample_rate,
            to = ctx.config.recording_sample_rate,
            "capture resampling enabled"
        );
    }

    // Scratch buffer reused each iteration.
    let mut raw = vec![0f32; DRAIN_CHUNK];
    // Resampled samples awaiting a full VAD frame.
    let mut frame_buf: Vec<f32> = Vec::with_capacity(ctx.config.vad_frame_len * 4);
    let mut activity_seq = 0u64;
    // One barge-in per speech run.
    let mut barge_latched = false;

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Drain capture ring ─────────────────────────────────────────
        let n = ctx.consumer.pop_slice(&mut raw);

        if n == 0 {
            // The silence timer and the duration cap must keep ticking even
            // if the device goes quiet on us.
            if let Some(GateEvent::SilenceTimeout) = ctx.gate.poll_silence_timeout() {
                finalize_recording(&mut ctx);
            }
            if ctx.recorder.is_recording() && ctx.recorder.max_duration_reached() {
                warn!("max recording duration reached while idle — finalizing");
                finalize_recording(&mut ctx);
            }
            std::thread::sleep(std::time::Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }

        ctx.diagnostics.frames_in.fetch_add(n, Ordering::Relaxed);

        // ── 2. Resample to the recording rate ─────────────────────────────
        let resampled = resampler.process(&raw[..n]);
        if resampled.is_empty() {
            // Partial chunk — rubato is waiting for more input
            continue;
        }
        ctx.diagnostics
            .frames_resampled
            .fetch_add(resampled.len(), Ordering::Relaxed);

        frame_buf.extend_from_slice(&resampled);

        // ── 3. Per-frame VAD + gate ───────────────────────────────────────
        while frame_buf.len() >= ctx.config.vad_frame_len {
            let frame_samples: Vec<f32> = frame_buf.drain(..ctx.config.vad_frame_len).collect();
            let frame = AudioFrame::new(frame_samples, ctx.config.recording_sample_rate);

            let level = ctx.estimator.level(&frame);
            ctx.diagnostics.vad_frames.fetch_add(1, Ordering::Relaxed);

            let events = ctx.gate.process(level);
            let snapshot = ctx.gate.snapshot();
            if snapshot.is_speaking {
                ctx.diagnostics
                    .vad_speech_frames
                    .fetch_add(1, Ordering::Relaxed);
            }

            let _ = ctx.activity_tx.send(AudioActivityEvent {
                seq: activity_seq,
                level,
                is_speaking: snapshot.is_speaking,
            });
            activity_seq = activity_seq.saturating_add(1);

            // Barge-in: a confirmed run of speech frames while the AI is
            // mid-response. Latched so one utterance interrupts once.
            if snapshot.consecutive_speech_frames >= ctx.config.barge_in_frames
                && ctx.ai_speaking.load(Ordering::Acquire)
                && !barge_latched
            {
                barge_latched = true;
                info!("barge-in detected — interrupting AI response");
                (ctx.interrupt)();
            }
            if snapshot.consecutive_speech_frames == 0 {
                barge_latched = false;
            }

            for event in events {
                match event {
                    GateEvent::SpeechStart => {
                        if ctx.recorder.start() {
                            debug!("speech confirmed — recording");
                        }
                    }
                    GateEvent::SpeechEnd => {
                        debug!("speech ended — silence timer armed");
                    }
                    GateEvent::SilenceTimeout => {
                        finalize_recording(&mut ctx);
                    }
                }
            }
        }

        // ── 4. Feed the recorder ──────────────────────────────────────────
        if ctx.recorder.is_recording() {
            ctx.recorder.push(&resampled);
            if ctx.recorder.max_duration_reached() {
                warn!("max recording duration reached — finalizing");
                finalize_recording(&mut ctx);
            }
        }
    }

    // Teardown: an in-flight recording at call end is discarded, never sent.
    ctx.recorder.discard();
    ctx.gate.reset();

    let snap = ctx.diagnostics.snapshot();
    info!(
        frames_in = snap.frames_in,
        frames_resampled = snap.frames_resampled,
        vad_frames = snap.vad_frames,
        vad_speech_frames = snap.vad_speech_frames,
        recordings_committed = snap.recordings_committed,
        recordings_discarded = snap.recordings_discarded,
        "capture pipeline stopped — diagnostics"
    );
}

/// Finalize the current recording and hand accepted ones to the turn
/// runner. Discarded recordings simply re-arm: the next confirmed speech
/// starts a fresh cycle.
fn finalize_recording(ctx: &mut PipelineContext) {
    let audio_level = ctx.gate.snapshot().last_energy_level;
    match ctx.recorder.finalize() {
        FinalizeOutcome::Idle => {}
        FinalizeOutcome::Discarded(reason) => {
            ctx.diagnostics
                .recordings_discarded
                .fetch_add(1, Ordering::Relaxed);
            debug!(?reason, "recording discarded");
        }
        FinalizeOutcome::Committed(recording) => {
            ctx.diagnostics
                .recordings_committed
                .fetch_add(1, Ordering::Relaxed);
            info!(
                duration_secs = recording.duration_secs,
                bytes = recording.wav.len(),
                "utterance committed — sending turn"
            );
            let _ = ctx.turn_tx.send(TurnPayload {
                recording,
                audio_level,
            });
        }
    }
}
