//! `CallEngine` — top-level call lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! CallEngine::new()
//!     └─► start()        → session open, devices open, pipeline + turn
//!         │                 runner + playback driver spawned,
//!         │                 status = Listening
//!         └─► stop()     → running=false, streams dropped, session
//!                           closed, status = Stopped
//! ```
//!
//! `start()`/`stop()` return errors rather than panicking when called in
//! the wrong state.
//!
//! ## Task layout
//!
//! - capture pipeline: `spawn_blocking` (cpal input stream is `!Send`)
//! - playback device: `spawn_blocking` (same constraint, output side)
//! - turn runner: async task consuming committed recordings, one turn at
//!   a time
//! - playback driver: async task owning the streaming player and its
//!   ended/proactive trigger timers
//!
//! Interruption can originate on any of them (barge-in on the pipeline
//! thread, `error`/`interrupted` on the stream, explicit `stop()`); every
//! path funnels through the dialog manager's single-active rule, so the
//! cleanup is idempotent no matter who gets there first.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    audio::output::{CpalAudioOutput, OutputClock},
    audio::MicCapture,
    buffering::{create_capture_ring, create_playback_ring, SampleConsumer},
    capture::{CommittedRecording, Recorder, RecorderConfig},
    dialog::{generate_turn_id, DialogQueueManager},
    error::{ConfabError, Result},
    events::{AudioActivityEvent, CallEvent, CallPayload, CallStatus, CallStatusEvent},
    playback::{StreamingAudioPlayer, WindowTiming},
    protocol::{decode_audio_content, Event},
    stream::{ApiConfig, ResponseStreamController, StreamOutcome, TurnRequest},
    vad::{
        gate::{MonotonicClock, SpeechGate, SpeechGateConfig},
        BandEnergy, EnergyEstimator,
    },
};

#[cfg(feature = "audio-cpal")]
use crate::audio::output::PlaybackStream;

pub use pipeline::{CallDiagnostics, DiagnosticsSnapshot, PipelineContext};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `CallEngine`.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Rate for recording and VAD after capture-side resampling (Hz).
    /// Default: 16000.
    pub recording_sample_rate: u32,
    /// Rate of the server's AI audio stream (Hz). A server contract
    /// constant, not negotiated. Default: 24000.
    pub playback_sample_rate: u32,
    /// Samples per VAD analysis frame. Default: 256.
    pub vad_frame_len: usize,
    /// Speech gate tunables (threshold, debounce, silence timeout).
    pub gate: SpeechGateConfig,
    /// Consecutive speech frames required to treat speech during AI
    /// playback as barge-in (rejects playback echo leakage). Default: 3.
    pub barge_in_frames: u32,
    /// Recording gates (size floor, speech validity, duration cap).
    pub recorder: RecorderConfig,
    /// Bounded dialog history capacity. Default: 5.
    pub turn_history: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            recording_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            vad_frame_len: 256,
            gate: SpeechGateConfig::default(),
            barge_in_frames: 3,
            recorder: RecorderConfig::default(),
            turn_history: 5,
        }
    }
}

/// A committed recording plus context, queued for the turn runner.
pub struct TurnPayload {
    pub recording: CommittedRecording,
    /// Last VAD level at finalize time, forwarded as a server hint.
    pub audio_level: f32,
}

/// Commands consumed by the playback driver.
pub enum PlaybackCmd {
    /// Arm the player for a new turn (next chunk carries the WAV header).
    BeginTurn,
    /// One decoded audio chunk.
    Chunk(Vec<u8>),
    /// End-of-turn: schedule any final partial window.
    Flush,
    /// Interruption: drop queued audio and silence the device.
    Reset,
}

enum OutboundTurn {
    Voice(TurnPayload),
    Text(String),
}

/// State shared by the engine facade and its spawned tasks.
struct Shared {
    running: Arc<AtomicBool>,
    /// True while an AI response is streaming/playing — gates barge-in.
    ai_speaking: Arc<AtomicBool>,
    status: Mutex<CallStatus>,
    event_tx: broadcast::Sender<CallEvent>,
    status_tx: broadcast::Sender<CallStatusEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    seq: AtomicU64,
    manager: Mutex<DialogQueueManager>,
    controller: ResponseStreamController,
    session_id: Mutex<Option<String>>,
    playback_tx: Mutex<Option<mpsc::UnboundedSender<PlaybackCmd>>>,
    /// Captured at `start()` so sync paths (pipeline thread) can spawn
    /// fire-and-forget server notifications.
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    diagnostics: Arc<CallDiagnostics>,
}

impl Shared {
    fn emit(&self, turn_id: &str, payload: CallPayload) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_tx.send(CallEvent {
            seq,
            turn_id: turn_id.to_string(),
            payload,
        });
    }

    fn set_status(&self, status: CallStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(CallStatusEvent { status, detail });
    }

    fn playback(&self, cmd: PlaybackCmd) {
        if let Some(tx) = self.playback_tx.lock().as_ref() {
            let _ = tx.send(cmd);
        }
    }

    /// Route one stream event through the dialog manager and apply it.
    fn dispatch_event(&self, turn_id: &str, event: Event) {
        let Some(event) = self.manager.lock().route_event(turn_id, event) else {
            self.diagnostics.events_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match event {
            Event::Text(content) => self.emit(turn_id, CallPayload::Text { content }),
            Event::Transcript(content) => {
                self.emit(turn_id, CallPayload::Transcript { content })
            }
            Event::Audio(content) => match decode_audio_content(&content) {
                Ok(bytes) => {
                    self.diagnostics
                        .audio_chunks_played
                        .fetch_add(1, Ordering::Relaxed);
                    self.playback(PlaybackCmd::Chunk(bytes));
                }
                Err(e) => {
                    self.diagnostics
                        .protocol_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "skipping undecodable audio chunk");
                }
            },
            Event::Usage(content) => debug!(usage = %content, "usage reported"),
            // Terminal events are handled through the stream outcome.
            Event::Error(_) | Event::Interrupted => {}
        }
    }
}

/// The top-level engine handle.
///
/// `CallEngine` is `Send + Sync` — all state lives behind `Arc` and
/// interior mutability, so it can be shared between a UI layer and the
/// engine's own tasks.
pub struct CallEngine {
    config: CallConfig,
    shared: Arc<Shared>,
}

impl CallEngine {
    /// Create a new engine. Does not open devices or the session — call
    /// `start()`.
    pub fn new(config: CallConfig, api: ApiConfig) -> Result<Self> {
        let controller = ResponseStreamController::new(api)?;
        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);

        let shared = Arc::new(Shared {
            running: Arc::new(AtomicBool::new(false)),
            ai_speaking: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(CallStatus::Idle),
            event_tx,
            status_tx,
            activity_tx,
            seq: AtomicU64::new(0),
            manager: Mutex::new(DialogQueueManager::new(config.turn_history)),
            controller,
            session_id: Mutex::new(None),
            playback_tx: Mutex::new(None),
            runtime: Mutex::new(None),
            diagnostics: Arc::new(CallDiagnostics::default()),
        });

        Ok(Self { config, shared })
    }

    /// Start the call with the default microphone.
    pub async fn start(&self) -> Result<()> {
        self.start_with_device(None).await
    }

    /// Start the call, preferring the named input device.
    ///
    /// Opens the server session and both audio devices, then spawns the
    /// pipeline, turn runner and playback driver. Returns once the
    /// microphone is confirmed open (or fails).
    ///
    /// # Errors
    /// - `ConfabError::AlreadyRunning` if already started.
    /// - Device errors (`NoDefaultInputDevice`, `AudioStream`, ...) — fatal
    ///   to the call, surfaced to the caller, never silently retried.
    /// - `ConfabError::Connection` when the session cannot be opened.
    pub async fn start_with_device(&self, preferred_input_device: Option<String>) -> Result<()> {
        let shared = &self.shared;
        if shared.running.load(Ordering::SeqCst) {
            return Err(ConfabError::AlreadyRunning);
        }

        shared.diagnostics.reset();
        *shared.runtime.lock() = Some(tokio::runtime::Handle::current());
        shared.running.store(true, Ordering::SeqCst);
        shared.set_status(CallStatus::Connecting, None);

        // ── Server session ───────────────────────────────────────────────
        let session_id = match shared.controller.start_session().await {
            Ok(id) => id,
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                shared.set_status(CallStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };
        info!(session = %session_id, "server session open");
        *shared.session_id.lock() = Some(session_id);

        // ── Playback device + driver ─────────────────────────────────────
        let (playback_producer, playback_consumer) = create_playback_ring();
        let clock = match self.open_playback(playback_consumer).await {
            Ok(clock) => clock,
            Err(e) => return self.fail_start(e),
        };
        let output = match CpalAudioOutput::new(
            playback_producer,
            clock,
            self.config.playback_sample_rate,
        ) {
            Ok(output) => output,
            Err(e) => return self.fail_start(e),
        };
        let player =
            StreamingAudioPlayer::new(Box::new(output), self.config.playback_sample_rate);
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        *shared.playback_tx.lock() = Some(playback_tx);
        tokio::spawn(playback_driver(
            player,
            playback_rx,
            Arc::clone(&shared.diagnostics),
        ));

        // ── Turn runner ──────────────────────────────────────────────────
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_turns(Arc::clone(shared), turn_rx));

        // ── Capture + pipeline ───────────────────────────────────────────
        let (producer, consumer) = create_capture_ring();
        let (open_tx, open_rx) = tokio::sync::oneshot::channel::<Result<u32>>();

        let config = self.config.clone();
        let running = Arc::clone(&shared.running);
        let ai_speaking = Arc::clone(&shared.ai_speaking);
        let activity_tx = shared.activity_tx.clone();
        let diagnostics = Arc::clone(&shared.diagnostics);
        let interrupt_hook = {
            let shared = Arc::clone(shared);
            Box::new(move || interrupt_call(&shared)) as Box<dyn Fn() + Send>
        };

        tokio::task::spawn_blocking(move || {
            // Open the device on THIS thread — cpal::Stream is !Send.
            let capture = match MicCapture::open_with_preference(
                producer,
                Arc::clone(&running),
                preferred_input_device.as_deref(),
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };
            let capture_sample_rate = capture.sample_rate;

            let estimator: Box<dyn EnergyEstimator> =
                Box::new(BandEnergy::new(config.vad_frame_len));
            let gate = SpeechGate::new(config.gate.clone(), Box::new(MonotonicClock));
            let mut recorder_config = config.recorder.clone();
            recorder_config.sample_rate = config.recording_sample_rate;
            let recorder = Recorder::new(recorder_config);

            pipeline::run(PipelineContext {
                config,
                estimator,
                gate,
                recorder,
                consumer,
                running,
                ai_speaking,
                activity_tx,
                turn_tx,
                interrupt: interrupt_hook,
                capture_sample_rate,
                diagnostics,
            });

            // Stream drops here, releasing the microphone on this thread.
            drop(capture);
        });

        match open_rx.await {
            Ok(Ok(_rate)) => {
                shared.set_status(CallStatus::Listening, None);
                info!("call started — listening");
                Ok(())
            }
            Ok(Err(e)) => self.fail_start(e),
            Err(_) => self.fail_start(ConfabError::Other(anyhow::anyhow!(
                "capture task died unexpectedly"
            ))),
        }
    }

    /// Stop the call and tear everything down.
    ///
    /// # Errors
    /// - `ConfabError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            return Err(ConfabError::NotRunning);
        }

        // Cancel any in-flight turn before the session goes away.
        interrupt_call(&self.shared);

        // Dropping the sender stops the playback driver.
        *shared.playback_tx.lock() = None;

        let session = shared.session_id.lock().take();
        let runtime = shared.runtime.lock().clone();
        if let (Some(session_id), Some(handle)) = (session, runtime) {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                shared.controller.end_session(&session_id).await;
            });
        }

        shared.set_status(CallStatus::Stopped, None);
        info!("call stop requested");
        Ok(())
    }

    /// Manually interrupt the in-flight AI response (end-call button,
    /// explicit cancel). Safe to call when nothing is active.
    pub fn interrupt(&self) {
        interrupt_call(&self.shared);
    }

    /// Send a typed text turn through the same turn lifecycle as voice.
    ///
    /// Resolves when the response stream finishes (or is interrupted).
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ConfabError::NotRunning);
        }
        run_one_turn(Arc::clone(&self.shared), OutboundTurn::Text(text.into())).await;
        Ok(())
    }

    /// Current call status (snapshot).
    pub fn status(&self) -> CallStatus {
        *self.shared.status.lock()
    }

    /// Subscribe to conversation events (text/transcript/turn lifecycle).
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Subscribe to call status changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<CallStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Subscribe to live VAD activity (level + speaking flag per frame).
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.shared.activity_tx.subscribe()
    }

    /// Snapshot of pipeline/turn counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    fn fail_start(&self, e: ConfabError) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared
            .set_status(CallStatus::Error, Some(e.to_string()));
        // Best-effort session close so the server is not left waiting.
        let session = self.shared.session_id.lock().take();
        if let Some(session_id) = session {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.controller.end_session(&session_id).await;
            });
        }
        Err(e)
    }

    #[cfg(feature = "audio-cpal")]
    async fn open_playback(&self, consumer: SampleConsumer) -> Result<Arc<OutputClock>> {
        let running = Arc::clone(&self.shared.running);
        let (open_tx, open_rx) = tokio::sync::oneshot::channel::<Result<Arc<OutputClock>>>();

        tokio::task::spawn_blocking(move || {
            let stream = match PlaybackStream::open_default(consumer, Arc::clone(&running)) {
                Ok(s) => {
                    let _ = open_tx.send(Ok(Arc::clone(&s.clock)));
                    s
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            // Stream drops here, releasing the output device on this thread.
            drop(stream);
        });

        match open_rx.await {
            Ok(result) => result,
            Err(_) => Err(ConfabError::Other(anyhow::anyhow!(
                "playback task died unexpectedly"
            ))),
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    async fn open_playback(&self, _consumer: SampleConsumer) -> Result<Arc<OutputClock>> {
        Err(ConfabError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Interrupt the active turn: cancel its stream, silence playback, notify
/// the server asynchronously. No-op when nothing is active.
fn interrupt_call(shared: &Arc<Shared>) {
    let Some(turn_id) = shared.manager.lock().interrupt_active() else {
        return;
    };
    shared
        .diagnostics
        .turns_interrupted
        .fetch_add(1, Ordering::Relaxed);
    shared.controller.cancel_active();
    shared.playback(PlaybackCmd::Reset);
    shared.ai_speaking.store(false, Ordering::Release);
    info!(turn = %turn_id, "response interrupted");

    // Fire-and-forget: local responsiveness never waits on the server
    // acknowledging the interrupt.
    let session = shared.session_id.lock().clone();
    let runtime = shared.runtime.lock().clone();
    if let (Some(session_id), Some(handle)) = (session, runtime) {
        let shared = Arc::clone(shared);
        handle.spawn(async move {
            shared.controller.interrupt_session(&session_id).await;
        });
    }
}

/// Sequential turn runner: one committed recording → one streamed turn.
async fn run_turns(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<TurnPayload>) {
    while let Some(payload) = rx.recv().await {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        run_one_turn(Arc::clone(&shared), OutboundTurn::Voice(payload)).await;
    }
    debug!("turn runner stopped");
}

/// Run one complete turn: create, stream, route, settle.
async fn run_one_turn(shared: Arc<Shared>, outbound: OutboundTurn) {
    // Starting a new turn forces any still-active one out first.
    interrupt_call(&shared);

    let Some(session_id) = shared.session_id.lock().clone() else {
        warn!("no open session — dropping outbound turn");
        return;
    };

    let turn_id = generate_turn_id();
    shared.manager.lock().create_turn(turn_id.clone());
    shared
        .diagnostics
        .turns_started
        .fetch_add(1, Ordering::Relaxed);
    shared.emit(&turn_id, CallPayload::TurnStarted);
    shared.playback(PlaybackCmd::BeginTurn);
    shared.ai_speaking.store(true, Ordering::Release);
    shared.set_status(CallStatus::Responding, None);

    let request = match outbound {
        OutboundTurn::Voice(payload) => TurnRequest {
            session_id,
            turn_id: turn_id.clone(),
            audio: Some(payload.recording.as_data_uri()),
            text: None,
            audio_level: Some(payload.audio_level),
        },
        OutboundTurn::Text(text) => TurnRequest {
            session_id,
            turn_id: turn_id.clone(),
            audio: None,
            text: Some(text),
            audio_level: None,
        },
    };

    let outcome = shared
        .controller
        .send(&request, |event| shared.dispatch_event(&turn_id, event))
        .await;

    shared.ai_speaking.store(false, Ordering::Release);
    let still_running = shared.running.load(Ordering::SeqCst);

    match outcome {
        Ok(StreamOutcome::Completed) => {
            let completion = shared.manager.lock().complete_active(&turn_id);
            if let Some(done) = completion {
                // Let the final partial window out rather than stranding it.
                shared.playback(PlaybackCmd::Flush);
                if done.closing_quote {
                    shared.emit(
                        &turn_id,
                        CallPayload::Transcript {
                            content: "\"".into(),
                        },
                    );
                }
                shared
                    .diagnostics
                    .turns_completed
                    .fetch_add(1, Ordering::Relaxed);
                shared.emit(&turn_id, CallPayload::TurnCompleted { text: done.text });
                if still_running {
                    shared.set_status(CallStatus::Listening, None);
                }
            }
        }
        Ok(StreamOutcome::Interrupted) | Ok(StreamOutcome::Cancelled) => {
            // Local barge-in already cleaned up; a server-side interrupt
            // acknowledgement reaches here with the turn still active.
            if shared.manager.lock().interrupt_turn(&turn_id) {
                shared
                    .diagnostics
                    .turns_interrupted
                    .fetch_add(1, Ordering::Relaxed);
                shared.playback(PlaybackCmd::Reset);
            }
            shared.emit(&turn_id, CallPayload::TurnInterrupted);
            if still_running {
                shared.set_status(CallStatus::Listening, None);
            }
        }
        Ok(StreamOutcome::ServerError(message)) => {
            if shared.manager.lock().interrupt_turn(&turn_id) {
                shared.playback(PlaybackCmd::Reset);
            }
            warn!(turn = %turn_id, error = %message, "server reported an error");
            shared.emit(
                &turn_id,
                CallPayload::ServerError {
                    message: message.clone(),
                },
            );
            if still_running {
                shared.set_status(CallStatus::Listening, Some(format!("server error: {message}")));
            }
        }
        Err(e) => {
            if shared.manager.lock().interrupt_turn(&turn_id) {
                shared.playback(PlaybackCmd::Reset);
            }
            let detail = match &e {
                ConfabError::Connection(m) => format!("connection failed: {m}"),
                other => other.to_string(),
            };
            warn!(turn = %turn_id, error = %detail, "turn failed");
            shared.emit(&turn_id, CallPayload::TurnInterrupted);
            // Always back to a re-armable listening state — capture must
            // never stay stuck after a failed turn.
            if still_running {
                shared.set_status(CallStatus::Listening, Some(detail));
            }
        }
    }
}

/// Playback driver: owns the streaming player and the double-trigger
/// timers that keep the window scheduler fed.
async fn playback_driver(
    mut player: StreamingAudioPlayer,
    mut rx: mpsc::UnboundedReceiver<PlaybackCmd>,
    diagnostics: Arc<CallDiagnostics>,
) {
    use tokio::time::{sleep_until, Instant};

    let mut proactive_at: Option<Instant> = None;
    let mut ended_at: Option<Instant> = None;

    // Map a scheduled window's device-clock times onto wall-clock timers.
    fn arm(
        player: &StreamingAudioPlayer,
        timing: WindowTiming,
        proactive_at: &mut Option<Instant>,
        ended_at: &mut Option<Instant>,
    ) {
        let device_now = player.device_time();
        let base = Instant::now();
        let until = |target: f64| base + Duration::from_secs_f64((target - device_now).max(0.0));
        *proactive_at = Some(until(timing.proactive_at()));
        *ended_at = Some(until(timing.ends_at()));
    }

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(PlaybackCmd::BeginTurn) => player.begin_turn(),
                Some(PlaybackCmd::Chunk(bytes)) => match player.add_chunk(&bytes) {
                    Ok(Some(timing)) => arm(&player, timing, &mut proactive_at, &mut ended_at),
                    Ok(None) => {}
                    Err(e) => {
                        // One bad chunk never aborts the turn.
                        diagnostics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "dropping undecodable audio chunk");
                    }
                },
                Some(PlaybackCmd::Flush) => {
                    if let Some(timing) = player.flush() {
                        arm(&player, timing, &mut proactive_at, &mut ended_at);
                    }
                }
                Some(PlaybackCmd::Reset) => {
                    player.reset();
                    proactive_at = None;
                    ended_at = None;
                }
                None => break,
            },
            _ = async { sleep_until(proactive_at.unwrap()).await }, if proactive_at.is_some() => {
                proactive_at = None;
                if let Some(timing) = player.handle_proactive_tick() {
                    arm(&player, timing, &mut proactive_at, &mut ended_at);
                }
            }
            _ = async { sleep_until(ended_at.unwrap()).await }, if ended_at.is_some() => {
                ended_at = None;
                if let Some(timing) = player.handle_buffer_ended() {
                    arm(&player, timing, &mut proactive_at, &mut ended_at);
                }
            }
        }
    }
    debug!("playback driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CallEngine {
        CallEngine::new(CallConfig::default(), ApiConfig::default()).unwrap()
    }

    #[test]
    fn new_engine_is_idle() {
        let e = engine();
        assert_eq!(e.status(), CallStatus::Idle);
        assert_eq!(e.diagnostics_snapshot().turns_started, 0);
    }

    #[test]
    fn stop_before_start_errors() {
        let e = engine();
        assert!(matches!(e.stop(), Err(ConfabError::NotRunning)));
    }

    #[test]
    fn interrupt_without_active_turn_is_a_noop() {
        let e = engine();
        e.interrupt();
        e.interrupt();
        assert_eq!(e.diagnostics_snapshot().turns_interrupted, 0);
    }

    #[tokio::test]
    async fn send_text_requires_a_running_call() {
        let e = engine();
        assert!(matches!(
            e.send_text("hello").await,
            Err(ConfabError::NotRunning)
        ));
    }
}
