//! Speech gate: hysteresis, debounce and the silence timeout.
//!
//! ## Policy
//!
//! 1. A frame is "speaking" iff its level exceeds `speaking_threshold`.
//! 2. `SpeechStart` fires after `start_frames` consecutive speaking frames
//!    (debounce against transient noise spikes), exactly once per run.
//! 3. `SpeechEnd` fires after `end_frames` consecutive silent frames —
//!    a longer debounce, biased toward not cutting the user off
//!    mid-sentence.
//! 4. `SpeechEnd` arms a single-shot silence timer; qualifying speech
//!    before expiry cancels it; expiry fires `SilenceTimeout` exactly once.
//!
//! The gate is a plain state machine driven by one call per frame, with the
//! wall clock injected through [`Clock`] so the debounce counters and timer
//! arming are testable without real waits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic time for the gate.
pub trait Clock: Send + 'static {
    fn now(&self) -> Instant;
}

/// Production clock: `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock advanced by hand.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

/// Discrete transitions emitted by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// Confirmed start of user speech.
    SpeechStart,
    /// Confirmed end of user speech; the silence timer is now armed.
    SpeechEnd,
    /// The silence timer elapsed with no further speech.
    SilenceTimeout,
}

/// Tunable gate parameters. Observed deployments disagree on the exact
/// numbers, so all of these are configuration rather than constants.
#[derive(Debug, Clone)]
pub struct SpeechGateConfig {
    /// Normalized level above which a frame counts as speaking. Default: 0.015.
    pub speaking_threshold: f32,
    /// Consecutive speaking frames before `SpeechStart`. Default: 3.
    pub start_frames: u32,
    /// Consecutive silent frames before `SpeechEnd`. Default: 10.
    pub end_frames: u32,
    /// Silence duration after `SpeechEnd` before `SilenceTimeout`. Default: 1.8 s.
    pub silence_timeout: Duration,
}

impl Default for SpeechGateConfig {
    fn default() -> Self {
        Self {
            speaking_threshold: 0.015,
            start_frames: 3,
            end_frames: 10,
            silence_timeout: Duration::from_millis(1_800),
        }
    }
}

/// Read-only view of the gate's per-frame counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct VadSnapshot {
    pub consecutive_speech_frames: u32,
    pub consecutive_silence_frames: u32,
    pub is_speaking: bool,
    pub last_energy_level: f32,
}

/// The debounced speaking/silence state machine.
pub struct SpeechGate {
    config: SpeechGateConfig,
    state: VadSnapshot,
    silence_deadline: Option<Instant>,
    clock: Box<dyn Clock>,
}

impl SpeechGate {
    pub fn new(config: SpeechGateConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            config,
            state: VadSnapshot::default(),
            silence_deadline: None,
            clock,
        }
    }

    /// Feed one frame's level. Returns zero or more transitions, in order.
    pub fn process(&mut self, level: f32) -> Vec<GateEvent> {
        let mut events = Vec::new();

        // An armed timer may have expired between frames.
        if let Some(ev) = self.poll_silence_timeout() {
            events.push(ev);
        }

        if level > self.config.speaking_threshold {
            self.state.consecutive_speech_frames += 1;
            self.state.consecutive_silence_frames = 0;

            if self.state.consecutive_speech_frames >= self.config.start_frames {
                // Qualifying speech cancels any pending silence timer.
                self.silence_deadline = None;
                if !self.state.is_speaking {
                    self.state.is_speaking = true;
                    events.push(GateEvent::SpeechStart);
                }
            }
        } else {
            self.state.consecutive_silence_frames += 1;
            self.state.consecutive_speech_frames = 0;

            if self.state.consecutive_silence_frames >= self.config.end_frames
                && self.state.is_speaking
            {
                self.state.is_speaking = false;
                events.push(GateEvent::SpeechEnd);
                self.silence_deadline = Some(self.clock.now() + self.config.silence_timeout);
            }
        }

        self.state.last_energy_level = level;
        events
    }

    /// Check the silence timer without feeding a frame.
    ///
    /// Fires at most once per arming; the timer is cleared on expiry.
    pub fn poll_silence_timeout(&mut self) -> Option<GateEvent> {
        match self.silence_deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                self.silence_deadline = None;
                Some(GateEvent::SilenceTimeout)
            }
            _ => None,
        }
    }

    /// Clear all counters and any pending timer. Safe from any state and
    /// safe to call repeatedly.
    pub fn reset(&mut self) {
        self.state = VadSnapshot::default();
        self.silence_deadline = None;
    }

    /// Current counters and speaking flag.
    pub fn snapshot(&self) -> VadSnapshot {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOUD: f32 = 0.5;
    const QUIET: f32 = 0.001;

    fn gate(clock: ManualClock) -> SpeechGate {
        SpeechGate::new(SpeechGateConfig::default(), Box::new(clock))
    }

    #[test]
    fn two_loud_frames_do_not_start_speech() {
        let mut g = gate(ManualClock::new());
        assert!(g.process(LOUD).is_empty());
        assert!(g.process(LOUD).is_empty());
        // Dropping back below threshold resets the run
        assert!(g.process(QUIET).is_empty());
        assert!(!g.snapshot().is_speaking);
    }

    #[test]
    fn three_loud_frames_start_speech_exactly_once() {
        let mut g = gate(ManualClock::new());
        assert!(g.process(LOUD).is_empty());
        assert!(g.process(LOUD).is_empty());
        assert_eq!(g.process(LOUD), vec![GateEvent::SpeechStart]);
        // Staying above threshold must not re-fire
        for _ in 0..20 {
            assert!(g.process(LOUD).is_empty());
        }
    }

    #[test]
    fn speech_end_requires_full_silence_debounce() {
        let mut g = gate(ManualClock::new());
        for _ in 0..3 {
            g.process(LOUD);
        }
        for _ in 0..9 {
            assert!(g.process(QUIET).is_empty());
        }
        assert_eq!(g.process(QUIET), vec![GateEvent::SpeechEnd]);
        assert!(!g.snapshot().is_speaking);
    }

    #[test]
    fn silence_timeout_fires_exactly_once_after_arming() {
        let clock = ManualClock::new();
        let mut g = gate(clock.clone());

        // Scenario: 3 loud frames → start; 12 quiet frames → end at the
        // 10th; then 1.8 s of nothing → one timeout.
        for _ in 0..3 {
            g.process(LOUD);
        }
        let mut end_events = Vec::new();
        for _ in 0..12 {
            end_events.extend(g.process(QUIET));
        }
        assert_eq!(end_events, vec![GateEvent::SpeechEnd]);

        clock.advance(Duration::from_millis(1_800));
        assert_eq!(g.poll_silence_timeout(), Some(GateEvent::SilenceTimeout));
        assert_eq!(g.poll_silence_timeout(), None);
    }

    #[test]
    fn qualifying_speech_cancels_pending_timeout() {
        let clock = ManualClock::new();
        let mut g = gate(clock.clone());

        for _ in 0..3 {
            g.process(LOUD);
        }
        for _ in 0..10 {
            g.process(QUIET);
        }

        // Resume speaking before the timer elapses
        clock.advance(Duration::from_millis(500));
        for _ in 0..3 {
            g.process(LOUD);
        }

        // The original arming must never fire
        clock.advance(Duration::from_secs(10));
        assert_eq!(g.poll_silence_timeout(), None);
    }

    #[test]
    fn sub_debounce_speech_does_not_cancel_timeout() {
        let clock = ManualClock::new();
        let mut g = gate(clock.clone());

        for _ in 0..3 {
            g.process(LOUD);
        }
        for _ in 0..10 {
            g.process(QUIET);
        }

        // A 2-frame blip is below the start debounce — not qualifying
        g.process(LOUD);
        g.process(LOUD);
        g.process(QUIET);

        clock.advance(Duration::from_millis(1_800));
        assert_eq!(g.poll_silence_timeout(), Some(GateEvent::SilenceTimeout));
    }

    #[test]
    fn reset_is_safe_from_any_state_and_repeatable() {
        let clock = ManualClock::new();
        let mut g = gate(clock.clone());
        for _ in 0..3 {
            g.process(LOUD);
        }
        for _ in 0..10 {
            g.process(QUIET);
        }
        g.reset();
        g.reset();
        clock.advance(Duration::from_secs(5));
        assert_eq!(g.poll_silence_timeout(), None);
        assert_eq!(g.snapshot().consecutive_silence_frames, 0);
    }
}
