//! Voice activity detection.
//!
//! Split into two layers:
//!
//! - [`EnergyEstimator`] turns a frame of samples into a normalized energy
//!   level in `[0, 1]`. The default [`band::BandEnergy`] restricts the
//!   measurement to the voice band; [`energy::RmsEnergy`] is a plain RMS
//!   fallback for callers that want to skip the FFT.
//! - [`gate::SpeechGate`] consumes one level per frame and applies the
//!   hysteresis / debounce / silence-timeout policy, emitting discrete
//!   [`gate::GateEvent`]s.
//!
//! The estimator trait is the extensibility point: swap in a neural VAD
//! without touching the gate or the pipeline.

pub mod band;
pub mod energy;
pub mod gate;

pub use band::BandEnergy;
pub use energy::RmsEnergy;
pub use gate::{GateEvent, ManualClock, MonotonicClock, SpeechGate, SpeechGateConfig, VadSnapshot};

use crate::buffering::chunk::AudioFrame;

/// Trait for all per-frame energy estimators.
///
/// Implementors may be stateful (FFT scratch buffers, smoothing state).
pub trait EnergyEstimator: Send + 'static {
    /// Analyse a frame and return a normalized energy level in `[0, 1]`.
    ///
    /// The frame's `sample_rate` should match whatever rate this estimator
    /// was configured for. Resampling is the caller's responsibility.
    fn level(&mut self, frame: &AudioFrame) -> f32;

    /// Reset any internal state.
    fn reset(&mut self);
}
