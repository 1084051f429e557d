//! Plain RMS energy estimator.
//!
//! Used where the FFT-based band estimator is unnecessary (tests, very
//! constrained hosts). RMS of a full-scale signal maps directly to the
//! `[0, 1]` level scale the gate expects.

use super::EnergyEstimator;
use crate::buffering::chunk::AudioFrame;

/// A simple RMS-based energy estimator.
#[derive(Debug, Clone, Default)]
pub struct RmsEnergy;

impl RmsEnergy {
    pub fn new() -> Self {
        Self
    }

    /// Compute the root-mean-square of a sample slice.
    pub(crate) fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl EnergyEstimator for RmsEnergy {
    fn level(&mut self, frame: &AudioFrame) -> f32 {
        Self::rms(&frame.samples).clamp(0.0, 1.0)
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_is_zero() {
        let mut est = RmsEnergy::new();
        let frame = AudioFrame::new(vec![], 16000);
        assert_eq!(est.level(&frame), 0.0);
    }

    #[test]
    fn rms_of_square_wave() {
        // A square wave at ±0.5 should have RMS = 0.5
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let rms = RmsEnergy::rms(&samples);
        assert!((rms - 0.5).abs() < 1e-5, "rms={rms}");
    }

    #[test]
    fn level_is_clamped() {
        let mut est = RmsEnergy::new();
        // Out-of-range input (shouldn't happen, but the gate wants [0, 1])
        let frame = AudioFrame::new(vec![2.0; 64], 16000);
        assert_eq!(est.level(&frame), 1.0);
    }
}
