//! Playback device abstraction.
//!
//! [`AudioOutput`] is what the streaming player schedules against: a device
//! clock plus a "start these samples at time T" primitive. The production
//! implementation, [`CpalAudioOutput`], writes through an SPSC ring into a
//! cpal output stream; tests substitute a scripted output with a manual
//! clock.
//!
//! ## Clock model
//!
//! The output callback counts every frame it renders (audio or silence)
//! into an atomic; `current_time()` is that count divided by the device
//! rate, i.e. a monotonic clock that keeps running while the ring is
//! empty — the same shape as a hardware output context's `currentTime`.
//!
//! ## Threading
//!
//! As with capture, `cpal::Stream` is `!Send`; [`PlaybackStream`] must be
//! created and dropped on the same thread. The scheduler side holds only
//! the Send-safe [`CpalAudioOutput`] handle.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tracing::warn;

use crate::{
    audio::resample::RateConverter,
    buffering::{Producer, SampleProducer},
    error::Result,
};

/// Scheduling seam between [`crate::playback::StreamingAudioPlayer`] and a
/// real or scripted output device.
pub trait AudioOutput: Send + 'static {
    /// Current device-clock time in seconds.
    fn current_time(&self) -> f64;

    /// Queue `samples` (mono, at the player's rate) to start at `start_at`
    /// device-clock seconds. `start_at` in the past means "as soon as
    /// possible".
    fn schedule(&mut self, samples: &[f32], start_at: f64);

    /// Discard everything queued but not yet rendered.
    fn reset(&mut self);
}

/// Shared clock + control flags between the output callback and the
/// scheduler handle.
pub struct OutputClock {
    frames_played: AtomicU64,
    sample_rate: u32,
    discard: AtomicBool,
}

impl OutputClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames_played: AtomicU64::new(0),
            sample_rate,
            discard: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Acquire)
    }

    pub fn seconds(&self) -> f64 {
        self.frames_played() as f64 / self.sample_rate as f64
    }

    /// Called by the output callback after rendering `frames` frames.
    pub fn add_frames(&self, frames: u64) {
        self.frames_played.fetch_add(frames, Ordering::AcqRel);
    }

    /// Ask the callback to drop all queued samples before its next render.
    pub fn request_discard(&self) {
        self.discard.store(true, Ordering::Release);
    }

    /// Consumed by the callback; returns true at most once per request.
    pub fn take_discard(&self) -> bool {
        self.discard.swap(false, Ordering::AcqRel)
    }
}

/// Send-safe scheduler handle over the playback ring.
pub struct CpalAudioOutput {
    producer: SampleProducer,
    clock: Arc<OutputClock>,
    /// Converts from the server's audio rate to the device rate.
    converter: RateConverter,
    /// End of queued audio, in device frames.
    queued_end_frames: u64,
}

impl CpalAudioOutput {
    /// `source_rate` is the rate of the samples handed to `schedule`
    /// (the server contract rate); the device rate comes from the clock.
    pub fn new(
        producer: SampleProducer,
        clock: Arc<OutputClock>,
        source_rate: u32,
    ) -> Result<Self> {
        let converter = RateConverter::new(source_rate, clock.sample_rate(), 480)?;
        Ok(Self {
            producer,
            clock,
            converter,
            queued_end_frames: 0,
        })
    }

    fn push_silence(&mut self, mut frames: usize) -> usize {
        let zeros = [0f32; 512];
        let mut written = 0;
        while frames > 0 {
            let n = self.producer.push_slice(&zeros[..frames.min(zeros.len())]);
            if n == 0 {
                break;
            }
            written += n;
            frames -= n;
        }
        written
    }
}

impl AudioOutput for CpalAudioOutput {
    fn current_time(&self) -> f64 {
        self.clock.seconds()
    }

    fn schedule(&mut self, samples: &[f32], start_at: f64) {
        let device_rate = self.clock.sample_rate() as f64;
        let start_frame = (start_at * device_rate).round().max(0.0) as u64;
        let queue_from = self.queued_end_frames.max(self.clock.frames_played());

        // A start time past the end of queued audio means a gap in the
        // schedule — rendered as silence so the clock math stays exact.
        let mut end = queue_from;
        if start_frame > queue_from {
            let gap = (start_frame - queue_from) as usize;
            end += self.push_silence(gap) as u64;
        }

        let device_samples = self.converter.process(samples);
        let written = self.producer.push_slice(&device_samples);
        if written < device_samples.len() {
            warn!(
                dropped = device_samples.len() - written,
                "playback ring full: dropped frames"
            );
        }
        self.queued_end_frames = end + written as u64;
    }

    fn reset(&mut self) {
        self.clock.request_discard();
        self.queued_end_frames = self.clock.frames_played();
    }
}

/// Handle to an active output stream.
///
/// **Not `Send`** — create and drop on the same OS thread, inside the
/// playback blocking task.
#[cfg(feature = "audio-cpal")]
pub struct PlaybackStream {
    /// Kept alive so the stream is not dropped prematurely.
    _stream: cpal::Stream,
    /// Actual output sample rate reported by the device (Hz).
    pub sample_rate: u32,
    /// Clock shared with the scheduler handle.
    pub clock: Arc<OutputClock>,
}

#[cfg(feature = "audio-cpal")]
impl PlaybackStream {
    /// Open the system default output device, rendering mono samples from
    /// `consumer` to every channel.
    pub fn open_default(
        mut consumer: crate::buffering::SampleConsumer,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
        use cpal::{SampleFormat, SampleRate, StreamConfig};

        use crate::buffering::Consumer as _;
        use crate::error::ConfabError;

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(ConfabError::NoDefaultOutputDevice)?;

        tracing::info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| ConfabError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;

        tracing::info!(sample_rate, channels, "output config selected");

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let clock = Arc::new(OutputClock::new(sample_rate));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let clock_cb = Arc::clone(&clock);
                let running_cb = Arc::clone(&running);
                let mut mono_buf: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _info| {
                        let frames = data.len() / channels;
                        if !running_cb.load(Ordering::Relaxed) {
                            data.fill(0.0);
                            clock_cb.add_frames(frames as u64);
                            return;
                        }
                        if clock_cb.take_discard() {
                            drain_all(&mut consumer, &mut mono_buf);
                        }
                        mono_buf.resize(frames, 0.0);
                        let got = consumer.pop_slice(&mut mono_buf[..frames]);
                        for f in 0..frames {
                            let sample = if f < got { mono_buf[f] } else { 0.0 };
                            let base = f * channels;
                            for c in 0..channels {
                                data[base + c] = sample;
                            }
                        }
                        clock_cb.add_frames(frames as u64);
                    },
                    |err| tracing::error!("output stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let clock_cb = Arc::clone(&clock);
                let running_cb = Arc::clone(&running);
                let mut mono_buf: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _info| {
                        let frames = data.len() / channels;
                        if !running_cb.load(Ordering::Relaxed) {
                            data.fill(0);
                            clock_cb.add_frames(frames as u64);
                            return;
                        }
                        if clock_cb.take_discard() {
                            drain_all(&mut consumer, &mut mono_buf);
                        }
                        mono_buf.resize(frames, 0.0);
                        let got = consumer.pop_slice(&mut mono_buf[..frames]);
                        for f in 0..frames {
                            let sample = if f < got { mono_buf[f] } else { 0.0 };
                            let base = f * channels;
                            let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                            for c in 0..channels {
                                data[base + c] = value;
                            }
                        }
                        clock_cb.add_frames(frames as u64);
                    },
                    |err| tracing::error!("output stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(ConfabError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ConfabError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ConfabError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
            clock,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn drain_all(consumer: &mut crate::buffering::SampleConsumer, scratch: &mut Vec<f32>) {
    use crate::buffering::Consumer as _;
    scratch.resize(512, 0.0);
    while consumer.pop_slice(&mut scratch[..]) > 0 {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_playback_ring, Consumer as _};

    #[test]
    fn schedule_fills_gaps_with_silence() {
        let (producer, mut consumer) = create_playback_ring();
        // Passthrough rates so the frame math is exact.
        let clock = Arc::new(OutputClock::new(24_000));
        let mut out = CpalAudioOutput::new(producer, Arc::clone(&clock), 24_000).unwrap();

        // Schedule 100 samples half a second into the future.
        out.schedule(&[0.25; 100], 0.5);

        let mut drained = vec![0f32; 16_384];
        let n = consumer.pop_slice(&mut drained);
        assert_eq!(n, 12_000 + 100);
        assert!(drained[..12_000].iter().all(|s| *s == 0.0));
        assert!(drained[12_000..12_100].iter().all(|s| *s == 0.25));
    }

    #[test]
    fn back_to_back_schedules_are_contiguous() {
        let (producer, mut consumer) = create_playback_ring();
        let clock = Arc::new(OutputClock::new(24_000));
        let mut out = CpalAudioOutput::new(producer, Arc::clone(&clock), 24_000).unwrap();

        out.schedule(&[0.1; 1_200], 0.0);
        // Cursor-style scheduling: second window starts where the first ends.
        out.schedule(&[0.2; 1_200], 0.05);

        let mut drained = vec![0f32; 4_096];
        let n = consumer.pop_slice(&mut drained);
        assert_eq!(n, 2_400);
        assert!(drained[..1_200].iter().all(|s| (*s - 0.1).abs() < 1e-6));
        assert!(drained[1_200..2_400].iter().all(|s| (*s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn reset_requests_discard_and_rebases_queue() {
        let (producer, _consumer) = create_playback_ring();
        let clock = Arc::new(OutputClock::new(24_000));
        let mut out = CpalAudioOutput::new(producer, Arc::clone(&clock), 24_000).unwrap();

        out.schedule(&[0.1; 2_400], 0.0);
        out.reset();
        assert!(clock.take_discard());
        // A second take observes nothing new
        assert!(!clock.take_discard());
    }

    #[test]
    fn clock_advances_with_rendered_frames() {
        let clock = OutputClock::new(48_000);
        assert_eq!(clock.seconds(), 0.0);
        clock.add_frames(24_000);
        assert!((clock.seconds() - 0.5).abs() < 1e-9);
    }
}
