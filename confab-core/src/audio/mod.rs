//! Microphone capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a lock, or perform I/O. The callback
//! here mixes down to mono into a reused scratch buffer and writes through
//! an SPSC ring producer whose `push_slice` is lock-free.
//!
//! Echo cancellation / noise suppression / auto gain are platform capture
//! properties; cpal exposes no per-stream toggles for them, so they apply
//! whenever the OS input path provides them.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). `MicCapture` must be created and dropped on the same thread;
//! the call pipeline does this inside `tokio::task::spawn_blocking`.

pub mod device;
pub mod output;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, StreamConfig,
};

use crate::{
    buffering::{Producer, SampleProducer},
    error::{ConfabError, Result},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{info, warn};

/// Handle to an active microphone stream.
///
/// **Not `Send`** — bound to its creation thread. See the module docs.
pub struct MicCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

/// Average interleaved frames down to one mono channel.
#[cfg(feature = "audio-cpal")]
fn mix_to_mono<T: Copy>(
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> f32,
    mono: &mut Vec<f32>,
) {
    let frames = data.len() / channels;
    mono.resize(frames, 0.0);
    for (f, slot) in mono.iter_mut().enumerate() {
        let base = f * channels;
        let mut sum = 0f32;
        for c in 0..channels {
            sum += convert(data[base + c]);
        }
        *slot = sum / channels as f32;
    }
}

impl MicCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device, then the first available one.
    ///
    /// # Errors
    /// `ConfabError::NoDefaultInputDevice` when no microphone exists, or
    /// `ConfabError::AudioDevice` / `AudioStream` on open failure. Callers
    /// must surface this to the user — there is no silent retry loop.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        mut producer: SampleProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });
                    if selected_device.is_none() {
                        warn!(
                            "preferred input device '{}' not found, falling back",
                            preferred_name
                        );
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| ConfabError::AudioDevice(e.to_string()))?;
            let fallback = devices.next().ok_or(ConfabError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ConfabError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ch = channels as usize;
        let err_fn = |err| tracing::error!("capture stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let running_cb = Arc::clone(&running);
                let mut mono = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_cb.load(Ordering::Relaxed) {
                            return;
                        }
                        mix_to_mono(data, ch, |s| s, &mut mono);
                        let written = producer.push_slice(&mono);
                        if written < mono.len() {
                            warn!(
                                "capture ring full: dropped {} frames",
                                mono.len() - written
                            );
                        }
                    },
                    err_fn,
                    None,
                )
            }

            SampleFormat::I16 => {
                let running_cb = Arc::clone(&running);
                let mut mono = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_cb.load(Ordering::Relaxed) {
                            return;
                        }
                        mix_to_mono(data, ch, |s| s as f32 / 32768.0, &mut mono);
                        let written = producer.push_slice(&mono);
                        if written < mono.len() {
                            warn!(
                                "capture ring full: dropped {} frames",
                                mono.len() - written
                            );
                        }
                    },
                    err_fn,
                    None,
                )
            }

            SampleFormat::U8 => {
                let running_cb = Arc::clone(&running);
                let mut mono = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !running_cb.load(Ordering::Relaxed) {
                            return;
                        }
                        mix_to_mono(data, ch, |s| (s as f32 - 128.0) / 128.0, &mut mono);
                        let written = producer.push_slice(&mono);
                        if written < mono.len() {
                            warn!(
                                "capture ring full: dropped {} frames",
                                mono.len() - written
                            );
                        }
                    },
                    err_fn,
                    None,
                )
            }

            fmt => {
                return Err(ConfabError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ConfabError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ConfabError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Open the system default microphone.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(producer: SampleProducer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(producer, running, None)
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl MicCapture {
    pub fn open_with_preference(
        _producer: SampleProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(ConfabError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(producer: SampleProducer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(producer, running, None)
    }
}
