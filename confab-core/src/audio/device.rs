//! Audio input device enumeration, for the host's microphone picker.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Heuristic flag for devices that likely capture system/output audio —
    /// feeding one of those back into barge-in detection guarantees the AI
    /// interrupts itself.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
    "speakers (",
    "headphones (",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// List all available audio input devices on the system, default first,
/// loopback-like devices last.
///
/// Returns an empty `Vec` if cpal is unavailable or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => {
            let mut list = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    let is_loopback_like = is_loopback_like_name(&name);
                    DeviceInfo {
                        name,
                        is_default,
                        is_loopback_like,
                    }
                })
                .collect::<Vec<_>>();

            list.sort_by_key(|d| {
                (
                    d.is_loopback_like,
                    !d.is_default,
                    d.name.to_ascii_lowercase(),
                )
            });
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            match host.default_input_device() {
                Some(default) => {
                    let name = default
                        .name()
                        .unwrap_or_else(|_| "Default Input Device".to_string());
                    let is_loopback_like = is_loopback_like_name(&name);
                    vec![DeviceInfo {
                        name,
                        is_default: true,
                        is_loopback_like,
                    }]
                }
                None => vec![],
            }
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::is_loopback_like_name;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(is_loopback_like_name("Speakers (High Definition Audio Device)"));
    }

    #[test]
    fn plain_microphones_are_not_loopback() {
        assert!(!is_loopback_like_name("Microphone Array (USB PnP Audio Device)"));
        assert!(!is_loopback_like_name("Headset Microphone"));
    }
}
