//! Persistent client settings (JSON file in the platform data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the voice-chat server.
    pub server_url: String,
    /// Microphone to prefer; falls back to the system default.
    pub preferred_input_device: Option<String>,
    /// VAD speaking threshold (normalized level).
    pub speaking_threshold: f32,
    /// Consecutive speaking frames before speech is confirmed.
    pub speech_start_frames: u32,
    /// Consecutive silent frames before speech end is confirmed.
    pub speech_end_frames: u32,
    /// Silence after speech end before the utterance is sent (ms).
    pub silence_timeout_ms: u64,
    /// Hard cap on one recording (seconds).
    pub max_recording_secs: u64,
    /// Bounded dialog history capacity.
    pub turn_history: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            preferred_input_device: None,
            speaking_threshold: 0.015,
            speech_start_frames: 3,
            speech_end_frames: 10,
            silence_timeout_ms: 1_800,
            max_recording_secs: 30,
            turn_history: 5,
        }
    }
}

impl ClientSettings {
    pub fn normalize(&mut self) {
        self.server_url = self.server_url.trim().trim_end_matches('/').to_string();
        if self.server_url.is_empty() {
            self.server_url = ClientSettings::default().server_url;
        }
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.speaking_threshold = self.speaking_threshold.clamp(0.001, 0.5);
        self.speech_start_frames = self.speech_start_frames.clamp(1, 50);
        self.speech_end_frames = self.speech_end_frames.clamp(1, 100);
        self.silence_timeout_ms = self.silence_timeout_ms.clamp(300, 10_000);
        self.max_recording_secs = self.max_recording_secs.clamp(5, 120);
        self.turn_history = self.turn_history.clamp(1, 50);
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Overtone Labs")
            .join("Confab")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("confab")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> ClientSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ClientSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &ClientSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
