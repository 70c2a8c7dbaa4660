use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BeatSyncError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub osc: OscConfig,
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing sections fall back to their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the JSON configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(BeatSyncError::invalid("sample rate must be positive"));
        }
        if self.audio.buffer_size == 0 {
            return Err(BeatSyncError::invalid("buffer size must be positive"));
        }
        if self.sync.beat_divider == 0 {
            return Err(BeatSyncError::invalid("beat divider must be positive"));
        }
        for address in [&self.osc.bpm_address, &self.osc.resync_address] {
            if !address.starts_with('/') {
                return Err(BeatSyncError::invalid(format!(
                    "OSC address `{address}` must start with `/`"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub buffer_size: usize,
    /// Index into the host's input device list. `None` picks the default input.
    pub device_index: Option<usize>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            buffer_size: 128,
            device_index: None,
        }
    }
}

/// Destination and parameter addresses for the OSC controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub host: String,
    pub port: u16,
    pub bpm_address: String,
    pub resync_address: String,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7000,
            bpm_address: "/composition/tempocontroller/tempo".to_string(),
            resync_address: "/composition/tempocontroller/resync".to_string(),
        }
    }
}

/// Initial values for the controls the UI may change while running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub beat_divider: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            beat_divider: 1,
        }
    }
}
