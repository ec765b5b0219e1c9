//! Configuration for the player.
//!
//! Loads player defaults from a YAML file; command-line flags override
//! individual values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Player configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Frames per second of the clock driving the scheduler.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Frames per scheduler cycle.
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: u32,
    /// Substring of the MIDI output port to connect to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    /// Output byte budget in bytes per millisecond; 0 disables limiting.
    #[serde(default)]
    pub rate_limit: f64,
    /// Default intro length in bars for loop extension.
    #[serde(default = "default_intro_bars")]
    pub intro_bars: u32,
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_buffer_frames() -> u32 {
    256
}

fn default_intro_bars() -> u32 {
    2
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            buffer_frames: default_buffer_frames(),
            output_device: None,
            rate_limit: 0.0,
            intro_bars: default_intro_bars(),
        }
    }
}

impl PlayerConfig {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        PathBuf::from("bandplayer.yaml")
    }

    /// Load configuration from a YAML file; a missing file is the
    /// default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: PlayerConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config YAML: {}", e)))?;
        if config.sample_rate == 0 || config.buffer_frames == 0 {
            return Err(Error::Config(
                "sample_rate and buffer_frames must be positive".into(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let config = PlayerConfig::load("/nonexistent/bandplayer.yaml").unwrap();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.buffer_frames, 256);
        assert_eq!(config.rate_limit, 0.0);
        assert_eq!(config.intro_bars, 2);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config: PlayerConfig =
            serde_yaml::from_str("sample_rate: 44100\noutput_device: \"Synth\"\n").unwrap();
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.output_device.as_deref(), Some("Synth"));
        assert_eq!(config.buffer_frames, 256);
    }

    #[test]
    fn test_round_trip() {
        let config = PlayerConfig {
            rate_limit: 3.125,
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: PlayerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.rate_limit, 3.125);
    }
}
