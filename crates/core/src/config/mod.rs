use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{EchoError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tone: ToneConfig,
    pub fps: FpsConfig,
    pub preview: PreviewConfig,
}

impl AppConfig {
    /// Loads a JSON configuration file. Missing sections and fields fall back
    /// to their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rejects values that would make tone synthesis or fps accounting
    /// degenerate.
    pub fn validate(&self) -> Result<()> {
        self.tone.validate()?;
        if self.fps.window == 0 {
            return Err(EchoError::InvalidInput("fps window must be at least one frame"));
        }
        if self.preview.width == 0 || self.preview.height == 0 {
            return Err(EchoError::InvalidInput("preview size must be non-zero"));
        }
        if self.preview.frame_rate == 0 {
            return Err(EchoError::InvalidInput("preview frame rate must be non-zero"));
        }
        Ok(())
    }
}

/// Shape of the periodic signal used for the feedback tone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    #[default]
    Sine,
    /// Tangent of the phase, clipped to the amplitude range.
    Tangent,
}

/// Longest tone accepted, in samples (about 28 minutes at 10 kHz).
pub const MAX_TONE_SAMPLES: usize = 1 << 24;

/// Configuration of the tone synthesiser and the audio output it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub sample_rate_hz: u32,
    pub duration_seconds: f64,
    /// Lowest frequency ever synthesised, whatever the distance.
    pub floor_hz: f64,
    /// Peak amplitude in `(0, 1]` before 16-bit quantisation.
    pub amplitude: f64,
    pub waveform: Waveform,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10_000,
            duration_seconds: 2.0,
            floor_hz: 100.0,
            amplitude: 1.0,
            waveform: Waveform::Sine,
        }
    }
}

impl ToneConfig {
    /// Number of samples in one generated tone.
    pub fn num_samples(&self) -> usize {
        (self.duration_seconds * f64::from(self.sample_rate_hz)).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(EchoError::InvalidInput("tone sample rate must be non-zero"));
        }
        if !(self.duration_seconds > 0.0 && self.duration_seconds.is_finite()) {
            return Err(EchoError::InvalidInput("tone duration must be positive and finite"));
        }
        let samples = self.duration_seconds * f64::from(self.sample_rate_hz);
        if samples.round() > MAX_TONE_SAMPLES as f64 {
            return Err(EchoError::InvalidInput("tone is longer than the sample limit"));
        }
        if !(self.floor_hz > 0.0 && self.floor_hz.is_finite()) {
            return Err(EchoError::InvalidInput("tone floor must be positive"));
        }
        if !(self.amplitude > 0.0 && self.amplitude <= 1.0) {
            return Err(EchoError::InvalidInput("tone amplitude must be within (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FpsConfig {
    /// Number of frames per measurement window.
    pub window: u32,
}

impl Default for FpsConfig {
    fn default() -> Self {
        Self { window: 20 }
    }
}

/// Requested camera preview geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_synthesiser() {
        let config = AppConfig::default();
        assert_eq!(config.tone.sample_rate_hz, 10_000);
        assert_eq!(config.tone.num_samples(), 20_000);
        assert_eq!(config.tone.floor_hz, 100.0);
        assert_eq!(config.fps.window, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "tone": { "floor_hz": 220.0, "waveform": "tangent" } }"#)
                .unwrap();

        assert_eq!(config.tone.floor_hz, 220.0);
        assert_eq!(config.tone.waveform, Waveform::Tangent);
        assert_eq!(config.tone.sample_rate_hz, 10_000);
        assert_eq!(config.preview, PreviewConfig::default());
    }

    #[test]
    fn rejects_degenerate_values() {
        let mut config = AppConfig::default();
        config.tone.amplitude = 1.5;
        assert!(matches!(config.validate(), Err(EchoError::InvalidInput(_))));

        let mut config = AppConfig::default();
        config.fps.window = 0;
        assert!(config.validate().is_err());

        for duration_seconds in [1e300, f64::INFINITY, f64::NAN] {
            let tone = ToneConfig {
                duration_seconds,
                ..ToneConfig::default()
            };
            assert!(matches!(tone.validate(), Err(EchoError::InvalidInput(_))));
        }

        let too_long = ToneConfig {
            sample_rate_hz: 48_000,
            duration_seconds: (MAX_TONE_SAMPLES as f64 + 48_000.0) / 48_000.0,
            ..ToneConfig::default()
        };
        assert!(too_long.validate().is_err());

        let longest = ToneConfig {
            sample_rate_hz: 1_000,
            duration_seconds: MAX_TONE_SAMPLES as f64 / 1_000.0,
            ..ToneConfig::default()
        };
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn loads_from_disk() {
        let path = std::env::temp_dir().join(format!("echosight-config-{}.json", std::process::id()));
        let mut config = AppConfig::default();
        config.preview.width = 320;
        std::fs::write(&path, config.to_json_pretty().unwrap()).unwrap();

        let loaded = AppConfig::from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
