// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Persistent gateway configuration.
//!
//! Stored as TOML through `confy` in the platform config directory. Every
//! field has a serde default, so older or partial files keep loading.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rtl_session::frequency::parse_frequency;
use rtl_session::{
    AudioConfig, DecoderConfig, GatewaySettings, Modulation, ProgramSpec, SpectrumConfig,
};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "rtlsdr-gateway";
const CONFIG_NAME: &str = "config";

/// Gateway configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Configuration schema version
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// rtl_433 executable
    #[serde(default = "default_rtl_433")]
    pub rtl_433_path: PathBuf,

    /// rtl_fm executable
    #[serde(default = "default_rtl_fm")]
    pub rtl_fm_path: PathBuf,

    /// rtl_sdr executable
    #[serde(default = "default_rtl_sdr")]
    pub rtl_sdr_path: PathBuf,

    /// rtl_433 config file, used instead of the decoder fields when present
    #[serde(default)]
    pub rtl_433_config_file: Option<PathBuf>,

    #[serde(default = "default_decoder_frequency")]
    pub decoder_frequency: String,

    #[serde(default = "default_decoder_sample_rate")]
    pub decoder_sample_rate: String,

    #[serde(default = "default_gain")]
    pub decoder_gain: i32,

    #[serde(default = "default_audio_frequency")]
    pub audio_frequency: String,

    /// Modulation id: wbfm, fm, am, usb, lsb or raw
    #[serde(default = "default_audio_modulation")]
    pub audio_modulation: String,

    #[serde(default = "default_gain")]
    pub audio_gain: i32,

    #[serde(default)]
    pub audio_squelch: u32,

    #[serde(default)]
    pub audio_ppm: i32,

    #[serde(default = "default_spectrum_center")]
    pub spectrum_center: String,

    #[serde(default = "default_spectrum_sample_rate")]
    pub spectrum_sample_rate: String,

    /// FFT size (256 - 4096, rounded down to a power of two)
    #[serde(default = "default_fft_size")]
    pub spectrum_fft_size: usize,

    #[serde(default = "default_gain")]
    pub spectrum_gain: i32,

    /// Raw FFTs averaged per frame
    #[serde(default = "default_averaging")]
    pub spectrum_averaging: usize,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_rtl_433() -> PathBuf {
    PathBuf::from("rtl_433")
}

fn default_rtl_fm() -> PathBuf {
    PathBuf::from("rtl_fm")
}

fn default_rtl_sdr() -> PathBuf {
    PathBuf::from("rtl_sdr")
}

fn default_decoder_frequency() -> String {
    "433.92M".to_string()
}

fn default_decoder_sample_rate() -> String {
    "1024k".to_string()
}

fn default_gain() -> i32 {
    40
}

fn default_audio_frequency() -> String {
    "101.5M".to_string()
}

fn default_audio_modulation() -> String {
    Modulation::WideFm.id().to_string()
}

fn default_spectrum_center() -> String {
    "433.92M".to_string()
}

fn default_spectrum_sample_rate() -> String {
    "2.048M".to_string()
}

fn default_fft_size() -> usize {
    1024
}

fn default_averaging() -> usize {
    4
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            rtl_433_path: default_rtl_433(),
            rtl_fm_path: default_rtl_fm(),
            rtl_sdr_path: default_rtl_sdr(),
            rtl_433_config_file: None,
            decoder_frequency: default_decoder_frequency(),
            decoder_sample_rate: default_decoder_sample_rate(),
            decoder_gain: default_gain(),
            audio_frequency: default_audio_frequency(),
            audio_modulation: default_audio_modulation(),
            audio_gain: default_gain(),
            audio_squelch: 0,
            audio_ppm: 0,
            spectrum_center: default_spectrum_center(),
            spectrum_sample_rate: default_spectrum_sample_rate(),
            spectrum_fft_size: default_fft_size(),
            spectrum_gain: default_gain(),
            spectrum_averaging: default_averaging(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from disk, creating it with defaults on first run
    pub fn load() -> Result<Self> {
        confy::load(APP_NAME, CONFIG_NAME).context("failed to load configuration")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        confy::store(APP_NAME, CONFIG_NAME, self).context("failed to save configuration")
    }

    /// Get the config file path for display to user
    pub fn config_path() -> Result<PathBuf> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
            .context("failed to resolve configuration path")
    }

    pub fn gateway_settings(&self) -> Result<GatewaySettings> {
        Ok(GatewaySettings {
            rtl_433: ProgramSpec::new(&self.rtl_433_path),
            rtl_fm: ProgramSpec::new(&self.rtl_fm_path),
            rtl_sdr: ProgramSpec::new(&self.rtl_sdr_path),
            decoder: DecoderConfig {
                frequency: self.decoder_frequency.clone(),
                sample_rate: self.decoder_sample_rate.clone(),
                gain: self.decoder_gain,
                config_file: self.rtl_433_config_file.clone(),
            },
            spectrum: self.spectrum_config()?,
            ..GatewaySettings::default()
        })
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            gain: self.audio_gain,
            squelch: self.audio_squelch,
            ppm: self.audio_ppm,
            ..AudioConfig::new(
                self.audio_frequency.clone(),
                Modulation::from_id(&self.audio_modulation),
            )
        }
    }

    pub fn spectrum_config(&self) -> Result<SpectrumConfig> {
        let sample_rate = parse_frequency(&self.spectrum_sample_rate)?;
        Ok(SpectrumConfig {
            center_freq: parse_frequency(&self.spectrum_center)?,
            sample_rate: u32::try_from(sample_rate)
                .with_context(|| format!("sample rate {sample_rate} Hz is out of range"))?,
            fft_size: self.spectrum_fft_size,
            gain: self.spectrum_gain,
            averaging: self.spectrum_averaging,
        }
        .normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library() {
        let config = GatewayConfig::default();
        let settings = config.gateway_settings().unwrap();
        assert_eq!(settings.decoder, DecoderConfig::default());
        assert_eq!(settings.spectrum, SpectrumConfig::default());
        assert_eq!(config.audio_config(), AudioConfig::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"audio_modulation": "am", "spectrum_fft_size": 3000}"#)
                .unwrap();
        assert_eq!(config.rtl_433_path, PathBuf::from("rtl_433"));
        assert_eq!(config.audio_config().modulation, Modulation::Am);
        assert_eq!(config.audio_config().sample_rate, 48_000);
        assert_eq!(config.spectrum_config().unwrap().fft_size, 2048);
    }

    #[test]
    fn test_bad_spectrum_frequency_is_reported() {
        let config = GatewayConfig {
            spectrum_center: "four hundred".to_string(),
            ..GatewayConfig::default()
        };
        assert!(config.spectrum_config().is_err());
    }
}
