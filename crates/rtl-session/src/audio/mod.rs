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

//! Demodulated audio sessions driven by `rtl_fm`.
//!
//! The audio stream is raw little-endian signed 16-bit mono PCM at
//! [`OUTPUT_SAMPLE_RATE`].

mod presets;

pub use presets::{FrequencyPreset, ModulationInfo, PresetTuning, FREQUENCY_PRESETS, MODULATIONS};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frequency::parse_frequency;

/// PCM output rate in Hz.
pub const OUTPUT_SAMPLE_RATE: u32 = 48_000;
/// PCM channel count.
pub const PCM_CHANNELS: u16 = 1;
/// PCM bits per sample.
pub const PCM_BITS_PER_SAMPLE: u16 = 16;

/// Demodulation mode passed to `rtl_fm -M`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    /// Broadcast FM.
    #[default]
    #[serde(rename = "wbfm")]
    WideFm,
    #[serde(rename = "fm")]
    NarrowFm,
    #[serde(rename = "am")]
    Am,
    #[serde(rename = "usb")]
    Usb,
    #[serde(rename = "lsb")]
    Lsb,
    #[serde(rename = "raw")]
    Raw,
}

impl Modulation {
    pub const ALL: [Self; 6] = [
        Self::WideFm,
        Self::NarrowFm,
        Self::Am,
        Self::Usb,
        Self::Lsb,
        Self::Raw,
    ];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::WideFm => "wbfm",
            Self::NarrowFm => "fm",
            Self::Am => "am",
            Self::Usb => "usb",
            Self::Lsb => "lsb",
            Self::Raw => "raw",
        }
    }

    /// Look up a mode by id, falling back to narrow FM for unknown ids.
    #[must_use]
    pub fn from_id(id: &str) -> Self {
        let id = id.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.id().eq_ignore_ascii_case(id))
            .unwrap_or(Self::NarrowFm)
    }

    /// `rtl_fm` input sample rate suited to this mode.
    #[must_use]
    pub fn default_sample_rate(self) -> u32 {
        match self {
            Self::WideFm => 200_000,
            _ => 48_000,
        }
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Settings for one audio session. Changing any of them means a new process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Frequency in suffix notation, e.g. `101.5M`.
    pub frequency: String,
    pub modulation: Modulation,
    /// `rtl_fm` input sample rate in Hz.
    pub sample_rate: u32,
    /// PCM output rate in Hz.
    pub output_rate: u32,
    pub gain: i32,
    /// Squelch level; 0 disables it.
    pub squelch: u32,
    /// Frequency correction in ppm.
    pub ppm: i32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::new("101.5M", Modulation::WideFm)
    }
}

impl AudioConfig {
    /// Config with the input rate chosen for `modulation` and default gain.
    #[must_use]
    pub fn new(frequency: impl Into<String>, modulation: Modulation) -> Self {
        Self {
            frequency: frequency.into(),
            modulation,
            sample_rate: modulation.default_sample_rate(),
            output_rate: OUTPUT_SAMPLE_RATE,
            gain: 40,
            squelch: 0,
            ppm: 0,
        }
    }

    /// Same settings on another frequency, optionally with another mode.
    #[must_use]
    pub fn retuned(&self, frequency: impl Into<String>, modulation: Option<Modulation>) -> Self {
        Self {
            frequency: frequency.into(),
            modulation: modulation.unwrap_or(self.modulation),
            ..self.clone()
        }
    }

    pub fn frequency_hz(&self) -> Result<u64> {
        parse_frequency(&self.frequency)
    }

    /// `rtl_fm` arguments writing raw PCM to stdout.
    pub fn command_args(&self) -> Result<Vec<String>> {
        let mut args = vec![
            "-f".to_string(),
            self.frequency_hz()?.to_string(),
            "-M".to_string(),
            self.modulation.id().to_string(),
            "-s".to_string(),
            self.sample_rate.to_string(),
            "-r".to_string(),
            self.output_rate.to_string(),
            "-g".to_string(),
            self.gain.to_string(),
        ];

        if self.squelch > 0 {
            args.extend(["-l".to_string(), self.squelch.to_string()]);
        }
        if self.ppm != 0 {
            args.extend(["-p".to_string(), self.ppm.to_string()]);
        }

        args.push("-".to_string());
        Ok(args)
    }
}

/// Audio session status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioStatus {
    pub running: bool,
    /// Effective configuration while running.
    pub config: Option<AudioConfig>,
}
