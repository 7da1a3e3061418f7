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

use serde::Serialize;

use super::Modulation;

/// How a preset is tuned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PresetTuning {
    /// A band scanned in fixed steps.
    Band {
        start: &'static str,
        end: &'static str,
        step: &'static str,
    },
    /// A fixed set of channels.
    Channels { frequencies: &'static [&'static str] },
    /// A single frequency.
    Single { frequency: &'static str },
}

/// A named frequency or band with its usual demodulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrequencyPreset {
    pub name: &'static str,
    #[serde(flatten)]
    pub tuning: PresetTuning,
    pub mode: Modulation,
}

impl FrequencyPreset {
    /// Frequency to tune when the preset is selected.
    #[must_use]
    pub fn tune_frequency(&self) -> &'static str {
        match self.tuning {
            PresetTuning::Band { start, .. } => start,
            PresetTuning::Channels { frequencies } => frequencies.first().copied().unwrap_or(""),
            PresetTuning::Single { frequency } => frequency,
        }
    }
}

const fn band(
    name: &'static str,
    start: &'static str,
    end: &'static str,
    step: &'static str,
    mode: Modulation,
) -> FrequencyPreset {
    FrequencyPreset {
        name,
        tuning: PresetTuning::Band { start, end, step },
        mode,
    }
}

const fn single(name: &'static str, frequency: &'static str, mode: Modulation) -> FrequencyPreset {
    FrequencyPreset {
        name,
        tuning: PresetTuning::Single { frequency },
        mode,
    }
}

pub static FREQUENCY_PRESETS: &[FrequencyPreset] = &[
    band("FM Broadcast Band", "87.5M", "108M", "100k", Modulation::WideFm),
    band("Air Band", "118M", "137M", "25k", Modulation::Am),
    FrequencyPreset {
        name: "Weather Radio (US)",
        tuning: PresetTuning::Channels {
            frequencies: &[
                "162.400M", "162.425M", "162.450M", "162.475M", "162.500M", "162.525M", "162.550M",
            ],
        },
        mode: Modulation::NarrowFm,
    },
    band("Marine VHF", "156M", "162M", "25k", Modulation::NarrowFm),
    band("2m Amateur", "144M", "148M", "5k", Modulation::NarrowFm),
    band("70cm Amateur", "420M", "450M", "25k", Modulation::NarrowFm),
    single("433 MHz ISM", "433.92M", Modulation::Am),
    single("315 MHz (US)", "315M", Modulation::Am),
    single("868 MHz (EU)", "868M", Modulation::Am),
    single("915 MHz (US)", "915M", Modulation::Am),
    single("FRS/GMRS Ch1", "462.5625M", Modulation::NarrowFm),
    single("FRS/GMRS Ch8", "467.5625M", Modulation::NarrowFm),
    single("PMR446 Ch1", "446.00625M", Modulation::NarrowFm),
];

/// Description of a demodulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModulationInfo {
    pub id: Modulation,
    pub name: &'static str,
    pub description: &'static str,
}

pub static MODULATIONS: &[ModulationInfo] = &[
    ModulationInfo {
        id: Modulation::WideFm,
        name: "Wideband FM",
        description: "FM broadcast radio (87.5-108 MHz)",
    },
    ModulationInfo {
        id: Modulation::NarrowFm,
        name: "Narrow FM",
        description: "Two-way radio, amateur, FRS/GMRS",
    },
    ModulationInfo {
        id: Modulation::Am,
        name: "AM",
        description: "Aircraft, CB radio, shortwave",
    },
    ModulationInfo {
        id: Modulation::Usb,
        name: "Upper Sideband",
        description: "Amateur radio SSB",
    },
    ModulationInfo {
        id: Modulation::Lsb,
        name: "Lower Sideband",
        description: "Amateur radio SSB",
    },
    ModulationInfo {
        id: Modulation::Raw,
        name: "Raw I/Q",
        description: "Unprocessed samples",
    },
];
