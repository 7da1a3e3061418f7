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

//! Frequency strings in suffix notation.
//!
//! The control surface accepts values like `433.92M`, `1024k` or `1.09G`;
//! the external tools are always handed plain integer Hz.

use crate::error::{Result, SessionError};

const MULTIPLIERS: [(char, f64); 3] = [('K', 1e3), ('M', 1e6), ('G', 1e9)];

/// Parse a frequency string (`K`/`M`/`G` suffix, case-insensitive) to Hz.
///
/// The value is rounded to the nearest Hz, so `433.92M` yields exactly
/// 433 920 000 despite binary floating point.
pub fn parse_frequency(input: &str) -> Result<u64> {
    let trimmed = input.trim().to_ascii_uppercase();
    let invalid = || SessionError::InvalidFrequency(input.to_string());

    let (number, multiplier) = MULTIPLIERS
        .iter()
        .find_map(|&(suffix, mult)| trimmed.strip_suffix(suffix).map(|n| (n, mult)))
        .unwrap_or((trimmed.as_str(), 1.0));

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    let hz = (value * multiplier).round();
    if !hz.is_finite() || hz < 0.0 || hz > u64::MAX as f64 {
        return Err(invalid());
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "range checked above"
    )]
    Ok(hz as u64)
}
