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

//! Numeric core of the spectrum engine.

use std::fmt;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::SpectrumFrame;

/// Offset added to magnitudes so silent bins stay finite in dB.
const MAGNITUDE_EPSILON: f32 = 1e-10;

/// Downsampled frames carry at most this many points.
const MAX_FRAME_POINTS: usize = 256;

/// Symmetric Hann window, `0.5 - 0.5 cos(2πn / (len - 1))`.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "window lengths are at most 4096")]
pub fn hann_window(len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![1.0; len];
    }
    let denom = (len - 1) as f64;
    (0..len)
        .map(|n| (0.5 - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / denom).cos()) as f32)
        .collect()
}

/// Shifted frequency axis in MHz: bin `i` sits at `center + (i - len/2) * rate / len`.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "radio frequencies fit in f64 exactly")]
pub fn frequency_axis_mhz(fft_size: usize, center_freq: u64, sample_rate: u32) -> Vec<f64> {
    let bin_width = f64::from(sample_rate) / fft_size as f64;
    let half = (fft_size / 2) as f64;
    let center = center_freq as f64;
    (0..fft_size)
        .map(|i| (center + (i as f64 - half) * bin_width) / 1e6)
        .collect()
}

/// Decimation step keeping frames near [`MAX_FRAME_POINTS`] points.
#[must_use]
pub fn downsample_step(fft_size: usize) -> usize {
    (fft_size / MAX_FRAME_POINTS).max(1)
}

/// Window, FFT, dB conversion and averaging for unsigned 8-bit I/Q input.
///
/// Centre frequency and sample rate are fixed for the lifetime of a processor
/// since they belong to the capture process. FFT size may change between
/// frames; doing so discards any partially accumulated average.
pub struct SpectrumProcessor {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    accumulator: Vec<Vec<f32>>,
    center_freq: u64,
    sample_rate: u32,
}

impl fmt::Debug for SpectrumProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumProcessor")
            .field("fft_size", &self.fft_size)
            .field("pending", &self.accumulator.len())
            .field("center_freq", &self.center_freq)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl SpectrumProcessor {
    #[must_use]
    pub fn new(center_freq: u64, sample_rate: u32, fft_size: usize) -> Self {
        Self {
            fft: FftPlanner::new().plan_fft_forward(fft_size),
            fft_size,
            window: hann_window(fft_size),
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            accumulator: Vec::new(),
            center_freq,
            sample_rate,
        }
    }

    #[must_use]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Raw power spectra accumulated toward the next frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }

    pub fn set_fft_size(&mut self, fft_size: usize) {
        if fft_size == self.fft_size {
            return;
        }
        self.fft = FftPlanner::new().plan_fft_forward(fft_size);
        self.fft_size = fft_size;
        self.window = hann_window(fft_size);
        self.buffer = vec![Complex::new(0.0, 0.0); fft_size];
        self.accumulator.clear();
    }

    /// Shifted power spectrum in dB of one block of `fft_size * 2` raw bytes.
    ///
    /// Index 0 of the result is the most negative frequency offset.
    pub fn power_spectrum(&mut self, raw: &[u8]) -> Vec<f32> {
        debug_assert_eq!(raw.len(), self.fft_size * 2);

        for ((slot, iq), w) in self
            .buffer
            .iter_mut()
            .zip(raw.chunks_exact(2))
            .zip(&self.window)
        {
            let i = f32::from(iq[0]) - 127.5;
            let q = f32::from(iq[1]) - 127.5;
            *slot = Complex::new(i * w, q * w);
        }

        self.fft.process(&mut self.buffer);

        // fftshift: move the negative half in front of DC.
        let half = self.fft_size / 2;
        self.buffer[..]
            .iter()
            .skip(self.fft_size - half)
            .chain(self.buffer.iter().take(self.fft_size - half))
            .map(|x| 20.0 * (x.norm() + MAGNITUDE_EPSILON).log10())
            .collect()
    }

    /// Feed one raw block; returns a frame once `averaging` spectra are held.
    pub fn push(&mut self, raw: &[u8], averaging: usize) -> Option<SpectrumFrame> {
        let power = self.power_spectrum(raw);
        self.accumulator.push(power);

        if self.accumulator.len() < averaging.max(1) {
            return None;
        }

        let averaged = mean_spectrum(&self.accumulator);
        self.accumulator.clear();
        Some(self.build_frame(&averaged))
    }

    #[allow(clippy::cast_precision_loss, reason = "spectra hold at most 4096 bins")]
    fn build_frame(&self, averaged: &[f32]) -> SpectrumFrame {
        let step = downsample_step(self.fft_size);
        let axis = frequency_axis_mhz(self.fft_size, self.center_freq, self.sample_rate);

        let min_power = averaged.iter().copied().fold(f32::INFINITY, f32::min);
        let max_power = averaged.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let avg_power = averaged.iter().sum::<f32>() / averaged.len() as f32;

        SpectrumFrame {
            center_freq_mhz: self.center_freq as f64 / 1e6,
            sample_rate_mhz: f64::from(self.sample_rate) / 1e6,
            frequencies: axis.into_iter().step_by(step).collect(),
            power: averaged.iter().copied().step_by(step).collect(),
            min_power,
            max_power,
            avg_power,
        }
    }
}

#[allow(clippy::cast_precision_loss, reason = "averaging counts are small")]
fn mean_spectrum(spectra: &[Vec<f32>]) -> Vec<f32> {
    let len = spectra.first().map_or(0, Vec::len);
    let mut sum = vec![0.0f32; len];
    for spectrum in spectra {
        for (acc, p) in sum.iter_mut().zip(spectrum) {
            *acc += p;
        }
    }
    let count = spectra.len() as f32;
    sum.iter_mut().for_each(|v| *v /= count);
    sum
}
