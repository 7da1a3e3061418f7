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

//! Live spectrum analysis over raw rtl_sdr I/Q output.
//!
//! [`run_engine`] reads blocks of unsigned 8-bit I/Q pairs, hands them to a
//! [`SpectrumProcessor`], and publishes each averaged frame to a
//! [`BroadcastHub`]. FFT size and averaging are read live from a
//! [`watch`] channel at the start of every cycle; centre frequency, sample
//! rate and gain belong to the capture process and only change on restart.

mod fft;

pub use fft::{downsample_step, frequency_axis_mhz, hann_window, SpectrumProcessor};

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::hub::BroadcastHub;

/// Smallest FFT size the engine runs with.
pub const MIN_FFT_SIZE: usize = 256;
/// Largest FFT size the engine runs with.
pub const MAX_FFT_SIZE: usize = 4096;

/// Pause after each published frame.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(50);

/// Clamp into [`MIN_FFT_SIZE`, `MAX_FFT_SIZE`], then round down to a power of two.
#[must_use]
pub fn normalize_fft_size(requested: usize) -> usize {
    let clamped = requested.clamp(MIN_FFT_SIZE, MAX_FFT_SIZE);
    1 << (usize::BITS - 1 - clamped.leading_zeros())
}

/// Spectrum analyzer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Centre frequency in Hz.
    pub center_freq: u64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    pub fft_size: usize,
    /// Tuner gain in dB.
    pub gain: i32,
    /// Raw spectra averaged per frame.
    pub averaging: usize,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            center_freq: 433_920_000,
            sample_rate: 2_048_000,
            fft_size: 1024,
            gain: 40,
            averaging: 4,
        }
    }
}

impl SpectrumConfig {
    /// Copy with the FFT size and averaging brought into range.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.fft_size = normalize_fft_size(self.fft_size);
        self.averaging = self.averaging.max(1);
        self
    }

    /// Arguments for `rtl_sdr` writing raw samples to stdout.
    #[must_use]
    pub fn capture_args(&self) -> Vec<String> {
        vec![
            "-f".to_string(),
            self.center_freq.to_string(),
            "-s".to_string(),
            self.sample_rate.to_string(),
            "-g".to_string(),
            self.gain.to_string(),
            "-".to_string(),
        ]
    }

    /// Parameters baked into the running capture process.
    #[must_use]
    pub fn capture_params(&self) -> (u64, u32, i32) {
        (self.center_freq, self.sample_rate, self.gain)
    }
}

/// Partial configuration change; `None` leaves a field as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrumUpdate {
    pub center_freq: Option<u64>,
    pub sample_rate: Option<u32>,
    pub fft_size: Option<usize>,
    pub gain: Option<i32>,
    pub averaging: Option<usize>,
}

impl SpectrumUpdate {
    pub fn apply_to(&self, config: &mut SpectrumConfig) {
        if let Some(center_freq) = self.center_freq {
            config.center_freq = center_freq;
        }
        if let Some(sample_rate) = self.sample_rate {
            config.sample_rate = sample_rate;
        }
        if let Some(fft_size) = self.fft_size {
            config.fft_size = normalize_fft_size(fft_size);
        }
        if let Some(gain) = self.gain {
            config.gain = gain;
        }
        if let Some(averaging) = self.averaging {
            config.averaging = averaging.max(1);
        }
    }
}

/// One averaged, downsampled power spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumFrame {
    pub center_freq_mhz: f64,
    pub sample_rate_mhz: f64,
    /// Bin frequencies in MHz, increasing.
    pub frequencies: Vec<f64>,
    /// Power in dB, one value per entry of `frequencies`.
    pub power: Vec<f32>,
    pub min_power: f32,
    pub max_power: f32,
    pub avg_power: f32,
}

/// Spectrum analyzer status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumStatus {
    pub running: bool,
    pub center_freq_mhz: f64,
    pub sample_rate_mhz: f64,
    pub fft_size: usize,
    pub gain: i32,
    pub averaging: usize,
    /// Number of subscribed consumers.
    pub clients: usize,
    /// The pending configuration changes a capture parameter of the running process.
    pub restart_required: bool,
}

/// Message delivered to spectrum subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpectrumMessage {
    Spectrum(SpectrumFrame),
    Status { data: SpectrumStatus },
    Heartbeat,
}

/// Counters for one engine run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Raw blocks transformed.
    pub blocks: u64,
    /// Frames published.
    pub frames: u64,
}

/// Run the spectrum engine until the source ends or `cancel` fires.
///
/// `center_freq` and `sample_rate` label the frames and must match the
/// capture process feeding `source`.
#[allow(clippy::cast_precision_loss, reason = "only used for log output")]
pub async fn run_engine<R>(
    mut source: R,
    center_freq: u64,
    sample_rate: u32,
    config: watch::Receiver<SpectrumConfig>,
    hub: Arc<BroadcastHub<SpectrumMessage>>,
    cancel: CancellationToken,
) -> EngineStats
where
    R: AsyncRead + Unpin,
{
    let initial = config.borrow().normalized();
    let mut processor = SpectrumProcessor::new(center_freq, sample_rate, initial.fft_size);
    let mut block = Vec::new();
    let mut stats = EngineStats::default();

    info!(
        "Spectrum engine started at {:.3} MHz, {} FFT bins",
        center_freq as f64 / 1e6,
        initial.fft_size
    );

    loop {
        let live = config.borrow().normalized();
        processor.set_fft_size(live.fft_size);
        block.resize(live.fft_size * 2, 0);

        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            result = source.read_exact(&mut block) => match result {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    info!("Sample stream closed");
                    break;
                }
                Err(e) => {
                    error!("Error reading samples: {}", e);
                    break;
                }
            },
        }

        stats.blocks += 1;
        let Some(frame) = processor.push(&block, live.averaging) else {
            continue;
        };

        stats.frames += 1;
        hub.publish(&SpectrumMessage::Spectrum(frame));

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(FRAME_INTERVAL) => {}
        }
    }

    info!(
        "Spectrum engine stopped ({} blocks, {} frames)",
        stats.blocks, stats.frames
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fft_size() {
        assert_eq!(normalize_fft_size(1000), 512);
        assert_eq!(normalize_fft_size(1024), 1024);
        assert_eq!(normalize_fft_size(100), 256);
        assert_eq!(normalize_fft_size(0), 256);
        assert_eq!(normalize_fft_size(5000), 4096);
        assert_eq!(normalize_fft_size(4095), 2048);
        assert_eq!(normalize_fft_size(300), 256);
    }

    #[test]
    fn test_normalize_fft_size_invariant() {
        for n in 0..10_000 {
            let size = normalize_fft_size(n);
            assert!(size.is_power_of_two());
            assert!((MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size));
        }
    }

    #[test]
    fn test_update_applies_only_given_fields() {
        let mut config = SpectrumConfig::default();
        SpectrumUpdate {
            fft_size: Some(3000),
            averaging: Some(0),
            ..Default::default()
        }
        .apply_to(&mut config);

        assert_eq!(config.fft_size, 2048);
        assert_eq!(config.averaging, 1);
        assert_eq!(config.center_freq, 433_920_000);
        assert_eq!(config.gain, 40);
    }

    #[test]
    fn test_capture_args() {
        let config = SpectrumConfig {
            center_freq: 100_000_000,
            sample_rate: 2_400_000,
            gain: 20,
            ..Default::default()
        };
        assert_eq!(
            config.capture_args(),
            vec!["-f", "100000000", "-s", "2400000", "-g", "20", "-"]
        );
    }

    #[test]
    fn test_message_tags() {
        let heartbeat = serde_json::to_value(SpectrumMessage::Heartbeat).unwrap();
        assert_eq!(heartbeat, serde_json::json!({"type": "heartbeat"}));

        let frame = SpectrumFrame {
            center_freq_mhz: 433.92,
            sample_rate_mhz: 2.048,
            frequencies: vec![433.0, 434.0],
            power: vec![-10.0, -20.0],
            min_power: -20.0,
            max_power: -10.0,
            avg_power: -15.0,
        };
        let value = serde_json::to_value(SpectrumMessage::Spectrum(frame)).unwrap();
        assert_eq!(value["type"], "spectrum");
        assert_eq!(value["center_freq_mhz"], 433.92);
        assert_eq!(value["power"][1], -20.0);
    }

    #[tokio::test]
    async fn test_engine_publishes_one_frame_per_averaging_blocks() {
        let config = SpectrumConfig {
            fft_size: 256,
            averaging: 2,
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(config);
        let hub = Arc::new(BroadcastHub::<SpectrumMessage>::new());
        let inbox = hub.subscribe();

        // Five full blocks plus a partial one: two frames, tail discarded.
        let samples = vec![128u8; 256 * 2 * 5 + 100];
        let stats = run_engine(
            &samples[..],
            433_920_000,
            2_048_000,
            rx,
            Arc::clone(&hub),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(stats, EngineStats { blocks: 5, frames: 2 });
        assert_eq!(inbox.len(), 2);
        match inbox.recv().await {
            Some(SpectrumMessage::Spectrum(frame)) => {
                assert_eq!(frame.power.len(), 256);
                assert!((frame.center_freq_mhz - 433.92).abs() < 1e-9);
            }
            other => panic!("expected a spectrum frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_engine_reads_live_fft_size() {
        let (tx, rx) = watch::channel(SpectrumConfig {
            fft_size: 512,
            averaging: 1,
            ..Default::default()
        });
        tx.send_modify(|c| c.fft_size = 256);

        let hub = Arc::new(BroadcastHub::<SpectrumMessage>::new());
        let inbox = hub.subscribe();
        let samples = vec![100u8; 256 * 2];
        let stats = run_engine(&samples[..], 0, 1_000_000, rx, hub, CancellationToken::new()).await;

        assert_eq!(stats.frames, 1);
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn test_engine_stops_on_cancel() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (_tx, rx) = watch::channel(SpectrumConfig::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_engine(
            reader,
            433_920_000,
            2_048_000,
            rx,
            Arc::new(BroadcastHub::new()),
            cancel.clone(),
        ));

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("engine ignored cancellation")
            .unwrap();
        assert_eq!(stats.frames, 0);
    }
}
