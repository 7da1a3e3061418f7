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

//! rtlsdr-gateway: command-line front end for the shared RTL-SDR receiver.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::GatewayConfig;
use log::{info, warn};
use rtl_session::audio::{FREQUENCY_PRESETS, MODULATIONS};
use rtl_session::frequency::parse_frequency;
use rtl_session::{
    DecodedEvent, Gateway, SessionKind, SinkError, SpectrumMessage, StartOutcome,
};
use tokio::io::AsyncWriteExt;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "rtlsdr-gateway", version)]
#[command(about = "Share one RTL-SDR between sensor decoding, audio and spectrum analysis", long_about = None)]
struct Cli {
    /// rtl_433 executable (overrides the config file)
    #[arg(long, global = true)]
    rtl_433: Option<PathBuf>,

    /// rtl_fm executable (overrides the config file)
    #[arg(long, global = true)]
    rtl_fm: Option<PathBuf>,

    /// rtl_sdr executable (overrides the config file)
    #[arg(long, global = true)]
    rtl_sdr: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode sensor transmissions with rtl_433 and print one JSON event per line
    Decode {
        /// Frequency, e.g. 433.92M
        #[arg(short, long)]
        frequency: Option<String>,
        /// Sample rate, e.g. 1024k
        #[arg(short, long)]
        sample_rate: Option<String>,
        #[arg(short, long)]
        gain: Option<i32>,
        /// rtl_433 config file
        #[arg(short, long)]
        config_file: Option<PathBuf>,
    },
    /// Demodulate with rtl_fm and write raw s16le mono PCM
    Listen {
        /// Frequency, e.g. 101.5M
        frequency: Option<String>,
        /// wbfm, fm, am, usb, lsb or raw
        #[arg(short, long)]
        modulation: Option<String>,
        #[arg(short, long)]
        gain: Option<i32>,
        #[arg(long)]
        squelch: Option<u32>,
        #[arg(long)]
        ppm: Option<i32>,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the live spectrum analyzer and print JSON messages
    Spectrum {
        /// Centre frequency, e.g. 433.92M
        #[arg(short, long)]
        center: Option<String>,
        /// Sample rate, e.g. 2.048M
        #[arg(short, long)]
        sample_rate: Option<String>,
        #[arg(long)]
        fft_size: Option<usize>,
        #[arg(short, long)]
        gain: Option<i32>,
        #[arg(short, long)]
        averaging: Option<usize>,
        /// Stop after this many frames
        #[arg(short = 'n', long)]
        frames: Option<u64>,
    },
    /// List frequency presets and modulation modes
    Presets,
    /// Show the configuration file path and contents
    Config {
        /// Write the effective configuration back to disk
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::load()?;
    if let Some(path) = cli.rtl_433 {
        config.rtl_433_path = path;
    }
    if let Some(path) = cli.rtl_fm {
        config.rtl_fm_path = path;
    }
    if let Some(path) = cli.rtl_sdr {
        config.rtl_sdr_path = path;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, mut config: GatewayConfig) -> Result<()> {
    match command {
        Commands::Decode {
            frequency,
            sample_rate,
            gain,
            config_file,
        } => {
            if let Some(frequency) = frequency {
                config.decoder_frequency = frequency;
            }
            if let Some(sample_rate) = sample_rate {
                config.decoder_sample_rate = sample_rate;
            }
            if let Some(gain) = gain {
                config.decoder_gain = gain;
            }
            if config_file.is_some() {
                config.rtl_433_config_file = config_file;
            }
            decode_command(&config).await
        }
        Commands::Listen {
            frequency,
            modulation,
            gain,
            squelch,
            ppm,
            output,
        } => {
            if let Some(frequency) = frequency {
                config.audio_frequency = frequency;
            }
            if let Some(modulation) = modulation {
                config.audio_modulation = modulation;
            }
            if let Some(gain) = gain {
                config.audio_gain = gain;
            }
            if let Some(squelch) = squelch {
                config.audio_squelch = squelch;
            }
            if let Some(ppm) = ppm {
                config.audio_ppm = ppm;
            }
            listen_command(&config, output).await
        }
        Commands::Spectrum {
            center,
            sample_rate,
            fft_size,
            gain,
            averaging,
            frames,
        } => {
            if let Some(center) = center {
                config.spectrum_center = center;
            }
            if let Some(sample_rate) = sample_rate {
                config.spectrum_sample_rate = sample_rate;
            }
            if let Some(fft_size) = fft_size {
                config.spectrum_fft_size = fft_size;
            }
            if let Some(gain) = gain {
                config.spectrum_gain = gain;
            }
            if let Some(averaging) = averaging {
                config.spectrum_averaging = averaging;
            }
            spectrum_command(&config, frames).await
        }
        Commands::Presets => presets_command(),
        Commands::Config { save } => config_command(&config, save),
    }
}

async fn decode_command(config: &GatewayConfig) -> Result<()> {
    let gateway = Gateway::new(config.gateway_settings()?);
    gateway.add_event_sink(Arc::new(|event: &DecodedEvent| -> Result<(), SinkError> {
        let line = serde_json::to_string(event).map_err(|e| SinkError(e.to_string()))?;
        println!("{line}");
        Ok(())
    }));

    gateway.start_decoding().await?;
    info!("Decoding, press Ctrl-C to stop");

    let result = supervise(&gateway, SessionKind::Decoding).await;
    gateway.shutdown().await;
    result
}

async fn listen_command(config: &GatewayConfig, output: Option<PathBuf>) -> Result<()> {
    let audio = config.audio_config();
    let gateway = Gateway::new(config.gateway_settings()?);

    gateway.start_audio(audio.clone()).await?;
    info!(
        "Listening on {} ({}), {} Hz s16le mono",
        audio.frequency, audio.modulation, audio.output_rate
    );

    let mut out: Box<dyn tokio::io::AsyncWrite + Unpin> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut relay = gateway.audio_stream().await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            chunk = relay.next_chunk() => match chunk {
                Some(chunk) => {
                    if let Err(e) = out.write_all(&chunk).await {
                        break Err(e).context("failed to write audio");
                    }
                }
                None => {
                    warn!("Audio stream ended");
                    break Ok(());
                }
            },
        }
    };

    out.flush().await.ok();
    gateway.shutdown().await;
    result
}

async fn spectrum_command(config: &GatewayConfig, frames: Option<u64>) -> Result<()> {
    let spectrum = config.spectrum_config()?;
    let gateway = Gateway::new(config.gateway_settings()?);
    let inbox = gateway.subscribe_spectrum();

    if gateway.start_spectrum(spectrum).await? == StartOutcome::Started {
        info!(
            "Spectrum analyzer running: {} bins, averaging {}",
            spectrum.fft_size, spectrum.averaging
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut received = 0u64;

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            message = tokio::time::timeout(Duration::from_secs(1), inbox.recv()) => {
                let message = match message {
                    Ok(Some(message)) => message,
                    Ok(None) => break Ok(()),
                    Err(_) => {
                        if !gateway.is_running(SessionKind::SpectrumAnalyzing).await {
                            break Err(anyhow::anyhow!("spectrum analyzer stopped unexpectedly"));
                        }
                        SpectrumMessage::Heartbeat
                    }
                };

                println!("{}", serde_json::to_string(&message)?);
                if matches!(message, SpectrumMessage::Spectrum(_)) {
                    received += 1;
                    if frames.is_some_and(|limit| received >= limit) {
                        break Ok(());
                    }
                }
            }
        }
    };

    gateway.shutdown().await;
    result
}

/// Wait for Ctrl-C while the session stays up.
async fn supervise(gateway: &Gateway, kind: SessionKind) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping {}", kind);
                return Ok(());
            }
            _ = interval.tick() => {
                if !gateway.is_running(kind).await {
                    bail!("{kind} session ended unexpectedly");
                }
            }
        }
    }
}

fn presets_command() -> Result<()> {
    for preset in FREQUENCY_PRESETS {
        let hz = parse_frequency(preset.tune_frequency())?;
        println!(
            "{:<20} {:>12} Hz  {:<5} {}",
            preset.name,
            hz,
            preset.mode.id(),
            serde_json::to_string(&preset.tuning)?
        );
    }
    println!();
    for info in MODULATIONS {
        println!("{:<5} {:<15} {}", info.id.id(), info.name, info.description);
    }
    Ok(())
}

fn config_command(config: &GatewayConfig, save: bool) -> Result<()> {
    let path = GatewayConfig::config_path()?;
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    if save {
        config.save()?;
        info!("Configuration saved to {}", path.display());
    }
    Ok(())
}
