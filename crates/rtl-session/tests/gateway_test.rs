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

//! End-to-end gateway tests against `/bin/sh` stand-ins for the rtl tools.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use approx::assert_relative_eq;
use chrono::Utc;
use rtl_session::{
    AudioConfig, DecodedEvent, Gateway, GatewaySettings, Modulation, ProgramSpec, SessionError,
    SessionKind, SinkError, SpectrumConfig, SpectrumMessage, SpectrumUpdate, StartOutcome,
    SupervisorConfig,
};

fn shell(script: &str) -> ProgramSpec {
    ProgramSpec::new("/bin/sh").with_leading_args(["-c", script])
}

fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        settle_delay: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(500),
        restart_delay: Duration::from_millis(50),
    }
}

/// Every tool is a silent long-running process unless overridden.
fn settings() -> GatewaySettings {
    GatewaySettings {
        rtl_433: shell("exec sleep 30"),
        rtl_fm: shell("exec sleep 30"),
        rtl_sdr: shell("exec sleep 30"),
        decoder_supervisor: fast_supervisor(),
        audio_supervisor: fast_supervisor(),
        spectrum_supervisor: fast_supervisor(),
        ..GatewaySettings::default()
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rtl-session-{}-{}", std::process::id(), name))
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_conflicting_start_leaves_active_session() {
    let gateway = Gateway::new(settings());

    assert_eq!(gateway.start_decoding().await.unwrap(), StartOutcome::Started);
    let pid = gateway.decode_status().await.pid;
    assert!(pid.is_some());

    let err = gateway.start_audio(AudioConfig::default()).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Conflict {
            active: SessionKind::Decoding,
            requested: SessionKind::AudioStreaming,
        }
    ));
    assert!(matches!(
        gateway.start_spectrum(SpectrumConfig::default()).await,
        Err(SessionError::Conflict { .. })
    ));

    // Stopping a different session must not touch the active one.
    gateway.stop_audio().await.unwrap();
    gateway.stop_spectrum().await.unwrap();

    assert_eq!(gateway.active_session().await, SessionKind::Decoding);
    assert_eq!(gateway.decode_status().await.pid, pid);
    assert_eq!(
        gateway.start_decoding().await.unwrap(),
        StartOutcome::AlreadyActive
    );
    assert_eq!(gateway.decode_status().await.pid, pid);

    gateway.stop_decoding().await.unwrap();
    assert_eq!(gateway.active_session().await, SessionKind::Idle);
    gateway.stop_decoding().await.unwrap();

    assert_eq!(
        gateway.start_audio(AudioConfig::default()).await.unwrap(),
        StartOutcome::Started
    );
    gateway.shutdown().await;
    assert_eq!(gateway.active_session().await, SessionKind::Idle);
}

#[tokio::test]
async fn test_decoder_skips_non_json_and_delivers_next_line() {
    let gateway = Gateway::new(GatewaySettings {
        rtl_433: shell(
            "echo 'rtl_433 version 23.11'; echo 'not json'; \
             echo '{\"model\": \"Acurite-Tower\", \"id\": 1234, \"temperature_C\": 21.5}'; \
             exec sleep 30",
        ),
        ..settings()
    });

    let seen = Arc::new(Mutex::new(Vec::<DecodedEvent>::new()));
    let seen_clone = Arc::clone(&seen);
    gateway.add_event_sink(Arc::new(|_: &DecodedEvent| -> Result<(), SinkError> {
        Err("first sink always fails".into())
    }));
    gateway.add_event_sink(Arc::new(move |event: &DecodedEvent| -> Result<(), SinkError> {
        seen_clone.lock().unwrap().push(event.clone());
        Ok(())
    }));

    let before = Utc::now();
    gateway.start_decoding().await.unwrap();
    assert!(wait_for(|| !seen.lock().unwrap().is_empty()).await);
    let after = Utc::now();

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let event = &seen[0];
        assert_eq!(event.device_key(), "Acurite-Tower_1234");
        assert_eq!(
            event.field("temperature_C").and_then(|v| v.as_f64()),
            Some(21.5)
        );
        assert!(event.time >= before && event.time <= after);
    }

    // Reader is still running after the bad lines.
    assert!(gateway.decode_status().await.running);
    gateway.stop_decoding().await.unwrap();
}

#[tokio::test]
async fn test_stop_escalates_to_kill() {
    let gateway = Gateway::new(GatewaySettings {
        rtl_433: shell("trap '' TERM; while true; do sleep 1; done"),
        ..settings()
    });

    gateway.start_decoding().await.unwrap();
    let started = std::time::Instant::now();
    gateway.stop_decoding().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(gateway.active_session().await, SessionKind::Idle);
}

#[tokio::test]
async fn test_restart_decoding_replaces_process() {
    let gateway = Gateway::new(settings());

    gateway.start_decoding().await.unwrap();
    let first = gateway.decode_status().await.pid;

    gateway.restart_decoding().await.unwrap();
    let status = gateway.decode_status().await;
    assert!(status.running);
    assert!(status.pid.is_some());
    assert_ne!(status.pid, first);

    gateway.stop_decoding().await.unwrap();
}

#[tokio::test]
async fn test_exited_process_releases_receiver() {
    let gateway = Gateway::new(GatewaySettings {
        rtl_433: shell("sleep 0.5"),
        ..settings()
    });

    gateway.start_decoding().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(gateway.active_session().await, SessionKind::Idle);
    assert_eq!(
        gateway.start_audio(AudioConfig::default()).await.unwrap(),
        StartOutcome::Started
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_startup_failure_reports_stderr() {
    let gateway = Gateway::new(GatewaySettings {
        rtl_sdr: shell("echo 'usb_open error -3' >&2; exit 1"),
        ..settings()
    });

    match gateway.start_spectrum(SpectrumConfig::default()).await {
        Err(SessionError::Startup { stderr, .. }) => assert!(stderr.contains("usb_open error -3")),
        other => panic!("expected a startup error, got {other:?}"),
    }
    assert_eq!(gateway.active_session().await, SessionKind::Idle);
    assert!(!gateway.spectrum_status().await.running);
}

#[tokio::test]
async fn test_tune_audio_carries_other_settings() {
    let log = temp_path("rtl_fm.log");
    let _ = std::fs::remove_file(&log);
    let gateway = Gateway::new(GatewaySettings {
        rtl_fm: shell(&format!(
            "printf '%s\\n' \"$0 $*\" >> '{}'; exec sleep 30",
            log.display()
        )),
        ..settings()
    });

    let initial = AudioConfig {
        gain: 25,
        squelch: 10,
        ppm: 2,
        ..AudioConfig::new("98.1M", Modulation::WideFm)
    };
    gateway.start_audio(initial.clone()).await.unwrap();

    let tuned = gateway.tune_audio("101.5M", None).await.unwrap();
    assert_eq!(tuned.frequency, "101.5M");
    assert_eq!(
        AudioConfig {
            frequency: initial.frequency.clone(),
            ..tuned.clone()
        },
        initial
    );

    let status = gateway.audio_status().await;
    assert!(status.running);
    assert_eq!(status.config, Some(tuned));

    // A bad frequency is rejected without interrupting the stream.
    assert!(matches!(
        gateway.tune_audio("not a frequency", None).await,
        Err(SessionError::InvalidFrequency(_))
    ));
    assert!(gateway.audio_status().await.running);

    gateway.stop_audio().await.unwrap();

    let lines = std::fs::read_to_string(&log).unwrap();
    let _ = std::fs::remove_file(&log);
    let lines: Vec<&str> = lines.lines().collect();
    assert_eq!(
        lines,
        vec![
            "-f 98100000 -M wbfm -s 200000 -r 48000 -g 25 -l 10 -p 2 -",
            "-f 101500000 -M wbfm -s 200000 -r 48000 -g 25 -l 10 -p 2 -",
        ]
    );
}

#[tokio::test]
async fn test_audio_stream_chunks_end_on_stop() {
    let gateway = Gateway::new(GatewaySettings {
        rtl_fm: shell("exec cat /dev/zero"),
        ..settings()
    });

    assert!(gateway.audio_stream().await.is_err());
    gateway.start_audio(AudioConfig::default()).await.unwrap();

    let mut relay = gateway.audio_stream().await.unwrap();
    for _ in 0..3 {
        let chunk = relay.next_chunk().await.unwrap();
        assert_eq!(chunk.len(), 4096);
        assert!(chunk.iter().all(|&b| b == 0));
    }

    gateway.stop_audio().await.unwrap();
    assert_eq!(relay.next_chunk().await, None);
}

#[tokio::test]
async fn test_spectrum_frames_reach_subscribers() {
    let gateway = Gateway::new(GatewaySettings {
        rtl_sdr: shell("exec cat /dev/zero"),
        ..settings()
    });
    let inbox = gateway.subscribe_spectrum();

    let config = SpectrumConfig {
        center_freq: 100_000_000,
        sample_rate: 1_024_000,
        fft_size: 1000,
        averaging: 2,
        ..SpectrumConfig::default()
    };
    gateway.start_spectrum(config).await.unwrap();
    assert_eq!(gateway.spectrum_config().fft_size, 512);

    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match inbox.recv().await {
                Some(SpectrumMessage::Spectrum(frame)) => return frame,
                Some(_) => continue,
                None => panic!("hub closed"),
            }
        }
    })
    .await
    .expect("no spectrum frame within 5s");

    assert_relative_eq!(frame.center_freq_mhz, 100.0);
    assert_relative_eq!(frame.sample_rate_mhz, 1.024);
    assert_eq!(frame.frequencies.len(), 256);
    assert_eq!(frame.power.len(), 256);
    assert!(frame.frequencies.windows(2).all(|w| w[0] <= w[1]));
    assert!(frame.min_power <= frame.max_power);

    let status = gateway.spectrum_status().await;
    assert!(status.running);
    assert_eq!(status.clients, 1);
    assert!(!status.restart_required);

    let status = gateway
        .configure_spectrum(SpectrumUpdate {
            averaging: Some(8),
            ..SpectrumUpdate::default()
        })
        .await;
    assert!(!status.restart_required);
    assert_eq!(status.averaging, 8);

    let status = gateway
        .configure_spectrum(SpectrumUpdate {
            center_freq: Some(101_000_000),
            ..SpectrumUpdate::default()
        })
        .await;
    assert!(status.restart_required);

    gateway.stop_spectrum().await.unwrap();
    let status = gateway.spectrum_status().await;
    assert!(!status.running);
    assert!(!status.restart_required);
}
