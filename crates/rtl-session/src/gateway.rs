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

//! The session gateway: one context object owning the receiver.
//!
//! [`Gateway`] is constructed once at startup and shared (usually in an
//! `Arc`) with whatever front end drives it. Every control call takes the
//! same async mutex, so start/stop/restart requests are serialized and the
//! receiver is never handed to two sessions at once. Sessions whose process
//! has exited, or whose reader/engine task has ended, are reaped on the next
//! control or status call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::process::ChildStdout;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::arbiter::{admit, SessionKind, StartOutcome};
use crate::audio::{AudioConfig, AudioStatus, Modulation};
use crate::error::{Result, SessionError};
use crate::frequency::parse_frequency;
use crate::hub::{BroadcastHub, Inbox, SubscriberId, DEFAULT_INBOX_CAPACITY};
use crate::process::{ProcessSupervisor, ProgramSpec, SupervisorConfig};
use crate::protocol::Rtl433Parser;
use crate::reader::{drain_stderr, ByteRelay, EventSink, LineDecoder, SinkRegistry, DEFAULT_CHUNK_SIZE};
use crate::spectrum::{run_engine, SpectrumConfig, SpectrumMessage, SpectrumStatus, SpectrumUpdate};

/// rtl_433 decoding parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub frequency: String,
    pub sample_rate: String,
    pub gain: i32,
    /// rtl_433 config file; used instead of the fields above when it exists.
    pub config_file: Option<PathBuf>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            frequency: "433.92M".to_string(),
            sample_rate: "1024k".to_string(),
            gain: 40,
            config_file: None,
        }
    }
}

impl DecoderConfig {
    /// `rtl_433` arguments producing one JSON object per line.
    pub fn command_args(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();

        match self.config_file.as_ref().filter(|path| path.exists()) {
            Some(path) => {
                args.push("-c".to_string());
                args.push(path.display().to_string());
            }
            None => {
                args.push("-f".to_string());
                args.push(parse_frequency(&self.frequency)?.to_string());
                args.push("-s".to_string());
                args.push(parse_frequency(&self.sample_rate)?.to_string());
                args.push("-g".to_string());
                args.push(self.gain.to_string());
            }
        }

        args.push("-F".to_string());
        args.push("json".to_string());
        Ok(args)
    }
}

/// Everything the gateway needs to launch its sessions.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub rtl_433: ProgramSpec,
    pub rtl_fm: ProgramSpec,
    pub rtl_sdr: ProgramSpec,
    pub decoder: DecoderConfig,
    pub decoder_supervisor: SupervisorConfig,
    pub audio_supervisor: SupervisorConfig,
    pub spectrum_supervisor: SupervisorConfig,
    /// Initial spectrum configuration, before any start or configure call.
    pub spectrum: SpectrumConfig,
    /// Per-subscriber inbox size for spectrum messages.
    pub inbox_capacity: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            rtl_433: ProgramSpec::new("rtl_433"),
            rtl_fm: ProgramSpec::new("rtl_fm"),
            rtl_sdr: ProgramSpec::new("rtl_sdr"),
            decoder: DecoderConfig::default(),
            decoder_supervisor: SupervisorConfig {
                stop_timeout: Duration::from_secs(5),
                ..SupervisorConfig::default()
            },
            audio_supervisor: SupervisorConfig::default(),
            spectrum_supervisor: SupervisorConfig::default(),
            spectrum: SpectrumConfig::default(),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

/// Decoding session status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodeStatus {
    pub running: bool,
    pub pid: Option<u32>,
    /// Registered event sinks.
    pub sinks: usize,
}

#[derive(Debug)]
enum SessionMode {
    Decoding,
    Audio {
        config: AudioConfig,
        stdout: Arc<Mutex<ChildStdout>>,
    },
    Spectrum {
        /// Configuration the capture process was started with.
        running: SpectrumConfig,
    },
}

impl SessionMode {
    fn kind(&self) -> SessionKind {
        match self {
            Self::Decoding => SessionKind::Decoding,
            Self::Audio { .. } => SessionKind::AudioStreaming,
            Self::Spectrum { .. } => SessionKind::SpectrumAnalyzing,
        }
    }
}

#[derive(Debug)]
struct ActiveSession {
    mode: SessionMode,
    supervisor: ProcessSupervisor,
    cancel: CancellationToken,
    /// Reader or engine loop; its end means the session is over.
    primary: Option<JoinHandle<()>>,
    auxiliary: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    fn new(mode: SessionMode, supervisor: ProcessSupervisor) -> Self {
        Self {
            mode,
            supervisor,
            cancel: CancellationToken::new(),
            primary: None,
            auxiliary: Vec::new(),
        }
    }

    fn kind(&self) -> SessionKind {
        self.mode.kind()
    }

    fn is_alive(&mut self) -> bool {
        let primary_done = self.primary.as_ref().is_some_and(JoinHandle::is_finished);
        !primary_done && self.supervisor.is_running()
    }

    fn drain_stderr(&mut self) {
        if let Some(stderr) = self.supervisor.take_stderr() {
            let name = self.supervisor.name().to_string();
            self.auxiliary
                .push(tokio::spawn(drain_stderr(stderr, name, self.cancel.clone())));
        }
    }

    /// Cancel the session's tasks and stop its process, concurrently.
    ///
    /// Returns once both the tasks have finished and the process is gone.
    async fn shut_down(self) {
        let Self {
            mode,
            mut supervisor,
            cancel,
            primary,
            auxiliary,
        } = self;
        let kind = mode.kind();

        cancel.cancel();
        let tasks = primary.into_iter().chain(auxiliary);
        let ((), stopped) = tokio::join!(await_tasks(tasks), supervisor.stop());
        if let Err(e) = stopped {
            error!("Error stopping {} session: {}", kind, e);
        }
        info!("{} session stopped", kind);
    }

    /// Cancel the tasks only, handing back the supervisor with its process.
    async fn detach(self) -> ProcessSupervisor {
        self.cancel.cancel();
        await_tasks(self.primary.into_iter().chain(self.auxiliary)).await;
        self.supervisor
    }
}

async fn await_tasks(tasks: impl IntoIterator<Item = JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            if e.is_panic() {
                error!("Session task panicked: {}", e);
            }
        }
    }
}

type SessionSlot<'a> = MutexGuard<'a, Option<ActiveSession>>;

/// Control surface for the shared receiver.
#[derive(Debug)]
pub struct Gateway {
    settings: GatewaySettings,
    session: Mutex<Option<ActiveSession>>,
    sinks: Arc<SinkRegistry>,
    spectrum_hub: Arc<BroadcastHub<SpectrumMessage>>,
    spectrum_config: watch::Sender<SpectrumConfig>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(GatewaySettings::default())
    }
}

impl Gateway {
    #[must_use]
    pub fn new(settings: GatewaySettings) -> Self {
        let (spectrum_config, _) = watch::channel(settings.spectrum.normalized());
        Self {
            spectrum_hub: Arc::new(BroadcastHub::with_capacity(settings.inbox_capacity)),
            spectrum_config,
            settings,
            session: Mutex::new(None),
            sinks: Arc::new(SinkRegistry::new()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Lock the session slot, first reaping a session that has died.
    async fn lock_session(&self) -> SessionSlot<'_> {
        let mut slot = self.session.lock().await;
        if slot.as_mut().is_some_and(|s| !s.is_alive()) {
            if let Some(session) = slot.take() {
                warn!("{} session ended on its own, releasing the receiver", session.kind());
                session.shut_down().await;
            }
        }
        slot
    }

    /// Stop the active session if it is of `kind`; anything else is left alone.
    async fn stop_kind(&self, kind: SessionKind) {
        let mut slot = self.lock_session().await;
        if slot.as_ref().is_some_and(|s| s.kind() == kind) {
            if let Some(session) = slot.take() {
                session.shut_down().await;
            }
        }
    }

    /// Which session owns the receiver.
    pub async fn active_session(&self) -> SessionKind {
        self.lock_session()
            .await
            .as_ref()
            .map_or(SessionKind::Idle, ActiveSession::kind)
    }

    pub async fn is_running(&self, kind: SessionKind) -> bool {
        self.active_session().await == kind
    }

    /// Stop whichever session is active.
    pub async fn shutdown(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.shut_down().await;
        }
    }

    // --- decoding ---

    /// Register a consumer for decoded events. Sinks outlive sessions.
    pub fn add_event_sink(&self, sink: Arc<dyn EventSink>) -> SubscriberId {
        self.sinks.add(sink)
    }

    pub fn remove_event_sink(&self, id: SubscriberId) -> bool {
        self.sinks.remove(id)
    }

    pub async fn start_decoding(&self) -> Result<StartOutcome> {
        let mut slot = self.lock_session().await;
        let outcome = admit(current_kind(&slot), SessionKind::Decoding)?;
        if outcome == StartOutcome::Started {
            *slot = Some(self.launch_decoder().await?);
        }
        Ok(outcome)
    }

    pub async fn stop_decoding(&self) -> Result<()> {
        self.stop_kind(SessionKind::Decoding).await;
        Ok(())
    }

    /// Restart rtl_433 with the same command, or start it if idle.
    pub async fn restart_decoding(&self) -> Result<()> {
        let mut slot = self.lock_session().await;
        let session = match slot.take() {
            Some(session) if session.kind() == SessionKind::Decoding => session,
            Some(session) => {
                let active = session.kind();
                *slot = Some(session);
                return Err(SessionError::Conflict {
                    active,
                    requested: SessionKind::Decoding,
                });
            }
            None => {
                *slot = Some(self.launch_decoder().await?);
                return Ok(());
            }
        };

        info!("Restarting decoder");
        let mut supervisor = session.detach().await;
        supervisor.restart().await?;
        *slot = Some(self.attach_decoder(supervisor).await?);
        Ok(())
    }

    pub async fn decode_status(&self) -> DecodeStatus {
        let slot = self.lock_session().await;
        let decoding = slot.as_ref().filter(|s| s.kind() == SessionKind::Decoding);
        DecodeStatus {
            running: decoding.is_some(),
            pid: decoding.and_then(|s| s.supervisor.id()),
            sinks: self.sinks.len(),
        }
    }

    async fn launch_decoder(&self) -> Result<ActiveSession> {
        let args = self.settings.decoder.command_args()?;
        let mut supervisor =
            ProcessSupervisor::new("rtl_433", self.settings.decoder_supervisor.clone());
        supervisor.start(&self.settings.rtl_433, &args).await?;
        self.attach_decoder(supervisor).await
    }

    async fn attach_decoder(&self, mut supervisor: ProcessSupervisor) -> Result<ActiveSession> {
        let stdout = match supervisor.take_stdout() {
            Some(stdout) => stdout,
            None => {
                supervisor.stop().await?;
                return Err(missing_stdout(supervisor.name()));
            }
        };

        let mut session = ActiveSession::new(SessionMode::Decoding, supervisor);
        let decoder = LineDecoder::new(Rtl433Parser::new(), Arc::clone(&self.sinks));
        let cancel = session.cancel.clone();
        session.primary = Some(tokio::spawn(async move {
            decoder.run(stdout, cancel).await;
        }));
        session.drain_stderr();
        Ok(session)
    }

    // --- audio ---

    pub async fn start_audio(&self, config: AudioConfig) -> Result<StartOutcome> {
        let mut slot = self.lock_session().await;
        let outcome = admit(current_kind(&slot), SessionKind::AudioStreaming)?;
        if outcome == StartOutcome::Started {
            *slot = Some(self.launch_audio(config).await?);
        }
        Ok(outcome)
    }

    pub async fn stop_audio(&self) -> Result<()> {
        self.stop_kind(SessionKind::AudioStreaming).await;
        Ok(())
    }

    /// Restart audio on `frequency`, keeping every other setting.
    ///
    /// The stream is left untouched if the new frequency does not parse.
    pub async fn tune_audio(
        &self,
        frequency: &str,
        modulation: Option<Modulation>,
    ) -> Result<AudioConfig> {
        let mut slot = self.lock_session().await;
        let current = match slot.as_ref().map(|s| &s.mode) {
            Some(SessionMode::Audio { config, .. }) => config.clone(),
            _ => return Err(SessionError::NotActive(SessionKind::AudioStreaming)),
        };

        let tuned = current.retuned(frequency, modulation);
        tuned.command_args()?;

        info!("Tuning audio to {} ({})", tuned.frequency, tuned.modulation);
        if let Some(session) = slot.take() {
            session.shut_down().await;
        }
        *slot = Some(self.launch_audio(tuned.clone()).await?);
        Ok(tuned)
    }

    /// Pull-based PCM chunks for the running audio session.
    ///
    /// The relay ends when the session stops or the process exits.
    pub async fn audio_stream(&self) -> Result<ByteRelay<ChildStdout>> {
        let slot = self.lock_session().await;
        match slot.as_ref() {
            Some(ActiveSession {
                mode: SessionMode::Audio { stdout, .. },
                cancel,
                ..
            }) => Ok(ByteRelay::new(
                Arc::clone(stdout),
                DEFAULT_CHUNK_SIZE,
                cancel.clone(),
            )),
            _ => Err(SessionError::NotActive(SessionKind::AudioStreaming)),
        }
    }

    pub async fn audio_status(&self) -> AudioStatus {
        let slot = self.lock_session().await;
        let config = match slot.as_ref().map(|s| &s.mode) {
            Some(SessionMode::Audio { config, .. }) => Some(config.clone()),
            _ => None,
        };
        AudioStatus {
            running: config.is_some(),
            config,
        }
    }

    async fn launch_audio(&self, config: AudioConfig) -> Result<ActiveSession> {
        let args = config.command_args()?;
        let mut supervisor =
            ProcessSupervisor::new("rtl_fm", self.settings.audio_supervisor.clone());
        supervisor.start(&self.settings.rtl_fm, &args).await?;

        let Some(stdout) = supervisor.take_stdout() else {
            supervisor.stop().await?;
            return Err(missing_stdout(supervisor.name()));
        };

        let mode = SessionMode::Audio {
            config,
            stdout: Arc::new(Mutex::new(stdout)),
        };
        let mut session = ActiveSession::new(mode, supervisor);
        session.drain_stderr();
        Ok(session)
    }

    // --- spectrum ---

    /// Start the analyzer with `config`, which also becomes the live config.
    pub async fn start_spectrum(&self, config: SpectrumConfig) -> Result<StartOutcome> {
        let mut slot = self.lock_session().await;
        let outcome = admit(current_kind(&slot), SessionKind::SpectrumAnalyzing)?;
        if outcome == StartOutcome::AlreadyActive {
            return Ok(outcome);
        }

        let config = config.normalized();
        self.spectrum_config.send_replace(config);

        let mut supervisor =
            ProcessSupervisor::new("rtl_sdr", self.settings.spectrum_supervisor.clone());
        supervisor
            .start(&self.settings.rtl_sdr, &config.capture_args())
            .await?;

        let Some(stdout) = supervisor.take_stdout() else {
            supervisor.stop().await?;
            return Err(missing_stdout(supervisor.name()));
        };

        let mut session =
            ActiveSession::new(SessionMode::Spectrum { running: config }, supervisor);
        session.primary = Some(tokio::spawn({
            let engine = run_engine(
                stdout,
                config.center_freq,
                config.sample_rate,
                self.spectrum_config.subscribe(),
                Arc::clone(&self.spectrum_hub),
                session.cancel.clone(),
            );
            async move {
                engine.await;
            }
        }));
        session.drain_stderr();
        *slot = Some(session);

        let status = self.spectrum_status_locked(&slot);
        self.spectrum_hub
            .publish(&SpectrumMessage::Status { data: status });
        Ok(outcome)
    }

    pub async fn stop_spectrum(&self) -> Result<()> {
        self.stop_kind(SessionKind::SpectrumAnalyzing).await;
        Ok(())
    }

    /// Merge `update` into the live config.
    ///
    /// FFT size and averaging reach a running engine at its next cycle;
    /// frequency, sample rate and gain need a restart, which the returned
    /// status reports as `restart_required`.
    pub async fn configure_spectrum(&self, update: SpectrumUpdate) -> SpectrumStatus {
        self.spectrum_config
            .send_modify(|config| update.apply_to(config));
        self.spectrum_status().await
    }

    /// Current live spectrum configuration.
    #[must_use]
    pub fn spectrum_config(&self) -> SpectrumConfig {
        *self.spectrum_config.borrow()
    }

    /// New inbox receiving spectrum frames and status messages.
    #[must_use]
    pub fn subscribe_spectrum(&self) -> Inbox<SpectrumMessage> {
        self.spectrum_hub.subscribe()
    }

    #[must_use]
    pub fn spectrum_hub(&self) -> &Arc<BroadcastHub<SpectrumMessage>> {
        &self.spectrum_hub
    }

    pub async fn spectrum_status(&self) -> SpectrumStatus {
        let slot = self.lock_session().await;
        self.spectrum_status_locked(&slot)
    }

    #[allow(clippy::cast_precision_loss, reason = "frequencies fit in f64 exactly")]
    fn spectrum_status_locked(&self, slot: &SessionSlot<'_>) -> SpectrumStatus {
        let live = *self.spectrum_config.borrow();
        let running = match slot.as_ref().map(|s| &s.mode) {
            Some(SessionMode::Spectrum { running }) => Some(*running),
            _ => None,
        };

        SpectrumStatus {
            running: running.is_some(),
            center_freq_mhz: live.center_freq as f64 / 1e6,
            sample_rate_mhz: f64::from(live.sample_rate) / 1e6,
            fft_size: live.fft_size,
            gain: live.gain,
            averaging: live.averaging,
            clients: self.spectrum_hub.subscriber_count(),
            restart_required: running
                .is_some_and(|r| r.capture_params() != live.capture_params()),
        }
    }
}

fn current_kind(slot: &SessionSlot<'_>) -> SessionKind {
    slot.as_ref().map_or(SessionKind::Idle, ActiveSession::kind)
}

fn missing_stdout(name: &str) -> SessionError {
    SessionError::Io(std::io::Error::other(format!("{name} stdout was not captured")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_args_without_config_file() {
        let args = DecoderConfig::default().command_args().unwrap();
        assert_eq!(
            args,
            vec!["-f", "433920000", "-s", "1024000", "-g", "40", "-F", "json"]
        );
    }

    #[test]
    fn test_decoder_args_ignore_missing_config_file() {
        let config = DecoderConfig {
            config_file: Some(PathBuf::from("/nonexistent/rtl_433.conf")),
            ..DecoderConfig::default()
        };
        assert_eq!(config.command_args().unwrap()[0], "-f");
    }

    #[test]
    fn test_decoder_args_with_config_file() {
        let path = std::env::temp_dir().join(format!("rtl_433-{}.conf", std::process::id()));
        std::fs::write(&path, "frequency 868M\n").unwrap();

        let config = DecoderConfig {
            config_file: Some(path.clone()),
            ..DecoderConfig::default()
        };
        let args = config.command_args().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            args,
            vec!["-c".to_string(), path.display().to_string(), "-F".into(), "json".into()]
        );
    }

    #[test]
    fn test_decoder_args_reject_bad_frequency() {
        let config = DecoderConfig {
            frequency: "433.92Q".to_string(),
            ..DecoderConfig::default()
        };
        assert!(matches!(
            config.command_args(),
            Err(SessionError::InvalidFrequency(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_gateway() {
        let gateway = Gateway::default();
        assert_eq!(gateway.active_session().await, SessionKind::Idle);
        assert!(gateway.stop_decoding().await.is_ok());
        assert!(gateway.stop_audio().await.is_ok());
        assert!(gateway.stop_spectrum().await.is_ok());

        assert!(matches!(
            gateway.tune_audio("101.5M", None).await,
            Err(SessionError::NotActive(SessionKind::AudioStreaming))
        ));
        assert!(gateway.audio_stream().await.is_err());
        assert!(!gateway.audio_status().await.running);
        assert!(!gateway.decode_status().await.running);
    }

    #[tokio::test]
    async fn test_configure_spectrum_while_idle() {
        let gateway = Gateway::default();
        let status = gateway
            .configure_spectrum(SpectrumUpdate {
                fft_size: Some(1000),
                center_freq: Some(915_000_000),
                ..Default::default()
            })
            .await;

        assert!(!status.running);
        assert!(!status.restart_required);
        assert_eq!(status.fft_size, 512);
        assert!((status.center_freq_mhz - 915.0).abs() < 1e-9);
        assert_eq!(gateway.spectrum_config().fft_size, 512);
    }

    #[tokio::test]
    async fn test_missing_program_leaves_gateway_idle() {
        let settings = GatewaySettings {
            rtl_433: ProgramSpec::new("/nonexistent/rtl_433"),
            ..GatewaySettings::default()
        };
        let gateway = Gateway::new(settings);

        assert!(matches!(
            gateway.start_decoding().await,
            Err(SessionError::Spawn { .. })
        ));
        assert_eq!(gateway.active_session().await, SessionKind::Idle);
    }
}
