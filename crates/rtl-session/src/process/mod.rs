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

//! Lifecycle supervision for one external process.
//!
//! A supervisor spawns a child with captured stdout/stderr, verifies that it
//! survives a short settle window, and stops it gracefully (SIGTERM) with a
//! bounded wait before escalating to a forced kill. Liveness is always derived
//! by polling the child's exit status, never cached.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::{sleep, timeout};

use crate::error::{Result, SessionError};

/// Executable plus the arguments that precede the mode-specific ones.
///
/// `leading_args` lets the tools run behind a wrapper such as `stdbuf -oL`
/// or `nice`, where the real tool becomes one of the leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub path: PathBuf,
    pub leading_args: Vec<String>,
}

impl ProgramSpec {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            leading_args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Human-readable command line, for logs.
    #[must_use]
    pub fn display_with(&self, args: &[String]) -> String {
        std::iter::once(self.path.display().to_string())
            .chain(self.leading_args.iter().cloned())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Timing parameters for a supervised process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long to wait after spawn before checking that the child survived.
    pub settle_delay: Duration,
    /// Grace period between SIGTERM and a forced kill.
    pub stop_timeout: Duration,
    /// Pause between stop and start on restart, so the OS releases the USB device.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(200),
            stop_timeout: Duration::from_secs(2),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Owns at most one running child process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    name: String,
    config: SupervisorConfig,
    command: Option<(ProgramSpec, Vec<String>)>,
    child: Option<Child>,
}

impl ProcessSupervisor {
    /// Create an idle supervisor. `name` is used only for log messages.
    #[must_use]
    pub fn new(name: impl Into<String>, config: SupervisorConfig) -> Self {
        Self {
            name: name.into(),
            config,
            command: None,
            child: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn `program` with `args` and wait out the settle window.
    ///
    /// Fails with [`SessionError::Spawn`] if exec fails and with
    /// [`SessionError::Startup`] (carrying the child's stderr) if the process
    /// is already gone when the settle window ends. A child that is still
    /// running from an earlier start is stopped first.
    pub async fn start(&mut self, program: &ProgramSpec, args: &[String]) -> Result<()> {
        if self.child.is_some() {
            warn!("{} already has a child process, stopping it first", self.name);
            self.stop().await?;
        }

        let program_name = program.path.display().to_string();
        info!("Starting {}: {}", self.name, program.display_with(args));

        let mut child = Command::new(&program.path)
            .args(&program.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                program: program_name.clone(),
                source,
            })?;

        sleep(self.config.settle_delay).await;

        if let Some(status) = child.try_wait()? {
            let stderr = read_startup_stderr(&mut child, self.config.settle_delay).await;
            error!("{} exited during startup ({}): {}", self.name, status, stderr);
            return Err(SessionError::Startup {
                program: program_name,
                status: status.to_string(),
                stderr,
            });
        }

        info!("{} started with PID {}", self.name, child.id().unwrap_or_default());
        self.command = Some((program.clone(), args.to_vec()));
        self.child = Some(child);
        Ok(())
    }

    /// Take the child's stdout. Returns `None` if idle or already taken.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    /// Take the child's stderr. Returns `None` if idle or already taken.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }

    /// OS process id of the running child.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Poll the child's exit status.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!("{} has exited ({})", self.name, status);
                false
            }
            Some(Err(e)) => {
                warn!("Failed to poll {} status: {}", self.name, e);
                false
            }
            None => false,
        }
    }

    /// Stop the child: SIGTERM, bounded wait, then kill.
    ///
    /// Always succeeds; stopping an idle supervisor is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            info!("{} had already exited ({})", self.name, status);
            return Ok(());
        }

        info!("Stopping {}...", self.name);
        if let Err(e) = terminate(&mut child) {
            warn!("Failed to signal {}: {}", self.name, e);
        }

        match timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => info!("{} stopped ({})", self.name, status),
            Ok(Err(e)) => warn!("Failed waiting for {}: {}", self.name, e),
            Err(_) => {
                warn!(
                    "{} did not terminate within {:?}, killing...",
                    self.name, self.config.stop_timeout
                );
                if let Err(e) = child.kill().await {
                    error!("Failed to kill {}: {}", self.name, e);
                }
            }
        }

        Ok(())
    }

    /// Stop, pause for the restart delay, and start the last command again.
    pub async fn restart(&mut self) -> Result<()> {
        let Some((program, args)) = self.command.clone() else {
            return Err(SessionError::Io(std::io::Error::other(format!(
                "{} has never been started",
                self.name
            ))));
        };

        self.stop().await?;
        sleep(self.config.restart_delay).await;
        self.start(&program, &args).await
    }
}

async fn read_startup_stderr(child: &mut Child, limit: Duration) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };

    let mut buf = Vec::new();
    // A forked grandchild may keep the pipe open, so bound the read.
    let _ = timeout(limit, stderr.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid).map_err(std::io::Error::other)?;

    // SAFETY: kill(2) only sends a signal to a process we spawned and still own;
    // no memory is shared with the callee.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}
