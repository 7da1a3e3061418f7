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

//! Error taxonomy for session control.
//!
//! Only control calls (start/stop/restart/configure) surface errors to the
//! caller. Per-line parse failures, sink failures and termination timeouts are
//! recovered where they happen and never reach this type.

use std::io;

use thiserror::Error;

use crate::arbiter::SessionKind;

/// Errors returned by the control surface.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The executable could not be found or exec failed.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The process exited within the settle window after spawn.
    #[error("'{program}' exited during startup ({status}): {stderr}")]
    Startup {
        program: String,
        status: String,
        stderr: String,
    },

    /// Another session currently owns the receiver.
    #[error("cannot start {requested}: {active} is active, stop it first")]
    Conflict {
        active: SessionKind,
        requested: SessionKind,
    },

    /// The operation needs a session that is not running.
    #[error("{0} is not running")]
    NotActive(SessionKind),

    /// A frequency string could not be parsed.
    #[error("invalid frequency '{0}'")]
    InvalidFrequency(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
