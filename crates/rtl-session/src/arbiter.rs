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

//! Mode arbitration for the shared receiver.
//!
//! The receiver has a single RF front end, so at most one of the three
//! sessions may own it at a time. Conflicting start requests are rejected
//! rather than queued; the caller must stop the active session first.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Which session currently owns the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Idle,
    /// rtl_433 sensor decoding.
    Decoding,
    /// rtl_fm demodulated audio.
    AudioStreaming,
    /// rtl_sdr raw I/Q for the spectrum engine.
    SpectrumAnalyzing,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Decoding => "decoding",
            Self::AudioStreaming => "audio streaming",
            Self::SpectrumAnalyzing => "spectrum analysis",
        };
        f.write_str(name)
    }
}

/// Successful result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session was started.
    Started,
    /// The requested session was already running; nothing changed.
    AlreadyActive,
}

/// Decide whether `requested` may start while `active` owns the receiver.
///
/// Returns `Started` when the receiver is idle, `AlreadyActive` when the same
/// session is already running, and `Conflict` otherwise.
pub fn admit(active: SessionKind, requested: SessionKind) -> Result<StartOutcome> {
    if active == SessionKind::Idle {
        Ok(StartOutcome::Started)
    } else if active == requested {
        Ok(StartOutcome::AlreadyActive)
    } else {
        Err(SessionError::Conflict { active, requested })
    }
}
