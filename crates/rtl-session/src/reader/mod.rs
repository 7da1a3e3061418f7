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

//! Stream readers for supervised process output.
//!
//! - [`LineDecoder`]: newline-delimited decoder output, parsed and dispatched
//!   to an observer registry of [`EventSink`]s.
//! - [`ByteRelay`]: pull-based fixed-size chunks of raw output (audio).
//! - [`drain_stderr`]: logs a child's stderr so it can never fill the pipe.
//!
//! All loops take a [`CancellationToken`] and select on it at every read, so a
//! stop request is honoured even while a read is pending.

mod relay;

pub use relay::{ByteRelay, DEFAULT_CHUNK_SIZE};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::hub::SubscriberId;
use crate::protocol::{DecodedEvent, ParseError, Protocol};

/// Failure reported by an [`EventSink`]. Logged, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl From<&str> for SinkError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for SinkError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Consumer of decoded events (persistence, broadcast, message bus...).
pub trait EventSink: Send + Sync {
    fn on_decoded_event(&self, event: &DecodedEvent) -> Result<(), SinkError>;
}

impl<F> EventSink for F
where
    F: Fn(&DecodedEvent) -> Result<(), SinkError> + Send + Sync,
{
    fn on_decoded_event(&self, event: &DecodedEvent) -> Result<(), SinkError> {
        self(event)
    }
}

type Sinks = Vec<(SubscriberId, Arc<dyn EventSink>)>;

/// Ordered observer registry for decoded events.
///
/// Each notification is isolated: a sink that errors or panics is logged and
/// skipped, and delivery continues with the next sink.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Mutex<Sinks>,
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sinks", &self.len())
            .finish()
    }
}

impl SinkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink; it receives events after every previously added sink.
    pub fn add(&self, sink: Arc<dyn EventSink>) -> SubscriberId {
        let id = SubscriberId::new();
        self.lock().push((id, sink));
        id
    }

    pub fn remove(&self, id: SubscriberId) -> bool {
        let mut sinks = self.lock();
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notify every sink in registration order. Returns how many succeeded.
    pub fn dispatch(&self, event: &DecodedEvent) -> usize {
        let snapshot: Sinks = self.lock().clone();
        let mut delivered = 0;

        for (id, sink) in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| sink.on_decoded_event(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => error!("Callback error in sink {}: {}", id, e),
                Err(_) => error!("Sink {} panicked while handling an event", id),
            }
        }

        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sinks> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counters for one run of a [`LineDecoder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Non-empty lines read.
    pub lines: u64,
    /// Lines that parsed into an event and were dispatched.
    pub events: u64,
    /// Lines discarded as non-data.
    pub discarded: u64,
}

/// Reads decoder output line by line and dispatches parsed events.
#[derive(Debug)]
pub struct LineDecoder<P> {
    parser: P,
    sinks: Arc<SinkRegistry>,
}

impl<P> LineDecoder<P>
where
    P: Protocol<Message = DecodedEvent, Error = ParseError>,
{
    #[must_use]
    pub fn new(parser: P, sinks: Arc<SinkRegistry>) -> Self {
        Self { parser, sinks }
    }

    /// Run until the stream closes, a read fails, or `cancel` fires.
    pub async fn run<R>(mut self, reader: R, cancel: CancellationToken) -> ReaderStats
    where
        R: AsyncRead + Unpin,
    {
        info!("Starting decoder output reader");
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let mut stats = ReaderStats::default();

        loop {
            line.clear();
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("Decoder output reader cancelled");
                    break;
                }

                result = reader.read_until(b'\n', &mut line) => match result {
                    Ok(0) => {
                        info!("Decoder output closed");
                        break;
                    }
                    Ok(_) => self.handle_line(&line, &mut stats),
                    Err(e) => {
                        error!("Decoder output reader error: {}", e);
                        break;
                    }
                },
            }
        }

        info!(
            "Decoder output reader stopped ({} events, {} discarded lines)",
            stats.events, stats.discarded
        );
        stats
    }

    fn handle_line(&mut self, line: &[u8], stats: &mut ReaderStats) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        stats.lines += 1;

        match self.parser.parse(line) {
            Ok(Some(event)) => {
                stats.events += 1;
                self.sinks.dispatch(&event);
            }
            Ok(None) => {}
            Err(e) => {
                stats.discarded += 1;
                let preview = String::from_utf8_lossy(&line[..line.len().min(100)]);
                debug!("Non-data output ({}): {}", e, preview.trim_end());
            }
        }
    }
}

/// Log each stderr line of a child at debug level until EOF or cancellation.
pub async fn drain_stderr<R>(stderr: R, name: String, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            result = reader.read_until(b'\n', &mut line) => match result {
                Ok(0) => break,
                Ok(_) => debug!("[{}] {}", name, String::from_utf8_lossy(&line).trim_end()),
                Err(e) => {
                    warn!("Failed reading {} stderr: {}", name, e);
                    break;
                }
            },
        }
    }
}
