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

//! Device-session arbiter and streaming pipeline for a shared RTL-SDR receiver.
//!
//! One physical receiver is shared by three mutually exclusive sessions, each
//! backed by a supervised external tool:
//!
//! - **Decoding**: `rtl_433` JSON lines, parsed into [`DecodedEvent`]s and
//!   dispatched to registered [`EventSink`]s
//! - **Audio streaming**: `rtl_fm` PCM, pulled in fixed-size chunks through a
//!   [`ByteRelay`]
//! - **Spectrum analysis**: `rtl_sdr` raw I/Q, turned into averaged
//!   [`SpectrumFrame`]s and pushed through a drop-oldest [`BroadcastHub`]
//!
//! # Quick Start
//!
//! [`Gateway`] is the control surface. Build one at startup and share it:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtl_session::{DecodedEvent, Gateway, GatewaySettings, SinkError};
//!
//! # async fn example() -> rtl_session::Result<()> {
//! let gateway = Gateway::new(GatewaySettings::default());
//!
//! gateway.add_event_sink(Arc::new(|event: &DecodedEvent| -> Result<(), SinkError> {
//!     println!("{}: {:?}", event.device_key(), event.fields);
//!     Ok(())
//! }));
//!
//! gateway.start_decoding().await?;
//! // ...
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Using Individual Layers
//!
//! ```
//! use rtl_session::protocol::{Protocol, Rtl433Parser};
//!
//! let mut parser = Rtl433Parser::new();
//! let line = br#"{"time": "2024-01-01 12:00:00", "model": "Acurite-Tower", "id": 1234}"#;
//! if let Ok(Some(event)) = parser.parse(line) {
//!     assert_eq!(event.device_key(), "Acurite-Tower_1234");
//! }
//! ```
//!
//! ```
//! use rtl_session::spectrum::normalize_fft_size;
//! use rtl_session::frequency::parse_frequency;
//!
//! assert_eq!(normalize_fft_size(1000), 512);
//! assert_eq!(parse_frequency("433.92M").unwrap(), 433_920_000);
//! ```

pub mod arbiter;
pub mod audio;
pub mod error;
pub mod frequency;
pub mod gateway;
pub mod hub;
pub mod process;
pub mod protocol;
pub mod reader;
pub mod spectrum;

pub use arbiter::{SessionKind, StartOutcome};
pub use audio::{AudioConfig, AudioStatus, Modulation};
pub use error::{Result, SessionError};
pub use gateway::{DecodeStatus, DecoderConfig, Gateway, GatewaySettings};
pub use hub::{BroadcastHub, DeliveryError, Inbox, Subscriber, SubscriberId};
pub use process::{ProcessSupervisor, ProgramSpec, SupervisorConfig};
pub use protocol::{DecodedEvent, FieldValue, ParseError, Protocol};
pub use reader::{ByteRelay, EventSink, SinkError};
pub use spectrum::{SpectrumConfig, SpectrumFrame, SpectrumMessage, SpectrumStatus, SpectrumUpdate};
