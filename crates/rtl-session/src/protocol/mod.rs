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

//! Protocol layer for decoder output.
//!
//! The decoding tool emits one JSON object per line. Each object becomes a
//! [`DecodedEvent`]: a small typed envelope of well-known fields plus an open
//! side-table for everything else, so fields added by newer decoder releases
//! pass through untouched.

mod rtl433;

pub use rtl433::{parse_timestamp, Rtl433Parser};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while parsing one line of decoder output.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid UTF-8")]
    InvalidUtf8,

    #[error("not JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// A scalar value from a decoded payload.
///
/// `Nested` keeps arrays and objects that some decoders emit (e.g. raw bit
/// rows) instead of dropping them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Nested(serde_json::Value),
}

impl FieldValue {
    /// Convert a JSON value. `null` has no representation and yields `None`.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::Text(s)),
            other @ (Value::Array(_) | Value::Object(_)) => Some(Self::Nested(other)),
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss, reason = "sensor readings fit comfortably")]
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Nested(v) => write!(f, "{v}"),
        }
    }
}

/// One successfully parsed line of decoder output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedEvent {
    /// Reception time reported by the decoder, or parse time if absent/invalid.
    pub time: DateTime<Utc>,
    /// Sensor model, e.g. `Acurite-Tower`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sensor id (numeric or text depending on the model).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<FieldValue>,
    /// Sensor channel (numeric or a letter).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_ok: Option<bool>,
    /// Every other field, keyed by the decoder's field name.
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl DecodedEvent {
    /// Look up a side-table field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Stable key identifying the physical sensor: `model_id[_channel]`.
    #[must_use]
    pub fn device_key(&self) -> String {
        let model = self.model.as_deref().unwrap_or("Unknown");
        let id = self
            .id
            .as_ref()
            .map_or_else(|| "0".to_string(), ToString::to_string);

        match &self.channel {
            Some(channel) => format!("{model}_{id}_{channel}"),
            None => format!("{model}_{id}"),
        }
    }
}

/// Trait for line protocol parsers.
pub trait Protocol {
    /// The message type produced by this parser.
    type Message;
    /// The error type for parsing failures.
    type Error;

    /// Parse one line of input.
    ///
    /// Returns `Ok(Some(message))` if parsing succeeded,
    /// `Ok(None)` if the line carries no message (e.g. blank),
    /// or `Err(error)` if parsing failed.
    fn parse(&mut self, input: &[u8]) -> Result<Option<Self::Message>, Self::Error>;
}
