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

//! rtl_433 JSON line parser.
//!
//! rtl_433 run with `-F json` prints one object per received packet, e.g.
//! ```text
//! {"time" : "2024-01-01 12:00:00", "model" : "Acurite-Tower", "id" : 1234, "channel" : "A", "battery_ok" : 1, "temperature_C" : 21.5}
//! ```
//! Interleaved status lines ("Tuned to 433.920MHz." and similar) are not JSON
//! and are rejected with a [`ParseError`] for the reader to discard.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use super::{DecodedEvent, FieldValue, ParseError, Protocol};

/// Naive layouts rtl_433 uses depending on its `-M time:` setting.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parser for rtl_433 JSON output.
#[derive(Debug, Default)]
pub struct Rtl433Parser;

impl Rtl433Parser {
    /// Create a new rtl_433 parser.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for Rtl433Parser {
    type Message = DecodedEvent;
    type Error = ParseError;

    fn parse(&mut self, input: &[u8]) -> Result<Option<DecodedEvent>, ParseError> {
        let line = std::str::from_utf8(input).map_err(|_| ParseError::InvalidUtf8)?;
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<Value>(line)? {
            Value::Object(map) => Ok(Some(event_from_map(map))),
            Value::Array(_) => Err(ParseError::NotAnObject("array")),
            Value::String(_) => Err(ParseError::NotAnObject("string")),
            Value::Number(_) => Err(ParseError::NotAnObject("number")),
            Value::Bool(_) => Err(ParseError::NotAnObject("bool")),
            Value::Null => Err(ParseError::NotAnObject("null")),
        }
    }
}

fn event_from_map(map: serde_json::Map<String, Value>) -> DecodedEvent {
    let mut time = None;
    let mut model = None;
    let mut id = None;
    let mut channel = None;
    let mut battery_ok = None;
    let mut fields = BTreeMap::new();

    for (key, value) in map {
        match key.as_str() {
            "time" => time = parse_timestamp(&value),
            "model" => model = value.as_str().map(str::to_string),
            "id" => id = FieldValue::from_json(value),
            "channel" => channel = FieldValue::from_json(value),
            "battery_ok" => match as_flag(&value) {
                Some(flag) => battery_ok = Some(flag),
                None => {
                    if let Some(v) = FieldValue::from_json(value) {
                        fields.insert(key, v);
                    }
                }
            },
            _ => {
                if let Some(v) = FieldValue::from_json(value) {
                    fields.insert(key, v);
                }
            }
        }
    }

    DecodedEvent {
        time: time.unwrap_or_else(Utc::now),
        model,
        id,
        channel,
        battery_ok,
        fields,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

/// Parse a decoder timestamp.
///
/// Accepts RFC 3339 (`2024-01-01T12:00:00Z`), the naive layouts rtl_433
/// prints by default (interpreted as UTC) and Unix seconds as a number or
/// numeric string. Returns `None` for anything else.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in NAIVE_FORMATS {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            s.parse::<f64>().ok().and_then(from_unix_seconds)
        }
        Value::Number(n) => n.as_f64().and_then(from_unix_seconds),
        _ => None,
    }
}

fn from_unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "non-negative and finite, fractional part handled separately"
    )]
    let (whole, nanos) = (secs.trunc() as i64, (secs.fract() * 1e9) as u32);
    DateTime::from_timestamp(whole, nanos)
}
