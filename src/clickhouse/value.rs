// Copyright 2021 Datafuse Labs
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

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use super::ExecutorError;

/// A single cell returned by the column store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Map(Vec<(String, Value)>),
    Array(Vec<Value>),
}

impl Value {
    /// Decodes a JSON cell using the ClickHouse type name announced in the
    /// result header, e.g. `Map(String, Float64)` or `Nullable(DateTime64(9))`.
    pub fn decode(raw: JsonValue, data_type: &str) -> Result<Self, ExecutorError> {
        let data_type = data_type.trim();
        if let Some(inner) = unwrap_type(data_type, "Nullable") {
            if raw.is_null() {
                return Ok(Value::Null);
            }
            return Value::decode(raw, inner);
        }
        if let Some(inner) = unwrap_type(data_type, "LowCardinality") {
            return Value::decode(raw, inner);
        }
        if let Some(args) = unwrap_type(data_type, "Map") {
            let (_, value_type) = split_type_args(args)
                .ok_or_else(|| decode_error(data_type, "map type needs key and value types"))?;
            return decode_map(raw, data_type, value_type);
        }
        if let Some(inner) = unwrap_type(data_type, "Array") {
            return match raw {
                JsonValue::Array(items) => items
                    .into_iter()
                    .map(|item| Value::decode(item, inner))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                other => Err(decode_error(data_type, &format!("expected array, got {other}"))),
            };
        }
        if data_type.starts_with("DateTime") {
            return decode_timestamp(raw, data_type);
        }
        if data_type.starts_with("Float") {
            return decode_float(raw, data_type);
        }
        if data_type.starts_with("UInt") {
            return decode_integer(raw, data_type, true);
        }
        if data_type.starts_with("Int") {
            return decode_integer(raw, data_type, false);
        }
        if data_type == "Bool" {
            return match raw {
                JsonValue::Bool(flag) => Ok(Value::Bool(flag)),
                other => Err(decode_error(data_type, &format!("expected bool, got {other}"))),
            };
        }
        Ok(Value::from_json(raw))
    }

    /// Best-effort conversion for cells whose type is not modelled explicitly.
    pub fn from_json(raw: JsonValue) -> Self {
        match raw {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(flag) => Value::Bool(flag),
            JsonValue::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Value::Int(value)
                } else if let Some(value) = number.as_u64() {
                    Value::UInt(value)
                } else {
                    Value::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(text) => Value::String(text),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::UInt(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::UInt(value) => i64::try_from(*value).ok(),
            Value::Float(value) if value.is_finite() => Some(value.trunc() as i64),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// NaN and infinities cannot be represented in JSON responses.
    pub fn is_non_finite(&self) -> bool {
        matches!(self, Value::Float(value) if !value.is_finite())
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(flag) => JsonValue::Bool(*flag),
            Value::Int(value) => JsonValue::from(*value),
            Value::UInt(value) => JsonValue::from(*value),
            Value::Float(value) => serde_json::Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(text) => JsonValue::String(text.clone()),
            Value::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
            Value::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn decode_map(raw: JsonValue, data_type: &str, value_type: &str) -> Result<Value, ExecutorError> {
    match raw {
        JsonValue::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, value) in map {
                entries.push((key, Value::decode(value, value_type)?));
            }
            Ok(Value::Map(entries))
        }
        other => Err(decode_error(data_type, &format!("expected object, got {other}"))),
    }
}

fn decode_timestamp(raw: JsonValue, data_type: &str) -> Result<Value, ExecutorError> {
    match raw {
        JsonValue::String(text) => parse_timestamp(&text)
            .map(Value::Timestamp)
            .ok_or_else(|| decode_error(data_type, &format!("invalid timestamp `{text}`"))),
        JsonValue::Number(number) => number
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(Value::Timestamp)
            .ok_or_else(|| decode_error(data_type, &format!("invalid timestamp {number}"))),
        other => Err(decode_error(data_type, &format!("expected timestamp, got {other}"))),
    }
}

/// Accepts the ISO output (`2024-05-01T10:00:00.123Z`) as well as the
/// server's simple format, which is interpreted as UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn decode_float(raw: JsonValue, data_type: &str) -> Result<Value, ExecutorError> {
    match raw {
        JsonValue::Number(number) => number
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| decode_error(data_type, "float out of range")),
        JsonValue::String(text) => match text.as_str() {
            "nan" | "-nan" => Ok(Value::Float(f64::NAN)),
            "inf" | "+inf" => Ok(Value::Float(f64::INFINITY)),
            "-inf" => Ok(Value::Float(f64::NEG_INFINITY)),
            other => other
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|err| decode_error(data_type, &format!("invalid float `{other}`: {err}"))),
        },
        // Denormals are rendered as null unless quoting is enabled.
        JsonValue::Null => Ok(Value::Float(f64::NAN)),
        other => Err(decode_error(data_type, &format!("expected float, got {other}"))),
    }
}

fn decode_integer(raw: JsonValue, data_type: &str, unsigned: bool) -> Result<Value, ExecutorError> {
    let text = match raw {
        JsonValue::Number(number) => number.to_string(),
        // 64 bit integers are quoted by default.
        JsonValue::String(text) => text,
        other => {
            return Err(decode_error(data_type, &format!("expected integer, got {other}")));
        }
    };
    if unsigned {
        text.parse::<u64>()
            .map(Value::UInt)
            .map_err(|err| decode_error(data_type, &format!("invalid integer `{text}`: {err}")))
    } else {
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|err| decode_error(data_type, &format!("invalid integer `{text}`: {err}")))
    }
}

fn unwrap_type<'a>(data_type: &'a str, wrapper: &str) -> Option<&'a str> {
    data_type
        .strip_prefix(wrapper)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

/// Splits `String, Map(String, Float64)` at the first top-level comma.
fn split_type_args(args: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (idx, ch) in args.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return Some((args[..idx].trim(), args[idx + 1..].trim())),
            _ => {}
        }
    }
    None
}

fn decode_error(data_type: &str, message: &str) -> ExecutorError {
    ExecutorError::Decode(format!("cannot decode {data_type}: {message}"))
}
