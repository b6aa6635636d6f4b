// Copyright 2025 coScene
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

// Record model and the derived column schema
//
// A stored row is made of the four base columns followed by one column per
// top-level payload key. The column schema of a stream is never declared:
// it is the union of everything observed so far and only ever grows.

use crate::error::{Result, StatsError};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const CONTEXT_ID: &str = "context_id";
pub const REQUEST_ID: &str = "request_id";
pub const TIMESTAMP: &str = "timestamp";
pub const DATA_KEY: &str = "data_key";

/// Columns present in every stored table, in storage order
pub const BASE_COLUMNS: [(&str, ColumnType); 4] = [
    (CONTEXT_ID, ColumnType::String),
    (REQUEST_ID, ColumnType::Integer),
    (TIMESTAMP, ColumnType::DateTime),
    (DATA_KEY, ColumnType::String),
];

pub fn is_base_column(name: &str) -> bool {
    BASE_COLUMNS.iter().any(|(base, _)| *base == name)
}

/// One telemetry event produced by an instrumentation point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub context_id: String,
    pub request_id: i64,
    #[serde(default = "now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub data_key: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(
        context_id: impl Into<String>,
        request_id: i64,
        data_key: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            request_id,
            timestamp: now(),
            data_key: data_key.into(),
            data,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(6);
        self
    }

    /// Flatten into a row holding every column of `schema`, padding with nulls
    pub fn to_row(&self, schema: &ColumnSchema) -> Result<Map<String, Value>> {
        let mut row = Map::with_capacity(schema.len());
        row.insert(CONTEXT_ID.into(), Value::String(self.context_id.clone()));
        row.insert(REQUEST_ID.into(), Value::from(self.request_id));
        row.insert(TIMESTAMP.into(), Value::String(format_datetime(&self.timestamp)));
        row.insert(DATA_KEY.into(), Value::String(self.data_key.clone()));

        for column in schema.payload_columns() {
            let value = self.data.get(&column.name).unwrap_or(&Value::Null);
            row.insert(
                column.name.clone(),
                column.column_type.coerce(&column.name, value)?,
            );
        }
        Ok(row)
    }

    /// Rebuild a record from a stored row.
    ///
    /// Every payload column of `schema` appears in `data`; columns the row has
    /// no value for come back as `null`.
    pub fn from_row(row: &Map<String, Value>, schema: &ColumnSchema) -> Result<Self> {
        let context_id = match row.get(CONTEXT_ID) {
            Some(Value::String(s)) => s.clone(),
            other => return Err(missing_base(CONTEXT_ID, other)),
        };
        let request_id = match ColumnType::Integer
            .coerce(REQUEST_ID, row.get(REQUEST_ID).unwrap_or(&Value::Null))?
        {
            Value::Number(n) => n.as_i64().unwrap_or_default(),
            other => return Err(missing_base(REQUEST_ID, Some(&other))),
        };
        let timestamp = match row.get(TIMESTAMP) {
            Some(Value::String(s)) => parse_datetime(s)
                .ok_or_else(|| StatsError::schema_conflict(TIMESTAMP, format!("'{}' is not a date/time", s)))?,
            other => return Err(missing_base(TIMESTAMP, other)),
        };
        let data_key = match row.get(DATA_KEY) {
            Some(Value::String(s)) => s.clone(),
            other => return Err(missing_base(DATA_KEY, other)),
        };

        let mut data = Map::new();
        for column in schema.payload_columns() {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            data.insert(
                column.name.clone(),
                column.column_type.coerce(&column.name, value)?,
            );
        }

        Ok(Self {
            context_id,
            request_id,
            timestamp,
            data_key,
            data,
        })
    }
}

/// Current time at the microsecond precision every backend can store
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    DateTime::<Utc>::deserialize(deserializer).map(|dt| dt.trunc_subsecs(6))
}

fn missing_base(column: &str, found: Option<&Value>) -> StatsError {
    StatsError::schema_conflict(column, format!("unexpected stored value {:?}", found))
}

/// Semantic type tag of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    DateTime,
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::DateTime => "datetime",
            ColumnType::Json => "json",
        };
        f.write_str(name)
    }
}

impl ColumnType {
    /// Infer the type of a payload value. `null` carries no type information.
    ///
    /// Strings stay strings even when they look like a date: a DateTime
    /// column would store the instant and lose the original text.
    pub fn infer(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() => Some(ColumnType::Integer),
            Value::Number(_) => Some(ColumnType::Float),
            Value::String(_) => Some(ColumnType::String),
            Value::Array(_) | Value::Object(_) => Some(ColumnType::Json),
        }
    }

    /// Smallest type able to hold values of both `self` and `other`
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }

    /// Convert `value` into this column's representation.
    ///
    /// DateTime values are normalized to RFC 3339 with microseconds, Json
    /// values stored as text are parsed back into structured JSON.
    pub fn coerce(self, column: &str, value: &Value) -> Result<Value> {
        let conflict = || {
            StatsError::schema_conflict(
                column,
                format!("cannot store {} in a {} column", value, self),
            )
        };

        if value.is_null() {
            return Ok(Value::Null);
        }

        match self {
            ColumnType::String => Ok(match value {
                Value::String(_) => value.clone(),
                other => Value::String(other.to_string()),
            }),
            ColumnType::Integer => match value {
                Value::Number(n) if n.is_i64() => Ok(value.clone()),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(Value::from(f as i64))
                    }
                    _ => Err(conflict()),
                },
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| conflict()),
                _ => Err(conflict()),
            },
            ColumnType::Float => match value {
                Value::Number(n) => n.as_f64().map(Value::from).ok_or_else(conflict),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| conflict()),
                _ => Err(conflict()),
            },
            ColumnType::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(conflict()),
                },
                Value::String(s) => match s.trim() {
                    "true" | "1" => Ok(Value::Bool(true)),
                    "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(conflict()),
                },
                _ => Err(conflict()),
            },
            ColumnType::DateTime => match value {
                Value::String(s) => parse_datetime(s)
                    .map(|dt| Value::String(format_datetime(&dt)))
                    .ok_or_else(conflict),
                _ => Err(conflict()),
            },
            ColumnType::Json => match value {
                Value::String(s) => serde_json::from_str(s).map_err(|_| conflict()),
                other => Ok(other.clone()),
            },
        }
    }
}

/// Canonical textual form used for every stored date/time
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC 3339 as well as the `YYYY-MM-DD hh:mm:ss[.f]` form (taken as UTC)
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

/// A type change applied to an existing column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Widening {
    pub column: String,
    pub from: ColumnType,
    pub to: ColumnType,
}

/// Ordered mapping column name -> semantic type, base columns first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    columns: Vec<Column>,
}

impl Default for ColumnSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl ColumnSchema {
    /// Schema holding only the base columns
    pub fn new() -> Self {
        Self {
            columns: BASE_COLUMNS
                .iter()
                .map(|(name, column_type)| Column {
                    name: name.to_string(),
                    column_type: *column_type,
                })
                .collect(),
        }
    }

    /// Build from stored columns (e.g. table introspection); base columns are
    /// always placed first.
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        let mut schema = Self::new();
        for (name, column_type) in columns {
            let name = name.into();
            if is_base_column(&name) {
                continue;
            }
            schema.widen_column(&name, column_type);
        }
        schema
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.column_type)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn payload_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !is_base_column(&c.name))
    }

    /// Columns to parse as date/time when reading back
    pub fn parse_dates(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.column_type == ColumnType::DateTime)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Add `name` or widen its type. Returns the widening if one happened.
    pub fn widen_column(&mut self, name: &str, column_type: ColumnType) -> Option<Widening> {
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(existing) => {
                let widened = existing.column_type.widen(column_type);
                if widened == existing.column_type {
                    return None;
                }
                let widening = Widening {
                    column: name.to_string(),
                    from: existing.column_type,
                    to: widened,
                };
                existing.column_type = widened;
                Some(widening)
            }
            None => {
                self.columns.push(Column {
                    name: name.to_string(),
                    column_type,
                });
                None
            }
        }
    }

    /// Union in the payload keys of `record`.
    ///
    /// Payload keys may not shadow a base column.
    pub fn observe(&mut self, record: &Record) -> Result<Vec<Widening>> {
        if let Some(key) = record.data.keys().find(|k| is_base_column(k)) {
            return Err(StatsError::schema_conflict(
                key.as_str(),
                "payload key collides with a base column",
            ));
        }

        let mut widenings = Vec::new();
        for (key, value) in &record.data {
            if let Some(column_type) = ColumnType::infer(value) {
                if let Some(widening) = self.widen_column(key, column_type) {
                    widenings.push(widening);
                }
            }
        }
        Ok(widenings)
    }

    /// Union of both schemas; `self`'s column order wins
    pub fn merge(&self, other: &ColumnSchema) -> ColumnSchema {
        let mut merged = self.clone();
        for column in &other.columns {
            merged.widen_column(&column.name, column.column_type);
        }
        merged
    }

    /// Every column of `other` is present here with the same type
    pub fn is_superset_of(&self, other: &ColumnSchema) -> bool {
        other
            .columns
            .iter()
            .all(|c| self.get(&c.name) == Some(c.column_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(data: Value) -> Record {
        let Value::Object(map) = data else {
            panic!("payload must be an object");
        };
        Record::new("ctx-1", 1, "actor", map)
    }

    #[test]
    fn test_infer_types() {
        assert_eq!(ColumnType::infer(&json!("node")), Some(ColumnType::String));
        assert_eq!(ColumnType::infer(&json!(3)), Some(ColumnType::Integer));
        assert_eq!(ColumnType::infer(&json!(3.5)), Some(ColumnType::Float));
        assert_eq!(ColumnType::infer(&json!(true)), Some(ColumnType::Boolean));
        assert_eq!(
            ColumnType::infer(&json!("2024-05-01T10:00:00+02:00")),
            Some(ColumnType::String)
        );
        assert_eq!(ColumnType::infer(&json!({"a": 1})), Some(ColumnType::Json));
        assert_eq!(ColumnType::infer(&json!([1, 2])), Some(ColumnType::Json));
        assert_eq!(ColumnType::infer(&Value::Null), None);
    }

    #[test]
    fn test_widen() {
        assert_eq!(ColumnType::Integer.widen(ColumnType::Integer), ColumnType::Integer);
        assert_eq!(ColumnType::Integer.widen(ColumnType::Float), ColumnType::Float);
        assert_eq!(ColumnType::Json.widen(ColumnType::Integer), ColumnType::String);
        assert_eq!(ColumnType::DateTime.widen(ColumnType::String), ColumnType::String);
    }

    #[test]
    fn test_observe_is_idempotent() {
        let mut schema = ColumnSchema::new();
        schema.observe(&record(json!({"flow": "greeting", "turns": 1}))).unwrap();
        let snapshot = schema.clone();
        let widenings = schema
            .observe(&record(json!({"flow": "farewell", "turns": 2})))
            .unwrap();
        assert!(widenings.is_empty());
        assert_eq!(schema, snapshot);
        assert_eq!(schema.len(), BASE_COLUMNS.len() + 2);
    }

    #[test]
    fn test_observe_widens_conflicts_to_string() {
        let mut schema = ColumnSchema::new();
        schema.observe(&record(json!({"label": 7}))).unwrap();
        let widenings = schema.observe(&record(json!({"label": {"x": 1}}))).unwrap();
        assert_eq!(
            widenings,
            vec![Widening {
                column: "label".into(),
                from: ColumnType::Integer,
                to: ColumnType::String
            }]
        );
        assert_eq!(schema.get("label"), Some(ColumnType::String));
    }

    #[test]
    fn test_observe_ignores_nulls() {
        let mut schema = ColumnSchema::new();
        schema.observe(&record(json!({"maybe": null}))).unwrap();
        assert!(!schema.contains("maybe"));
    }

    #[test]
    fn test_observe_rejects_base_column_keys() {
        let mut schema = ColumnSchema::new();
        let err = schema.observe(&record(json!({"timestamp": 1}))).unwrap_err();
        assert!(matches!(err, StatsError::SchemaConflict { .. }));
    }

    #[test]
    fn test_merge_and_superset() {
        let a = ColumnSchema::from_columns([("a", ColumnType::Integer), ("b", ColumnType::String)]);
        let b = ColumnSchema::from_columns([("a", ColumnType::Float), ("c", ColumnType::Boolean)]);
        let merged = a.merge(&b);
        assert_eq!(merged.get("a"), Some(ColumnType::Float));
        assert!(merged.contains("b"));
        assert!(merged.contains("c"));
        assert!(merged.is_superset_of(&b.merge(&a)));
        assert!(!a.is_superset_of(&merged));
        assert_eq!(merged.parse_dates(), vec![TIMESTAMP]);
    }

    #[test]
    fn test_coerce() {
        assert_eq!(ColumnType::String.coerce("c", &json!({"a": 1})).unwrap(), json!("{\"a\":1}"));
        assert_eq!(ColumnType::Integer.coerce("c", &json!("42")).unwrap(), json!(42));
        assert_eq!(ColumnType::Float.coerce("c", &json!(2)).unwrap(), json!(2.0));
        assert_eq!(ColumnType::Boolean.coerce("c", &json!(1)).unwrap(), json!(true));
        assert_eq!(ColumnType::Json.coerce("c", &json!("[1,2]")).unwrap(), json!([1, 2]));
        assert_eq!(
            ColumnType::DateTime.coerce("c", &json!("2024-05-01 10:00:00")).unwrap(),
            json!("2024-05-01T10:00:00.000000Z")
        );
        assert!(ColumnType::Integer.coerce("c", &json!({"a": 1})).is_err());
        assert_eq!(ColumnType::Integer.coerce("c", &Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_row_round_trip_pads_nulls() {
        let mut schema = ColumnSchema::new();
        let first = record(json!({"a": 1, "b": "x"}));
        let second = record(json!({"a": 2, "b": "y", "c": true}));
        schema.observe(&first).unwrap();
        schema.observe(&second).unwrap();

        let row = first.to_row(&schema).unwrap();
        assert_eq!(row.get("c"), Some(&Value::Null));

        let restored = Record::from_row(&row, &schema).unwrap();
        assert_eq!(restored.context_id, first.context_id);
        assert_eq!(restored.request_id, first.request_id);
        assert_eq!(restored.timestamp, first.timestamp);
        assert_eq!(restored.data.get("a"), Some(&json!(1)));
        assert_eq!(restored.data.get("c"), Some(&Value::Null));
    }

    #[test]
    fn test_record_deserializes_without_timestamp() {
        let record: Record = serde_json::from_value(json!({
            "context_id": "ctx",
            "request_id": 3,
            "data_key": "actor",
            "data": {"node": "start"}
        }))
        .unwrap();
        assert_eq!(record.request_id, 3);
        assert_eq!(record.data.get("node"), Some(&json!("start")));
    }

    #[test]
    fn test_deserialized_timestamp_is_truncated_to_micros() {
        let record: Record = serde_json::from_value(json!({
            "context_id": "ctx",
            "request_id": 4,
            "timestamp": "2024-05-01T10:00:00.123456789Z",
            "data_key": "actor"
        }))
        .unwrap();
        assert_eq!(record.timestamp.timestamp_subsec_nanos(), 123_456_000);

        let row = record.to_row(&ColumnSchema::new()).unwrap();
        let restored = Record::from_row(&row, &ColumnSchema::new()).unwrap();
        assert_eq!(restored, record);
    }
}
