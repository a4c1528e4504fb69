//! Canonical records produced by the collectors.
//!
//! Every collector turns the text output of its tool into exactly one of these
//! record types. They are plain values; nothing here refers back to the tool
//! that produced them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;

/// One scheduling event on a named track (usually a CPU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedEvent {
    pub datum: String,
    pub track: String,
    /// Monotonic timestamp in nanoseconds.
    pub time: u64,
    #[serde(rename = "type")]
    pub event_type: String,
}

/// One sampled call stack, outermost frame first.
///
/// `time` is a timestamp for time-ordered samplers and a weight (bytes or
/// sample count) for aggregating tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackDatum {
    pub time: u64,
    pub frames: Vec<String>,
}

/// One scalar sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointDatum {
    /// Seconds since the start of the collection.
    pub time: f64,
    pub value: f64,
    pub label: String,
}

/// Axis labels and units for a series of [`PointDatum`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataOptions {
    pub x_label: String,
    pub y_label: String,
    pub x_units: String,
    pub y_units: String,
}

impl DataOptions {
    pub fn new(x_label: &str, y_label: &str, x_units: &str, y_units: &str) -> Self {
        DataOptions {
            x_label: x_label.to_string(),
            y_label: y_label.to_string(),
            x_units: x_units.to_string(),
            y_units: y_units.to_string(),
        }
    }
}

/// Attribute value attached to an [`EventDatum`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Str(v) => f.write_str(v),
        }
    }
}

/// A generic correlated event.
///
/// `participants` holds `(role, role)` pairs naming the attribute prefixes that
/// are connected, e.g. `("source", "dest")` means `source_pid`/`source_comm`
/// talked to `dest_pid`/`dest_comm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDatum {
    pub time: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub participants: Vec<(String, String)>,
    pub attributes: BTreeMap<String, Value>,
}

impl EventDatum {
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Lazily produced records of a single type.
pub type RecordStream<R> = Box<dyn Iterator<Item = R> + Send>;

/// Outcome of one `collect()` call.
///
/// A failed collection still carries its window bounds but never any records.
pub struct CollectionResult<R> {
    pub records: RecordStream<R>,
    pub window_start: DateTime<Local>,
    pub window_end: DateTime<Local>,
    pub succeeded: bool,
}

impl<R: 'static> CollectionResult<R> {
    pub fn completed(
        records: RecordStream<R>,
        window_start: DateTime<Local>,
        window_end: DateTime<Local>,
    ) -> Self {
        CollectionResult {
            records,
            window_start,
            window_end,
            succeeded: true,
        }
    }

    pub fn failed(window_start: DateTime<Local>, window_end: DateTime<Local>) -> Self {
        CollectionResult {
            records: Box::new(std::iter::empty()),
            window_start,
            window_end,
            succeeded: false,
        }
    }

    pub fn window(&self) -> chrono::Duration {
        self.window_end - self.window_start
    }
}
