//! Metadata written ahead of exported records.

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::records::DataOptions;

/// Kind of records that follow a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    #[serde(rename = "Event Data")]
    EventData,
    #[serde(rename = "Stack Data")]
    StackData,
    #[serde(rename = "Datapoint")]
    Datapoint,
}

/// First line of every text export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportHeader {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub datatype: DataType,
    /// Human readable name of the collector, e.g. "Disk Latency/Time".
    pub interface: String,
    pub succeeded: bool,
    /// Axis labels for point data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_options: Option<DataOptions>,
}

impl ExportHeader {
    pub fn new(datatype: DataType, interface: impl Into<String>) -> Self {
        let now = Local::now();
        ExportHeader {
            start: now,
            end: now,
            datatype,
            interface: interface.into(),
            succeeded: true,
            data_options: None,
        }
    }

    pub fn with_window(mut self, start: DateTime<Local>, end: DateTime<Local>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_data_options(mut self, options: DataOptions) -> Self {
        self.data_options = Some(options);
        self
    }

    pub fn with_succeeded(mut self, succeeded: bool) -> Self {
        self.succeeded = succeeded;
        self
    }
}
