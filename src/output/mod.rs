//! Text export of collected records.
//!
//! The `TraceOutput` trait lets the caller push any record type without
//! knowing the on-disk layout. [`JsonLinesOutput`] writes a JSON header line
//! followed by one JSON object per record; [`treemap`] turns stacks into the
//! semicolon separated rows the treemap view reads.

mod types;
pub mod treemap;

pub use types::*;

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::records::{EventDatum, PointDatum, SchedEvent, StackDatum};

/// Sink for exported records.
pub trait TraceOutput {
    /// Write the export header. Called once, before any record.
    fn write_header(&mut self, header: &ExportHeader) -> Result<()>;

    fn write_sched_event(&mut self, event: &SchedEvent) -> Result<()>;

    fn write_stack(&mut self, stack: &StackDatum) -> Result<()>;

    fn write_point(&mut self, point: &PointDatum) -> Result<()>;

    fn write_event(&mut self, event: &EventDatum) -> Result<()>;

    /// Flush any buffered data to the output
    fn flush(&mut self) -> Result<()>;
}

/// A record that knows which [`TraceOutput`] method writes it.
pub trait ExportRecord {
    fn write_to(&self, out: &mut dyn TraceOutput) -> Result<()>;
}

impl ExportRecord for SchedEvent {
    fn write_to(&self, out: &mut dyn TraceOutput) -> Result<()> {
        out.write_sched_event(self)
    }
}

impl ExportRecord for StackDatum {
    fn write_to(&self, out: &mut dyn TraceOutput) -> Result<()> {
        out.write_stack(self)
    }
}

impl ExportRecord for PointDatum {
    fn write_to(&self, out: &mut dyn TraceOutput) -> Result<()> {
        out.write_point(self)
    }
}

impl ExportRecord for EventDatum {
    fn write_to(&self, out: &mut dyn TraceOutput) -> Result<()> {
        out.write_event(self)
    }
}

/// Write `header` and every record, returning the number of records written.
pub fn export<R, I>(out: &mut dyn TraceOutput, header: &ExportHeader, records: I) -> Result<usize>
where
    R: ExportRecord,
    I: IntoIterator<Item = R>,
{
    out.write_header(header)?;
    let mut written = 0;
    for record in records {
        record.write_to(out)?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

/// One JSON document per line.
pub struct JsonLinesOutput<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesOutput<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesOutput { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, value).context("Failed to encode record")?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> TraceOutput for JsonLinesOutput<W> {
    fn write_header(&mut self, header: &ExportHeader) -> Result<()> {
        self.line(header)
    }

    fn write_sched_event(&mut self, event: &SchedEvent) -> Result<()> {
        self.line(event)
    }

    fn write_stack(&mut self, stack: &StackDatum) -> Result<()> {
        self.line(stack)
    }

    fn write_point(&mut self, point: &PointDatum) -> Result<()> {
        self.line(point)
    }

    fn write_event(&mut self, event: &EventDatum) -> Result<()> {
        self.line(event)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
