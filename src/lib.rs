//! Marple library - collectors, correlation and trace output for the `marple`
//! binary.
//!
//! Collectors drive external Linux tracing tools (`perf`, `iosnoop`, `smem`,
//! bcc) under a [`supervisor::Supervisor`], parse their text output and hand
//! back lazily produced records. Scheduling events can be written as CPEL
//! traces, everything else as line-oriented text.
//!
//! # Modules
//!
//! - [`collect`] - one collector per data source
//! - [`correlate`] - joins `tcptracer` connect and accept lines into connections
//! - [`cpel`] - CPEL trace writer and reader
//! - [`output`] - text and treemap export
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use marple::collect::{CollectContext, Collector, SchedulingEvents};
//! use marple::cpel::CpelWriter;
//!
//! let ctx = CollectContext::new(Duration::from_secs(5));
//! let result = SchedulingEvents::new().collect(&ctx)?;
//! if result.succeeded {
//!     CpelWriter::new().write(result.records, Path::new("sched.cpel"))?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod collect;
pub mod config;
pub mod correlate;
pub mod cpel;
pub mod diagnostics;
pub mod error;
pub mod kernel;
pub mod output;
pub mod records;
pub mod supervisor;
pub mod utils;

pub use config::Config;
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, LogSink, MemorySink};
pub use error::{CollectError, CpelError};
pub use records::{
    CollectionResult, DataOptions, EventDatum, PointDatum, SchedEvent, StackDatum, Value,
};
pub use supervisor::{CancelToken, Supervisor};
