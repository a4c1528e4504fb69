//! Error types for collection and serialization.
//!
//! Collection errors stop at the collector boundary: [`crate::collect::Collector::collect`]
//! only returns `Err` for precondition failures, everything else is folded into a
//! failed [`crate::records::CollectionResult`]. Serialization errors always abort the
//! whole write.

use std::io;

use thiserror::Error;

/// Errors raised while gathering raw data from an external tool.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("kernel {running} is older than the required {required}")]
    UnsupportedKernel { required: String, running: String },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {stderr}")]
    SubprocessFailed { program: String, stderr: String },

    #[error("malformed output from {program}: {line:?}")]
    MalformedOutput { program: String, line: String },

    #[error("collection was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while writing a CPEL trace file.
#[derive(Error, Debug)]
pub enum CpelError {
    #[error("I/O error while writing trace: {0}")]
    Io(#[from] io::Error),

    #[error("string {0:?} contains a NUL byte and cannot be stored in the string table")]
    InteriorNul(String),

    #[error("{what} does not fit in a 32-bit field")]
    TooLarge { what: &'static str },

    #[error("invalid CPEL data: {0}")]
    Invalid(String),
}
