//! Non-fatal findings reported alongside the record stream.
//!
//! Components never log correlation or parse problems through a global logger
//! directly; they are handed a [`DiagnosticSink`] at construction so callers
//! (and tests) decide where findings go.

use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// No listening identity was recorded for a connection's destination port.
    PortResolutionMissing,
    /// More than one listening identity was recorded for the destination port.
    PortResolutionAmbiguous,
    /// A line of tracer output did not match the expected column layout.
    SkippedLine,
    /// A whole collection failed; `detail` holds the captured diagnostic text.
    CollectionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub summary: String,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            summary: summary.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.summary, self.detail)
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Sink that forwards every finding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.kind {
            DiagnosticKind::CollectionFailed => {
                tracing::error!("{}\n{}", diagnostic.summary, diagnostic.detail)
            }
            DiagnosticKind::SkippedLine => {
                tracing::debug!("{}: {}", diagnostic.summary, diagnostic.detail)
            }
            _ => tracing::warn!("{}: {}", diagnostic.summary, diagnostic.detail),
        }
    }
}

/// Sink that keeps every finding in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.lock())
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.lock().iter().filter(|d| d.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Diagnostic>> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, diagnostic: Diagnostic) {
        self.lock().push(diagnostic);
    }
}

pub type SharedSink = Arc<dyn DiagnosticSink>;
