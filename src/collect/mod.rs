//! Collectors: one state machine per data source.
//!
//! A collector goes `Created -> Running -> {Completed, Failed}`. The kernel
//! precondition is checked before anything is spawned; once running, the
//! source gathers its raw output and, if that worked, converts it lazily into
//! exactly one record type. Failures past the precondition never escape
//! [`Collector::collect`]: they are reported once to the diagnostics sink and
//! turned into a [`CollectionResult`] with `succeeded == false`.
//!
//! Each source only implements [`DataSource`]; the lifecycle lives in the
//! blanket [`Collector`] implementation so every variant behaves the same.

pub mod iosnoop;
pub mod mallocstacks;
pub mod memleak;
pub mod sched;
pub mod smem;
pub mod stacks;
pub mod tcptracer;

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::config::ToolPaths;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, LogSink, SharedSink};
use crate::error::CollectError;
use crate::kernel;
use crate::records::{CollectionResult, RecordStream};
use crate::supervisor::Supervisor;

pub use iosnoop::DiskLatency;
pub use mallocstacks::MallocStacks;
pub use memleak::Memleak;
pub use sched::SchedulingEvents;
pub use smem::{MemoryGraph, MemoryMode};
pub use stacks::StackTrace;
pub use tcptracer::TcpTracer;

/// Extra time a self-terminating tool gets on top of the collection time.
pub const COMPLETION_SLACK: Duration = Duration::from_secs(10);

/// Budget for post-processing steps such as `perf script`.
pub const POSTPROCESS_BUDGET: Duration = Duration::from_secs(300);

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Created,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorState::Created => "created",
            CollectorState::Running => "running",
            CollectorState::Completed => "completed",
            CollectorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a collector needs from its caller for one `collect()` call.
pub struct CollectContext {
    pub duration: Duration,
    pub supervisor: Supervisor,
    pub diagnostics: SharedSink,
    pub tools: ToolPaths,
    /// Kernel release to check against instead of the running one.
    pub kernel_release: Option<String>,
}

impl CollectContext {
    pub fn new(duration: Duration) -> Self {
        CollectContext {
            duration,
            supervisor: Supervisor::default(),
            diagnostics: Arc::new(LogSink),
            tools: ToolPaths::default(),
            kernel_release: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: SharedSink) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_kernel_release(mut self, release: impl Into<String>) -> Self {
        self.kernel_release = Some(release.into());
        self
    }

    /// Sleep for `interval`, waking up early if the collection is cancelled.
    pub fn sleep(&self, interval: Duration) -> Result<(), CollectError> {
        let deadline = Instant::now() + interval;
        let cancel = self.supervisor.cancel_token();
        loop {
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn check_kernel(&self, required: &str) -> Result<(), CollectError> {
        match &self.kernel_release {
            Some(release) => kernel::check_release(required, release),
            None => kernel::check_kernel_version(required),
        }
    }
}

/// One data source: how to get its raw output and how to turn it into records.
pub trait DataSource {
    type Raw: Send + 'static;
    type Record: Send + 'static;

    fn name(&self) -> &'static str;

    /// Oldest kernel release the underlying tool works on.
    fn min_kernel(&self) -> &'static str;

    fn gather(&self, ctx: &CollectContext) -> Result<Self::Raw, CollectError>;

    fn transform(&self, raw: Self::Raw, diagnostics: SharedSink) -> RecordStream<Self::Record>;
}

pub trait Collector {
    type Record;

    fn name(&self) -> &'static str;

    /// Run the collection for `ctx.duration`.
    ///
    /// Only the kernel precondition is returned as an error.
    fn collect(&self, ctx: &CollectContext) -> Result<CollectionResult<Self::Record>, CollectError>;
}

fn transition(name: &str, from: CollectorState, to: CollectorState) -> CollectorState {
    tracing::debug!("{} collector: {} -> {}", name, from, to);
    to
}

impl<S: DataSource> Collector for S {
    type Record = S::Record;

    fn name(&self) -> &'static str {
        DataSource::name(self)
    }

    fn collect(&self, ctx: &CollectContext) -> Result<CollectionResult<S::Record>, CollectError> {
        let name = DataSource::name(self);
        let mut state = CollectorState::Created;
        ctx.check_kernel(self.min_kernel())?;

        let window_start = Local::now();
        state = transition(name, state, CollectorState::Running);
        tracing::info!("Collecting {} for {:?}", name, ctx.duration);

        let gathered = self
            .gather(ctx)
            .and_then(|raw| fill_window(ctx, name, window_start).map(|()| raw));
        match gathered {
            Ok(raw) => {
                let window_end = Local::now();
                transition(name, state, CollectorState::Completed);
                let records = self.transform(raw, ctx.diagnostics.clone());
                Ok(CollectionResult::completed(records, window_start, window_end))
            }
            Err(err) => {
                let window_end = Local::now();
                transition(name, state, CollectorState::Failed);
                ctx.diagnostics.report(Diagnostic::new(
                    DiagnosticKind::CollectionFailed,
                    format!("{} collection failed", name),
                    err.to_string(),
                ));
                Ok(CollectionResult::failed(window_start, window_end))
            }
        }
    }
}

/// Sleep out the rest of the collection window after a tool finished early.
///
/// A successful result never covers less than the requested duration.
fn fill_window(
    ctx: &CollectContext,
    name: &str,
    window_start: DateTime<Local>,
) -> Result<(), CollectError> {
    let mut logged = false;
    loop {
        let elapsed = (Local::now() - window_start).to_std().unwrap_or_default();
        let remaining = ctx.duration.saturating_sub(elapsed);
        if remaining.is_zero() {
            return Ok(());
        }
        if !logged {
            tracing::debug!(
                "{} finished after {:?}, waiting {:?} for the window to close",
                name,
                elapsed,
                remaining
            );
            logged = true;
        }
        ctx.sleep(remaining)?;
    }
}

/// Report a line that did not fit the expected layout and move on.
pub(crate) fn skip_line(diagnostics: &dyn DiagnosticSink, source: &str, line: &str) {
    diagnostics.report(Diagnostic::new(
        DiagnosticKind::SkippedLine,
        format!("{}: skipping unexpected line", source),
        line,
    ));
}

/// Whole seconds to pass to tools that take their duration as an argument.
pub(crate) fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
