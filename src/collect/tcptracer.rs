//! Inter-process TCP connections through bcc's `tcptracer`.
//!
//! `tcptracer -tv` runs until interrupted. On Ctrl-C the Python tool dies with
//! a `KeyboardInterrupt` traceback on stderr, which is the expected ending;
//! anything it reports as `ERROR` is a real failure. The connection lines it
//! printed are joined into connection events by [`crate::correlate`].

use super::{CollectContext, DataSource};
use crate::correlate::{correlate, parse_lines};
use crate::diagnostics::SharedSink;
use crate::error::CollectError;
use crate::records::{EventDatum, RecordStream};
use crate::supervisor::Expectation;

const TRACER_EXPECTATION: Expectation = Expectation::Interrupted {
    graceful_marker: "KeyboardInterrupt",
    error_marker: "ERROR",
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpTracerOptions {
    /// Only keep connections in this network namespace.
    pub net_ns: Option<u64>,
}

#[derive(Debug, Default, Clone)]
pub struct TcpTracer {
    options: TcpTracerOptions,
}

impl TcpTracer {
    pub fn new(options: TcpTracerOptions) -> Self {
        TcpTracer { options }
    }
}

impl DataSource for TcpTracer {
    type Raw = String;
    type Record = EventDatum;

    fn name(&self) -> &'static str {
        "IPC"
    }

    fn min_kernel(&self) -> &'static str {
        "4.9.0"
    }

    fn gather(&self, ctx: &CollectContext) -> Result<String, CollectError> {
        let tcptracer = &ctx.tools.tcptracer;
        let invocation = tcptracer.invocation(TRACER_EXPECTATION).arg("-tv");
        ctx.supervisor
            .run(&invocation, ctx.duration)?
            .into_stdout(tcptracer.program())
    }

    fn transform(&self, raw: String, diagnostics: SharedSink) -> RecordStream<EventDatum> {
        let lines = parse_lines(&raw, diagnostics.as_ref());
        Box::new(correlate(lines, self.options.net_ns, diagnostics))
    }
}
