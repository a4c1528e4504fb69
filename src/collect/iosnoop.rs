//! Block I/O latency through `iosnoop` from perf-tools.
//!
//! `iosnoop -ts <secs>` traces for the given time and exits. After a banner
//! and a column header it prints one completed I/O per line:
//!
//! ```text
//! STARTs         ENDs           COMM         PID    TYPE DEV      BLOCK        BYTES     LATms
//! 5982800.302061 5982800.302679 supervise    1809   W    202,1    17039600     4096       0.62
//! ```

use std::sync::LazyLock;

use regex::Regex;

use super::{skip_line, whole_seconds, CollectContext, DataSource, COMPLETION_SLACK};
use crate::diagnostics::SharedSink;
use crate::error::CollectError;
use crate::records::{DataOptions, PointDatum, RecordStream};
use crate::supervisor::Expectation;
use crate::utils::OwnedLines;

static IO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<start>\d+\.\d+)\s+(?P<end>\d+\.\d+)\s+(?P<comm>.+?)\s+(?P<pid>\d+)\s+(?P<type>\S+)\s+(?P<dev>\S+)\s+(?P<block>\d+)\s+(?P<bytes>\d+)\s+(?P<lat>\d+(?:\.\d+)?)\s*$",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub struct IoCompletion {
    pub start: f64,
    pub end: f64,
    pub comm: String,
    pub pid: u32,
    pub latency_ms: f64,
}

pub fn parse_io_line(line: &str) -> Option<IoCompletion> {
    let caps = IO_LINE.captures(line)?;
    Some(IoCompletion {
        start: caps["start"].parse().ok()?,
        end: caps["end"].parse().ok()?,
        comm: caps["comm"].to_string(),
        pid: caps["pid"].parse().ok()?,
        latency_ms: caps["lat"].parse().ok()?,
    })
}

fn is_header(line: &str) -> bool {
    line.split_whitespace().next() == Some("STARTs")
}

#[derive(Debug, Default, Clone)]
pub struct DiskLatency;

impl DiskLatency {
    pub fn new() -> Self {
        DiskLatency
    }
}

impl DiskLatency {
    pub fn data_options() -> DataOptions {
        DataOptions::new("Time", "Latency", "s", "ms")
    }
}

impl DataSource for DiskLatency {
    type Raw = String;
    type Record = PointDatum;

    fn name(&self) -> &'static str {
        "disk latency"
    }

    fn min_kernel(&self) -> &'static str {
        "4.0.0"
    }

    fn gather(&self, ctx: &CollectContext) -> Result<String, CollectError> {
        let iosnoop = &ctx.tools.iosnoop;
        let invocation = iosnoop
            .invocation(Expectation::completes())
            .args(["-ts".to_string(), whole_seconds(ctx.duration).to_string()]);
        ctx.supervisor
            .run(&invocation, ctx.duration + COMPLETION_SLACK)?
            .into_stdout(iosnoop.program())
    }

    /// Latency points, timed relative to the start of the first traced I/O.
    fn transform(&self, raw: String, diagnostics: SharedSink) -> RecordStream<PointDatum> {
        let mut in_body = false;
        let mut origin: Option<f64> = None;
        Box::new(OwnedLines::new(raw).filter_map(move |line| {
            let trimmed = line.trim();
            if !in_body {
                in_body = is_header(trimmed);
                return None;
            }
            if trimmed.is_empty() || trimmed.starts_with("Ending tracing") {
                return None;
            }
            let Some(io) = parse_io_line(&line) else {
                skip_line(diagnostics.as_ref(), "iosnoop", &line);
                return None;
            };
            let origin = *origin.get_or_insert(io.start);
            Some(PointDatum {
                time: io.end - origin,
                value: io.latency_ms,
                label: io.comm,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::test_support::{context, fake_tool};
    use crate::collect::Collector;
    use crate::config::ToolPaths;
    use crate::diagnostics::{DiagnosticKind, MemorySink};
    use std::time::Duration;

    const OUTPUT: &str = "\
Tracing block I/O for 1 seconds (buffered)...
STARTs         ENDs           COMM         PID    TYPE DEV      BLOCK        BYTES     LATms
100.000000 100.500000 supervise    1809   W    202,1    17039600     4096       0.62
101.250000 101.750000 kworker/0:1 55 R 8,0 2048 512 12.5
this is not an io line

Ending tracing...
";

    #[test]
    fn test_parse_io_line() {
        let io = parse_io_line("5982800.302061 5982800.302679 supervise    1809   W    202,1    17039600     4096       0.62").unwrap();
        assert_eq!(io.comm, "supervise");
        assert_eq!(io.pid, 1809);
        assert_eq!(io.latency_ms, 0.62);
    }

    #[test]
    fn test_transform_relative_times() {
        let sink = MemorySink::new();
        let points: Vec<_> = DiskLatency.transform(OUTPUT.to_string(), sink.clone()).collect();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, 0.5);
        assert_eq!(points[0].label, "supervise");
        assert_eq!(points[1].time, 1.75);
        assert_eq!(points[1].value, 12.5);
        assert_eq!(points[1].label, "kworker/0:1");
        assert_eq!(sink.count(DiagnosticKind::SkippedLine), 1);
    }

    #[test]
    fn test_no_header_no_points() {
        let sink = MemorySink::new();
        let points: Vec<_> = DiskLatency
            .transform("100.0 100.5 a 1 W 8,0 1 1 0.5\n".to_string(), sink.clone())
            .collect();
        assert!(points.is_empty());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_collect_passes_duration() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!(
            "[ \"$1\" = \"-ts\" ] && [ \"$2\" = \"2\" ] || exit 2\nprintf '%s' '{}'\n",
            OUTPUT
        );
        let tools = ToolPaths {
            iosnoop: fake_tool(dir.path(), "iosnoop", &script),
            ..ToolPaths::default()
        };
        let (ctx, _sink) = context(Duration::from_millis(1500), tools);
        let result = DiskLatency.collect(&ctx).unwrap();
        assert!(result.succeeded);
        assert_eq!(result.records.count(), 2);
    }

    #[test]
    fn test_early_exit_keeps_full_window() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo 'Tracing block I/O for 1 seconds (buffered)...'\n\
            echo 'STARTs ENDs COMM PID TYPE DEV BLOCK BYTES LATms'\n";
        let tools = ToolPaths {
            iosnoop: fake_tool(dir.path(), "iosnoop", script),
            ..ToolPaths::default()
        };
        let duration = Duration::from_secs(2);
        let (ctx, _sink) = context(duration, tools);
        let result = DiskLatency.collect(&ctx).unwrap();
        assert!(result.succeeded);
        assert!(result.window() >= chrono::Duration::from_std(duration).unwrap());
        assert_eq!(result.records.count(), 0);
    }
}
