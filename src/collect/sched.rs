//! CPU scheduling events through `perf sched`.
//!
//! `perf sched record -a` runs until it is interrupted at the end of the
//! collection, then `perf sched script` prints one event per line:
//!
//! ```text
//!             perf 21937 [000] 24779.937931:       sched:sched_stat_runtime: comm=perf ...
//! ```
//!
//! Columns are `comm pid [cpu] secs.frac: event:` followed by free-form
//! details, which are ignored.

use std::sync::LazyLock;

use regex::Regex;

use super::{skip_line, CollectContext, DataSource, POSTPROCESS_BUDGET};
use crate::diagnostics::SharedSink;
use crate::error::CollectError;
use crate::records::{RecordStream, SchedEvent};
use crate::supervisor::Expectation;
use crate::utils::{timestamp_to_ns, OwnedLines};

const RECORD_EXPECTATION: Expectation = Expectation::Interrupted {
    graceful_marker: "perf record: Captured and wrote",
    error_marker: "Error:",
};

static SCHED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<comm>.+?)\s+(?P<pid>-?\d+)\s+\[(?P<cpu>\d+)\]\s+(?P<secs>\d+)\.(?P<frac>\d+):\s+(?P<event>\S+):(?:\s|$)",
    )
    .unwrap()
});

#[derive(Debug, Default, Clone)]
pub struct SchedulingEvents;

impl SchedulingEvents {
    pub fn new() -> Self {
        SchedulingEvents
    }
}

/// Parse one line of `perf sched script -F comm,pid,cpu,time,event` output.
pub fn parse_sched_line(line: &str) -> Option<SchedEvent> {
    let caps = SCHED_LINE.captures(line)?;
    let cpu: u32 = caps["cpu"].parse().ok()?;
    let time = timestamp_to_ns(&caps["secs"], &caps["frac"])?;
    Some(SchedEvent {
        datum: format!("{} (pid: {})", caps["comm"].trim(), &caps["pid"]),
        track: format!("cpu {}", cpu),
        time,
        event_type: caps["event"].to_string(),
    })
}

impl DataSource for SchedulingEvents {
    type Raw = String;
    type Record = SchedEvent;

    fn name(&self) -> &'static str {
        "scheduling events"
    }

    fn min_kernel(&self) -> &'static str {
        "2.6.32"
    }

    fn gather(&self, ctx: &CollectContext) -> Result<String, CollectError> {
        let workdir = tempfile::tempdir()?;
        let data = workdir.path().join("perf.data");
        let data = data.display().to_string();
        let perf = &ctx.tools.perf;

        let record = perf
            .invocation(RECORD_EXPECTATION)
            .args(["sched", "record", "-a", "-o", data.as_str()]);
        ctx.supervisor
            .run(&record, ctx.duration)?
            .into_stdout(perf.program())?;

        let script = perf.invocation(Expectation::completes()).args([
            "sched",
            "script",
            "-i",
            data.as_str(),
            "-F",
            "comm,pid,cpu,time,event",
        ]);
        ctx.supervisor
            .run(&script, POSTPROCESS_BUDGET)?
            .into_stdout(perf.program())
    }

    fn transform(&self, raw: String, diagnostics: SharedSink) -> RecordStream<SchedEvent> {
        Box::new(OwnedLines::new(raw).filter_map(move |line| {
            if line.trim().is_empty() {
                return None;
            }
            let event = parse_sched_line(&line);
            if event.is_none() {
                skip_line(diagnostics.as_ref(), "perf sched", &line);
            }
            event
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

    #[test]
    fn test_parse_sched_line() {
        let event = parse_sched_line(
            "            perf 21937 [002] 24779.937931:       sched:sched_stat_runtime: comm=perf pid=21937",
        )
        .unwrap();
        assert_eq!(
            event,
            SchedEvent {
                datum: "perf (pid: 21937)".to_string(),
                track: "cpu 2".to_string(),
                time: 24_779_937_931_000,
                event_type: "sched:sched_stat_runtime".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_comm_with_spaces() {
        let event =
            parse_sched_line("  Web Content 1234 [000] 10.000001: sched:sched_switch: prev_comm=x")
                .unwrap();
        assert_eq!(event.datum, "Web Content (pid: 1234)");
        assert_eq!(event.time, 10_000_001_000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_sched_line("Warning: lost 3 chunks").is_none());
    }

    #[test]
    fn test_transform_skips_bad_lines() {
        let sink = MemorySink::new();
        let raw = "\
     swapper     0 [001] 1.000000: sched:sched_switch: prev_comm=swapper
garbage line

        bash  42 [000] 1.500000: sched:sched_wakeup: comm=bash
"
        .to_string();
        let events: Vec<_> = SchedulingEvents.transform(raw, sink.clone()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].track, "cpu 0");
        assert_eq!(sink.count(DiagnosticKind::SkippedLine), 1);
    }

    #[test]
    fn test_collect_with_fake_perf() {
        let dir = tempfile::tempdir().unwrap();
        let perf = fake_tool(
            dir.path(),
            "perf",
            r#"
if [ "$2" = "record" ]; then
    trap 'echo "[ perf record: Captured and wrote 0.1 MB perf.data ]" >&2; exit 0' INT
    while :; do sleep 0.05; done
fi
echo "    perf 10 [003] 5.000000000: sched:sched_switch: prev_comm=perf"
"#,
        );
        let tools = ToolPaths {
            perf,
            ..ToolPaths::default()
        };
        let (ctx, sink) = context(Duration::from_millis(200), tools);
        let result = SchedulingEvents.collect(&ctx).unwrap();
        assert!(result.succeeded);
        assert!(result.window().to_std().unwrap() >= Duration::from_millis(200));
        let events: Vec<_> = result.records.collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].track, "cpu 3");
        assert!(sink.is_empty());
    }

    #[test]
    fn test_record_error_fails_collection() {
        let dir = tempfile::tempdir().unwrap();
        let perf = fake_tool(
            dir.path(),
            "perf",
            "echo 'Error: No permissions to read /sys/kernel/tracing' >&2\nexit 1\n",
        );
        let tools = ToolPaths {
            perf,
            ..ToolPaths::default()
        };
        let (ctx, sink) = context(Duration::from_millis(200), tools);
        let result = SchedulingEvents.collect(&ctx).unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.records.count(), 0);
        assert_eq!(sink.count(DiagnosticKind::CollectionFailed), 1);
    }
}
