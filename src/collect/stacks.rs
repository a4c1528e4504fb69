//! Sampled call stacks through `perf record -g`.
//!
//! `perf script -F comm,tid,time,ip,sym` prints one block per sample: a header
//! line followed by the call chain, innermost frame first, and a blank line.
//!
//! ```text
//! swapper     0 24779.937931:
//!         ffffffff8106a5a6 native_safe_halt
//!         ffffffff8103a1ef default_idle
//!         ffffffff81000000 start_kernel
//! ```

use std::iter::Peekable;
use std::sync::LazyLock;

use regex::Regex;

use super::{
    skip_line, whole_seconds, CollectContext, DataSource, COMPLETION_SLACK, POSTPROCESS_BUDGET,
};
use crate::diagnostics::SharedSink;
use crate::error::CollectError;
use crate::records::{RecordStream, StackDatum};
use crate::supervisor::Expectation;
use crate::utils::{timestamp_to_ns, OwnedLines};

static SAMPLE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<comm>\S.*?)\s+(?P<tid>\d+)\s+(?P<secs>\d+)\.(?P<frac>\d+):\s*$").unwrap()
});

static FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+(?P<ip>[0-9a-fA-F]+)\s+(?P<sym>.*\S)\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTraceOptions {
    /// Sampling frequency in Hz.
    pub frequency: u32,
    /// Sample every CPU instead of only the `sleep` child.
    pub system_wide: bool,
}

impl Default for StackTraceOptions {
    fn default() -> Self {
        StackTraceOptions {
            frequency: 99,
            system_wide: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct StackTrace {
    options: StackTraceOptions,
}

impl StackTrace {
    pub fn new(options: StackTraceOptions) -> Self {
        StackTrace { options }
    }
}

/// Header of one sample block: `(comm, time in ns)`.
pub fn parse_sample_header(line: &str) -> Option<(String, u64)> {
    let caps = SAMPLE_HEADER.captures(line)?;
    let time = timestamp_to_ns(&caps["secs"], &caps["frac"])?;
    Some((caps["comm"].to_string(), time))
}

fn parse_frame(line: &str) -> Option<String> {
    FRAME.captures(line).map(|caps| caps["sym"].to_string())
}

/// Groups `perf script` lines into one [`StackDatum`] per sample block.
struct SampleBlocks {
    lines: Peekable<OwnedLines>,
    diagnostics: SharedSink,
}

impl Iterator for SampleBlocks {
    type Item = StackDatum;

    fn next(&mut self) -> Option<StackDatum> {
        loop {
            let line = self.lines.next()?;
            if line.trim().is_empty() {
                continue;
            }
            let Some((comm, time)) = parse_sample_header(&line) else {
                skip_line(self.diagnostics.as_ref(), "perf script", &line);
                continue;
            };

            let mut callchain = Vec::new();
            while let Some(sym) = self
                .lines
                .peek()
                .filter(|next| parse_sample_header(next).is_none())
                .and_then(|next| parse_frame(next))
            {
                callchain.push(sym);
                self.lines.next();
            }

            let mut frames = Vec::with_capacity(callchain.len() + 1);
            frames.push(comm);
            frames.extend(callchain.into_iter().rev());
            return Some(StackDatum { time, frames });
        }
    }
}

impl DataSource for StackTrace {
    type Raw = String;
    type Record = StackDatum;

    fn name(&self) -> &'static str {
        "call stacks"
    }

    fn min_kernel(&self) -> &'static str {
        "2.6.32"
    }

    fn gather(&self, ctx: &CollectContext) -> Result<String, CollectError> {
        let workdir = tempfile::tempdir()?;
        let data = workdir.path().join("perf.data").display().to_string();
        let perf = &ctx.tools.perf;

        let mut record = perf.invocation(Expectation::completes()).args([
            "record".to_string(),
            "-F".to_string(),
            self.options.frequency.to_string(),
            "-g".to_string(),
        ]);
        if self.options.system_wide {
            record = record.arg("-a");
        }
        let record = record.args([
            "-o".to_string(),
            data.clone(),
            "--".to_string(),
            "sleep".to_string(),
            whole_seconds(ctx.duration).to_string(),
        ]);
        ctx.supervisor
            .run(&record, ctx.duration + COMPLETION_SLACK)?
            .into_stdout(perf.program())?;

        let script = perf.invocation(Expectation::completes()).args([
            "script",
            "-i",
            data.as_str(),
            "-F",
            "comm,tid,time,ip,sym",
        ]);
        ctx.supervisor
            .run(&script, POSTPROCESS_BUDGET)?
            .into_stdout(perf.program())
    }

    fn transform(&self, raw: String, diagnostics: SharedSink) -> RecordStream<StackDatum> {
        Box::new(SampleBlocks {
            lines: OwnedLines::new(raw).peekable(),
            diagnostics,
        })
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

    const SCRIPT_OUTPUT: &str = "\
swapper     0 24779.937931:
\tffffffff8106a5a6 native_safe_halt
\tffffffff8103a1ef default_idle
\tffffffff81000000 start_kernel

Web Content  4242 24779.938000:
\t7f00dead [unknown]

stray text
perf  7 24779.950000:
";

    fn frames(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_parse_sample_header() {
        assert_eq!(
            parse_sample_header("         swapper     0 24779.937931:"),
            Some(("swapper".to_string(), 24_779_937_931_000))
        );
        assert_eq!(parse_sample_header("\tffffffff8106a5a6 native_safe_halt"), None);
    }

    #[test]
    fn test_transform_blocks_root_first() {
        let sink = MemorySink::new();
        let stacks: Vec<_> = StackTrace::default()
            .transform(SCRIPT_OUTPUT.to_string(), sink.clone())
            .collect();
        assert_eq!(
            stacks,
            vec![
                StackDatum {
                    time: 24_779_937_931_000,
                    frames: frames(&["swapper", "start_kernel", "default_idle", "native_safe_halt"]),
                },
                StackDatum {
                    time: 24_779_938_000_000,
                    frames: frames(&["Web Content", "[unknown]"]),
                },
                StackDatum {
                    time: 24_779_950_000_000,
                    frames: frames(&["perf"]),
                },
            ]
        );
        assert_eq!(sink.count(DiagnosticKind::SkippedLine), 1);
    }

    #[test]
    fn test_collect_passes_options() {
        let dir = tempfile::tempdir().unwrap();
        let perf = fake_tool(
            dir.path(),
            "perf",
            r#"
if [ "$1" = "record" ]; then
    [ "$2 $3 $4 $5" = "-F 49 -g -o" ] || exit 2
    [ "$7 $8 $9" = "-- sleep 1" ] || exit 3
    echo "[ perf record: Captured and wrote 0.01 MB $6 ]" >&2
    exit 0
fi
printf 'bash  12 1.5:\n\t1 main\n\t2 __libc_start_main\n'
"#,
        );
        let tools = ToolPaths {
            perf,
            ..ToolPaths::default()
        };
        let (ctx, sink) = context(Duration::from_millis(200), tools);
        let tracer = StackTrace::new(StackTraceOptions {
            frequency: 49,
            system_wide: false,
        });
        let result = tracer.collect(&ctx).unwrap();
        assert!(result.succeeded);
        let stacks: Vec<_> = result.records.collect();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].frames, frames(&["bash", "__libc_start_main", "main"]));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_record_failure_fails_collection() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolPaths {
            perf: fake_tool(dir.path(), "perf", "echo 'perf_event_paranoid setting is 4' >&2\nexit 255\n"),
            ..ToolPaths::default()
        };
        let (ctx, sink) = context(Duration::from_millis(200), tools);
        let result = StackTrace::default().collect(&ctx).unwrap();
        assert!(!result.succeeded);
        assert_eq!(sink.count(DiagnosticKind::CollectionFailed), 1);
    }
}
