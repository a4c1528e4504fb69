//! Outstanding allocations through bcc's `memleak`.
//!
//! `memleak -T <top> <secs> 1` waits for one interval and prints the stacks
//! with the most outstanding bytes, innermost frame first:
//!
//! ```text
//! Attaching to kernel allocators, Ctrl+C to quit.
//! [11:16:33] Top 2 stacks with outstanding allocations:
//!         80 bytes in 5 allocations from stack
//!                  alloc_fdtable+0x3b [kernel]
//!                  expand_files+0x95 [kernel]
//! ```

use std::iter::Peekable;
use std::sync::LazyLock;

use regex::Regex;

use super::{skip_line, whole_seconds, CollectContext, DataSource, COMPLETION_SLACK};
use crate::diagnostics::SharedSink;
use crate::error::CollectError;
use crate::records::{RecordStream, StackDatum};
use crate::supervisor::Expectation;
use crate::utils::OwnedLines;

static STACK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<bytes>\d+) bytes in (?P<allocs>\d+) allocations from stack\s*$").unwrap()
});

static BANNER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(Attaching to |\[\d{2}:\d{2}:\d{2}\] Top )").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemleakOptions {
    /// Number of stacks to report.
    pub top_stacks: u32,
}

impl Default for MemleakOptions {
    fn default() -> Self {
        MemleakOptions { top_stacks: 10 }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Memleak {
    options: MemleakOptions,
}

impl Memleak {
    pub fn new(options: MemleakOptions) -> Self {
        Memleak { options }
    }
}

/// Outstanding bytes of a stack header line.
pub fn parse_stack_header(line: &str) -> Option<u64> {
    STACK_HEADER.captures(line)?["bytes"].parse().ok()
}

fn is_frame(line: &str) -> bool {
    line.starts_with(char::is_whitespace) && !line.trim().is_empty() && parse_stack_header(line).is_none()
}

struct LeakStacks {
    lines: Peekable<OwnedLines>,
    diagnostics: SharedSink,
}

impl Iterator for LeakStacks {
    type Item = StackDatum;

    fn next(&mut self) -> Option<StackDatum> {
        loop {
            let line = self.lines.next()?;
            let trimmed = line.trim();
            if trimmed.is_empty() || BANNER.is_match(trimmed) {
                continue;
            }
            let Some(bytes) = parse_stack_header(&line) else {
                skip_line(self.diagnostics.as_ref(), "memleak", &line);
                continue;
            };

            let mut frames = Vec::new();
            while let Some(frame) = self.lines.next_if(|next| is_frame(next)) {
                frames.push(frame.trim().to_string());
            }
            frames.reverse();
            return Some(StackDatum {
                time: bytes,
                frames,
            });
        }
    }
}

impl DataSource for Memleak {
    type Raw = String;
    type Record = StackDatum;

    fn name(&self) -> &'static str {
        "memory leaks"
    }

    fn min_kernel(&self) -> &'static str {
        "4.6.0"
    }

    fn gather(&self, ctx: &CollectContext) -> Result<String, CollectError> {
        let memleak = &ctx.tools.memleak;
        let invocation = memleak.invocation(Expectation::completes()).args([
            "-T".to_string(),
            self.options.top_stacks.to_string(),
            whole_seconds(ctx.duration).to_string(),
            "1".to_string(),
        ]);
        ctx.supervisor
            .run(&invocation, ctx.duration + COMPLETION_SLACK)?
            .into_stdout(memleak.program())
    }

    fn transform(&self, raw: String, diagnostics: SharedSink) -> RecordStream<StackDatum> {
        Box::new(LeakStacks {
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

    const REPORT: &str = "\
Attaching to pid 1234, Ctrl+C to quit.
[11:16:33] Top 2 stacks with outstanding allocations:
\t80 bytes in 5 allocations from stack
\t\t alloc_fdtable+0x3b [kernel]
\t\t expand_files+0x95 [kernel]
\t\t sys_dup2+0x1c [kernel]
\t4096 bytes in 1 allocations from stack
\t\t main+0x10 [a.out]
unexpected trailer
";

    #[test]
    fn test_parse_stack_header() {
        assert_eq!(parse_stack_header("\t80 bytes in 5 allocations from stack"), Some(80));
        assert_eq!(parse_stack_header("\t\t main+0x10 [a.out]"), None);
    }

    #[test]
    fn test_transform_root_first() {
        let sink = MemorySink::new();
        let stacks: Vec<_> = Memleak::default().transform(REPORT.to_string(), sink.clone()).collect();
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].time, 80);
        assert_eq!(
            stacks[0].frames,
            vec![
                "sys_dup2+0x1c [kernel]",
                "expand_files+0x95 [kernel]",
                "alloc_fdtable+0x3b [kernel]",
            ]
        );
        assert_eq!(stacks[1].time, 4096);
        assert_eq!(stacks[1].frames, vec!["main+0x10 [a.out]"]);
        assert_eq!(sink.count(DiagnosticKind::SkippedLine), 1);
    }

    #[test]
    fn test_collect_passes_options() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!(
            "[ \"$1 $2 $3 $4\" = \"-T 3 2 1\" ] || exit 2\nprintf '%s' '{}'\n",
            REPORT
        );
        let tools = ToolPaths {
            memleak: fake_tool(dir.path(), "memleak", &script),
            ..ToolPaths::default()
        };
        let (ctx, _sink) = context(Duration::from_secs(2), tools);
        let result = Memleak::new(MemleakOptions { top_stacks: 3 }).collect(&ctx).unwrap();
        assert!(result.succeeded);
        assert_eq!(result.records.count(), 2);
    }
}
