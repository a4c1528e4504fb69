//! Memory usage over time through repeated `smem` snapshots.
//!
//! Each snapshot is `smem -c "<mode> pss"`: a title line followed by one
//! `label pss_kib` row per process. `smem` always produces this layout, so any
//! row that does not match it fails the whole collection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

use super::{CollectContext, DataSource};
use crate::diagnostics::SharedSink;
use crate::error::CollectError;
use crate::records::{DataOptions, PointDatum, RecordStream};
use crate::supervisor::Expectation;

/// Budget for a single snapshot.
const SAMPLE_BUDGET: Duration = Duration::from_secs(30);

static SMEM_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?P<label>\S.*?)\s+(?P<memory>\d+)\s*$").unwrap());

/// How processes are labelled in the snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    Command,
    #[default]
    Name,
    Pid,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryMode::Command => "command",
            MemoryMode::Name => "name",
            MemoryMode::Pid => "pid",
        })
    }
}

impl FromStr for MemoryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(MemoryMode::Command),
            "name" => Ok(MemoryMode::Name),
            "pid" => Ok(MemoryMode::Pid),
            other => Err(format!("mode {} not supported", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryGraphOptions {
    pub mode: MemoryMode,
    /// Pause between two snapshots.
    pub refresh: Duration,
}

impl Default for MemoryGraphOptions {
    fn default() -> Self {
        MemoryGraphOptions {
            mode: MemoryMode::Name,
            refresh: Duration::from_millis(500),
        }
    }
}

/// One snapshot: seconds since the start and MiB per label.
pub type Snapshot = (f64, BTreeMap<String, f64>);

/// Parse a single `smem` snapshot into MiB per label.
///
/// Rows sharing a label are summed.
pub fn parse_snapshot(program: &str, text: &str) -> Result<BTreeMap<String, f64>, CollectError> {
    let mut usage = BTreeMap::new();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let caps = SMEM_ROW
            .captures(line)
            .ok_or_else(|| CollectError::MalformedOutput {
                program: program.to_string(),
                line: line.to_string(),
            })?;
        let kib: f64 = caps["memory"]
            .parse()
            .map_err(|_| CollectError::MalformedOutput {
                program: program.to_string(),
                line: line.to_string(),
            })?;
        *usage.entry(caps["label"].to_string()).or_insert(0.0) += kib / 1024.0;
    }
    Ok(usage)
}

#[derive(Debug, Default, Clone)]
pub struct MemoryGraph {
    options: MemoryGraphOptions,
}

impl MemoryGraph {
    pub fn new(options: MemoryGraphOptions) -> Self {
        MemoryGraph { options }
    }

    pub fn data_options() -> DataOptions {
        DataOptions::new("Time", "Memory", "s", "MB")
    }
}

impl DataSource for MemoryGraph {
    type Raw = Vec<Snapshot>;
    type Record = PointDatum;

    fn name(&self) -> &'static str {
        "memory/time"
    }

    fn min_kernel(&self) -> &'static str {
        "2.6.27"
    }

    fn gather(&self, ctx: &CollectContext) -> Result<Vec<Snapshot>, CollectError> {
        let smem = &ctx.tools.smem;
        let invocation = smem
            .invocation(Expectation::completes())
            .args(["-c".to_string(), format!("{} pss", self.options.mode)]);
        let requested = ctx.duration.as_secs_f64();

        let start = Instant::now();
        let mut elapsed = 0.0;
        let mut snapshots = Vec::new();
        while elapsed < requested {
            let output = ctx
                .supervisor
                .run(&invocation, SAMPLE_BUDGET)?
                .into_stdout(smem.program())?;
            snapshots.push((elapsed, parse_snapshot(smem.program(), &output)?));
            ctx.sleep(self.options.refresh)?;
            elapsed = start.elapsed().as_secs_f64();
        }
        tracing::debug!("Took {} memory snapshots", snapshots.len());
        Ok(snapshots)
    }

    fn transform(&self, raw: Vec<Snapshot>, _diagnostics: SharedSink) -> RecordStream<PointDatum> {
        Box::new(raw.into_iter().flat_map(|(time, usage)| {
            usage.into_iter().map(move |(label, value)| PointDatum { time, value, label })
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

    #[test]
    fn test_parse_snapshot_sums_labels() {
        let text = "\
Name                          PSS
firefox                      2048
Web Content                  1024
firefox                      1024
";
        let usage = parse_snapshot("smem", text).unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage["firefox"], 3.0);
        assert_eq!(usage["Web Content"], 1.0);
    }

    #[test]
    fn test_parse_snapshot_rejects_bad_row() {
        let err = parse_snapshot("smem", "Name PSS\nfirefox lots\n").unwrap_err();
        match err {
            CollectError::MalformedOutput { line, .. } => assert_eq!(line, "firefox lots"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [MemoryMode::Command, MemoryMode::Name, MemoryMode::Pid] {
            assert_eq!(mode.to_string().parse::<MemoryMode>(), Ok(mode));
        }
        assert!("rss".parse::<MemoryMode>().is_err());
    }

    #[test]
    fn test_transform_flattens_snapshots() {
        let raw = vec![
            (0.0, BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 2.0)])),
            (0.5, BTreeMap::from([("a".to_string(), 1.5)])),
        ];
        let points: Vec<_> = MemoryGraph::default().transform(raw, MemorySink::new()).collect();
        assert_eq!(
            points,
            vec![
                PointDatum { time: 0.0, value: 1.0, label: "a".to_string() },
                PointDatum { time: 0.0, value: 2.0, label: "b".to_string() },
                PointDatum { time: 0.5, value: 1.5, label: "a".to_string() },
            ]
        );
    }

    #[test]
    fn test_collect_samples_until_duration() {
        let dir = tempfile::tempdir().unwrap();
        let script = "[ \"$1\" = \"-c\" ] && [ \"$2\" = \"pid pss\" ] || exit 2\nprintf 'PID PSS\\n1 1024\\n2 2048\\n'\n";
        let tools = ToolPaths {
            smem: fake_tool(dir.path(), "smem", script),
            ..ToolPaths::default()
        };
        let (ctx, sink) = context(Duration::from_millis(300), tools);
        let graph = MemoryGraph::new(MemoryGraphOptions {
            mode: MemoryMode::Pid,
            refresh: Duration::from_millis(100),
        });
        let result = graph.collect(&ctx).unwrap();
        assert!(result.succeeded);
        assert!(result.window().to_std().unwrap() >= Duration::from_millis(300));
        let points: Vec<_> = result.records.collect();
        assert!(points.len() >= 4);
        assert_eq!(points.len() % 2, 0);
        assert_eq!(points[0].time, 0.0);
        assert!(points.iter().all(|p| p.label == "1" || p.label == "2"));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_malformed_snapshot_fails_collection() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolPaths {
            smem: fake_tool(dir.path(), "smem", "printf 'Name PSS\\nbroken\\n'\n"),
            ..ToolPaths::default()
        };
        let (ctx, sink) = context(Duration::from_millis(300), tools);
        let result = MemoryGraph::default().collect(&ctx).unwrap();
        assert!(!result.succeeded);
        assert_eq!(sink.count(DiagnosticKind::CollectionFailed), 1);
    }
}
