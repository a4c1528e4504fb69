//! Collection defaults loaded from a JSON file.
//!
//! Every field is optional; a missing file means built-in defaults. Command
//! line flags override whatever is configured here.
//!
//! ```json
//! {
//!   "duration_secs": 5,
//!   "frequency_hz": 199,
//!   "tools": { "tcptracer": ["sudo", "/usr/share/bcc/tools/tcptracer"] }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::supervisor::{Expectation, Invocation};

const BCC_TOOLS_DIR: &str = "/usr/share/bcc/tools";

/// Program plus leading arguments used to start one external tool.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct ToolCommand(Vec<String>);

impl ToolCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolCommand(argv.into_iter().map(Into::into).collect())
    }

    pub fn program(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// Start an [`Invocation`] of this tool; callers append their own arguments.
    pub fn invocation(&self, expectation: Expectation) -> Invocation {
        Invocation::new(self.program(), expectation).args(self.0.iter().skip(1).cloned())
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub perf: ToolCommand,
    pub iosnoop: ToolCommand,
    pub smem: ToolCommand,
    pub tcptracer: ToolCommand,
    pub mallocstacks: ToolCommand,
    pub memleak: ToolCommand,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            perf: ToolCommand::new(["perf"]),
            iosnoop: ToolCommand::new(["iosnoop"]),
            smem: ToolCommand::new(["smem"]),
            tcptracer: ToolCommand::new([format!("{}/tcptracer", BCC_TOOLS_DIR)]),
            mallocstacks: ToolCommand::new([
                "python3".to_string(),
                format!("{}/mallocstacks.py", BCC_TOOLS_DIR),
            ]),
            memleak: ToolCommand::new([format!("{}/memleak", BCC_TOOLS_DIR)]),
        }
    }
}

impl ToolPaths {
    fn check(&self) -> Result<()> {
        let tools = [
            ("perf", &self.perf),
            ("iosnoop", &self.iosnoop),
            ("smem", &self.smem),
            ("tcptracer", &self.tcptracer),
            ("mallocstacks", &self.mallocstacks),
            ("memleak", &self.memleak),
        ];
        for (name, tool) in tools {
            if tool.is_empty() {
                bail!("Tool command for {} is empty", name);
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Collection time when `--time` is not given.
    pub duration_secs: u64,
    /// Sampling frequency for stack collection.
    pub frequency_hz: u32,
    /// Sample every CPU rather than only the profiled command.
    pub system_wide: bool,
    /// Interval between two memory snapshots.
    pub memgraph_refresh_secs: f64,
    pub memleak_top_stacks: u32,
    /// Time a tool gets to flush its output after being interrupted.
    pub grace_period_ms: u64,
    pub tools: ToolPaths,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            duration_secs: 10,
            frequency_hz: 99,
            system_wide: true,
            memgraph_refresh_secs: 0.5,
            memleak_top_stacks: 10,
            grace_period_ms: 2000,
            tools: ToolPaths::default(),
        }
    }
}

impl Config {
    pub fn from_json(buf: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(buf)?;
        config.check()?;
        Ok(config)
    }

    /// Load `path`, falling back to the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let buf = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Config::from_json(&buf).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn memgraph_refresh(&self) -> Duration {
        Duration::from_secs_f64(self.memgraph_refresh_secs)
    }

    fn check(&self) -> Result<()> {
        if self.frequency_hz == 0 {
            bail!("frequency_hz must be greater than zero");
        }
        if !(self.memgraph_refresh_secs.is_finite() && self.memgraph_refresh_secs >= 0.0) {
            bail!(
                "memgraph_refresh_secs must be a non-negative number, got {}",
                self.memgraph_refresh_secs
            );
        }
        self.tools.check()
    }
}
