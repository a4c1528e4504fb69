//! Common test utilities for marple integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Write a shell script standing in for a tracing tool and return the
/// command line that runs it.
pub fn fake_tool(dir: &Path, name: &str, body: &str) -> Vec<String> {
    let path = dir.join(format!("{name}.sh"));
    std::fs::write(&path, body).expect("Failed to write fake tool");
    vec!["sh".to_string(), path.display().to_string()]
}

/// Write a config pointing `tool` at `command`.
pub fn write_config(dir: &Path, tool: &str, command: &[String]) -> PathBuf {
    let config = serde_json::json!({
        "grace_period_ms": 1000,
        "memgraph_refresh_secs": 0.2,
        "tools": { tool: command },
    });
    let path = dir.join("config.json");
    std::fs::write(&path, config.to_string()).expect("Failed to write config");
    path
}

pub fn run_marple(args: &[&str], config: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_marple"))
        .args(args)
        .arg("--config")
        .arg(config)
        .output()
        .expect("Failed to run marple")
}

/// Parse a JSON-lines export into its header and records.
pub fn read_export(path: &Path) -> (serde_json::Value, Vec<serde_json::Value>) {
    let text = std::fs::read_to_string(path).expect("Failed to read export");
    let mut lines = text.lines().map(|line| serde_json::from_str(line).expect("Invalid JSON line"));
    let header = lines.next().expect("Export has no header");
    (header, lines.collect())
}
