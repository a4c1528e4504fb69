//! Port-based correlation of TCP trace lines into connection events.
//!
//! A connection is observed twice: once by the accepting side, once by the
//! connecting side, each on its own line. The accepting lines tell us which
//! process owns a port; the connecting lines name the port they talk to. Joining
//! the two through the port number gives "who talked to whom".
//!
//! Correlation runs in two passes over the same lines. The build pass records,
//! for every accept line, `(pid, comm)` under its local port in a
//! [`PortRegistry`]. The resolve pass then looks up the destination port of
//! every connect line. Only an unambiguous match becomes an [`EventDatum`];
//! missing and ambiguous matches are reported to the diagnostics sink and
//! dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, SharedSink};
use crate::records::{EventDatum, Value};

/// Number of whitespace-separated columns in a trace line.
pub const COLUMNS: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    Accept,
    Connect,
    Close,
    Other(String),
}

impl ConnectionKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "accept" | "A" => ConnectionKind::Accept,
            "connect" | "C" => ConnectionKind::Connect,
            "close" | "X" => ConnectionKind::Close,
            other => ConnectionKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ConnectionKind::Accept => "accept",
            ConnectionKind::Connect => "connect",
            ConnectionKind::Close => "close",
            ConnectionKind::Other(s) => s,
        }
    }
}

/// One line of tracer output:
/// `time type pid comm ip_version src_addr dst_addr src_port dst_port size netns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLine {
    pub time: u64,
    pub kind: ConnectionKind,
    pub pid: u32,
    pub comm: String,
    pub ip_version: u8,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub size: u64,
    pub net_ns: u64,
}

impl FromStr for ConnectionLine {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != COLUMNS {
            return Err(format!("expected {} columns, found {}", COLUMNS, fields.len()));
        }
        fn num<T: FromStr>(field: &str, name: &str) -> Result<T, String> {
            field
                .parse()
                .map_err(|_| format!("invalid {}: {:?}", name, field))
        }
        Ok(ConnectionLine {
            time: num(fields[0], "time")?,
            kind: ConnectionKind::parse(fields[1]),
            pid: num(fields[2], "pid")?,
            comm: fields[3].to_string(),
            ip_version: num(fields[4], "ip version")?,
            src_addr: fields[5].to_string(),
            dst_addr: fields[6].to_string(),
            src_port: num(fields[7], "source port")?,
            dst_port: num(fields[8], "destination port")?,
            size: num(fields[9], "size")?,
            net_ns: num(fields[10], "net namespace")?,
        })
    }
}

impl fmt::Display for ConnectionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "time: {}  type: {}  source pid: {}  source comm: {}  source port: {}  dest port: {}  net namespace: {}",
            self.time,
            self.kind.as_str(),
            self.pid,
            self.comm,
            self.src_port,
            self.dst_port,
            self.net_ns
        )
    }
}

fn is_column_header(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|first| first.to_ascii_uppercase().starts_with("TIME"))
}

/// Parse raw tracer output into connection lines.
///
/// Everything up to and including the column header is preamble. After it,
/// lines that do not have the expected columns are reported and skipped.
pub fn parse_lines(text: &str, diagnostics: &dyn DiagnosticSink) -> Vec<ConnectionLine> {
    let mut lines = text.lines();
    if !lines.by_ref().any(is_column_header) {
        return Vec::new();
    }
    lines
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.parse::<ConnectionLine>() {
            Ok(parsed) => Some(parsed),
            Err(reason) => {
                diagnostics.report(Diagnostic::new(
                    DiagnosticKind::SkippedLine,
                    format!("IPC: skipping unexpected line ({})", reason),
                    line,
                ));
                None
            }
        })
        .collect()
}

/// `(pid, comm)` of a process.
pub type Identity = (u32, String);

/// Which processes accepted connections on which port.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PortRegistry {
    ports: HashMap<u16, BTreeSet<Identity>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the accept lines of `lines`.
    ///
    /// Accept lines report the listening side, so the port is `src_port`.
    pub fn build<'a>(lines: impl IntoIterator<Item = &'a ConnectionLine>) -> Self {
        let mut registry = PortRegistry::new();
        for line in lines {
            if line.kind == ConnectionKind::Accept {
                registry.insert(line.src_port, (line.pid, line.comm.clone()));
            }
        }
        registry
    }

    pub fn insert(&mut self, port: u16, identity: Identity) {
        self.ports.entry(port).or_default().insert(identity);
    }

    pub fn candidates(&self, port: u16) -> Option<&BTreeSet<Identity>> {
        self.ports.get(&port)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Lazily resolved connection events, see [`correlate`].
pub struct Correlation {
    registry: PortRegistry,
    lines: std::vec::IntoIter<ConnectionLine>,
    diagnostics: SharedSink,
}

impl Correlation {
    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    fn resolve(&self, line: ConnectionLine) -> Option<EventDatum> {
        let candidates = self.registry.candidates(line.dst_port);
        let (dest_pid, dest_comm) = match candidates.map(|c| c.len()).unwrap_or(0) {
            0 => {
                self.diagnostics.report(Diagnostic::new(
                    DiagnosticKind::PortResolutionMissing,
                    "IPC: could not find destination port identity",
                    line.to_string(),
                ));
                return None;
            }
            1 => candidates?.iter().next()?.clone(),
            _ => {
                let listed: Vec<String> = candidates?
                    .iter()
                    .map(|(pid, comm)| format!("({}, {})", pid, comm))
                    .collect();
                self.diagnostics.report(Diagnostic::new(
                    DiagnosticKind::PortResolutionAmbiguous,
                    "IPC: too many destination candidates",
                    format!("{}  candidates: [{}]", line, listed.join(", ")),
                ));
                return None;
            }
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("source_pid".to_string(), Value::from(line.pid));
        attributes.insert("source_comm".to_string(), Value::from(line.comm));
        attributes.insert("source_port".to_string(), Value::from(line.src_port));
        attributes.insert("dest_pid".to_string(), Value::from(dest_pid));
        attributes.insert("dest_comm".to_string(), Value::from(dest_comm));
        attributes.insert("dest_port".to_string(), Value::from(line.dst_port));
        attributes.insert("size".to_string(), Value::from(line.size));
        attributes.insert("net_ns".to_string(), Value::from(line.net_ns));
        Some(EventDatum {
            time: line.time,
            event_type: line.kind.as_str().to_string(),
            participants: vec![("source".to_string(), "dest".to_string())],
            attributes,
        })
    }
}

impl Iterator for Correlation {
    type Item = EventDatum;

    fn next(&mut self) -> Option<EventDatum> {
        while let Some(line) = self.lines.next() {
            if line.kind != ConnectionKind::Connect {
                continue;
            }
            if let Some(event) = self.resolve(line) {
                return Some(event);
            }
        }
        None
    }
}

/// Correlate `lines`, keeping only those in `net_ns` if a namespace is given.
///
/// The registry is fully built before the first event is resolved.
pub fn correlate(
    mut lines: Vec<ConnectionLine>,
    net_ns: Option<u64>,
    diagnostics: SharedSink,
) -> Correlation {
    if let Some(ns) = net_ns {
        lines.retain(|line| line.net_ns == ns);
    }
    let registry = PortRegistry::build(&lines);
    tracing::debug!(
        "Port registry has {} ports from {} lines",
        registry.len(),
        lines.len()
    );
    Correlation {
        registry,
        lines: lines.into_iter(),
        diagnostics,
    }
}
