//! Supervised execution of external tracing tools.
//!
//! Every tool is spawned as the leader of its own process group so that helper
//! processes it forks can be reached by one signal. The caller blocks until the
//! tool exits or its wall-clock budget runs out; in the latter case the whole
//! group gets a single `SIGINT`, followed by a bounded grace period for the tool
//! to flush its output. A group that is still alive after the grace period is
//! killed with `SIGKILL`.
//!
//! Output is captured into anonymous temporary files rather than pipes, so
//! nothing has to drain the child's output while we wait on it.

use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::CollectError;

/// Grace period between the interrupt and the forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a tool is expected to finish, and how to tell success from failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// The tool runs until it is interrupted at the end of its budget.
    ///
    /// `graceful_marker` is printed by the tool's own interrupt handling,
    /// `error_marker` only when it hit a real error.
    Interrupted {
        graceful_marker: &'static str,
        error_marker: &'static str,
    },
    /// The tool is expected to exit on its own, with status 0, within budget.
    RunToCompletion { error_marker: Option<&'static str> },
}

impl Expectation {
    pub const fn completes() -> Self {
        Expectation::RunToCompletion { error_marker: None }
    }
}

/// A structured command line: program, arguments and the expected ending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub expectation: Expectation,
}

impl Invocation {
    pub fn new(program: impl Into<String>, expectation: Expectation) -> Self {
        Invocation {
            program: program.into(),
            args: Vec::new(),
            expectation,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Shared flag that asks a running supervisor to stop its tool early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything observed about one supervised tool run.
#[derive(Debug)]
pub struct SupervisedRun {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The run ended the way its [`Expectation`] describes.
    pub graceful: bool,
    /// The process group was sent `SIGINT` (budget expired or cancelled).
    pub interrupted: bool,
    pub cancelled: bool,
    /// The group outlived the grace period and was sent `SIGKILL`.
    pub killed: bool,
    pub status: ExitStatus,
    pub elapsed: Duration,
}

impl SupervisedRun {
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Turn a non-graceful run into [`CollectError::SubprocessFailed`] and
    /// otherwise hand back stdout as text.
    pub fn into_stdout(self, program: &str) -> Result<String, CollectError> {
        if self.cancelled {
            return Err(CollectError::Cancelled);
        }
        if !self.graceful {
            let stderr = self.stderr_str().trim_end().to_string();
            let stderr = if stderr.is_empty() {
                format!("exited with {}", describe_status(&self.status))
            } else {
                stderr
            };
            return Err(CollectError::SubprocessFailed {
                program: program.to_string(),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&self.stdout).into_owned())
    }
}

fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("status {}", code),
        (None, Some(sig)) => format!("signal {}", sig),
        _ => "unknown status".to_string(),
    }
}

/// Decide whether a finished run counts as graceful.
pub fn classify(
    expectation: &Expectation,
    stderr: &str,
    status: &ExitStatus,
    interrupted: bool,
) -> bool {
    match expectation {
        Expectation::Interrupted {
            graceful_marker,
            error_marker,
        } => {
            if stderr.contains(error_marker) {
                false
            } else if stderr.contains(graceful_marker) {
                true
            } else {
                // Finished on its own before the budget ran out.
                !interrupted && status.success()
            }
        }
        Expectation::RunToCompletion { error_marker } => {
            if interrupted {
                return false;
            }
            if let Some(marker) = error_marker {
                if stderr.contains(marker) {
                    return false;
                }
            }
            status.success()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    grace: Duration,
    cancel: CancelToken,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD, CancelToken::new())
    }
}

impl Supervisor {
    pub fn new(grace: Duration, cancel: CancelToken) -> Self {
        Supervisor { grace, cancel }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Run `invocation` for at most `budget` plus the grace period.
    pub fn run(&self, invocation: &Invocation, budget: Duration) -> Result<SupervisedRun, CollectError> {
        if self.cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }

        let mut stdout_file = tempfile::tempfile()?;
        let mut stderr_file = tempfile::tempfile()?;

        tracing::debug!("Running `{}` with a budget of {:?}", invocation, budget);
        let start = Instant::now();
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(stdout_file.try_clone()?)
            .stderr(stderr_file.try_clone()?)
            .process_group(0)
            .spawn()
            .map_err(|source| CollectError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        // The child leads its own group, so its pid is the group id.
        let pgid = Pid::from_raw(child.id() as i32);

        let deadline = start + budget;
        let mut interrupted = false;
        let mut cancelled = false;
        let mut killed = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            let now = Instant::now();
            cancelled = self.cancel.is_cancelled();
            if cancelled || now >= deadline {
                interrupted = true;
                signal_group(pgid, Signal::SIGINT);
                let (status, was_killed) = self.wait_for_grace(&mut child, pgid)?;
                killed = was_killed;
                break status;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        };
        let elapsed = start.elapsed();

        let stdout = read_captured(&mut stdout_file)?;
        let stderr = read_captured(&mut stderr_file)?;
        let graceful = classify(
            &invocation.expectation,
            &String::from_utf8_lossy(&stderr),
            &status,
            interrupted,
        );
        tracing::debug!(
            "`{}` finished after {:?} ({}, interrupted: {}, killed: {}, graceful: {})",
            invocation.program,
            elapsed,
            describe_status(&status),
            interrupted,
            killed,
            graceful
        );

        Ok(SupervisedRun {
            stdout,
            stderr,
            graceful,
            interrupted,
            cancelled,
            killed,
            status,
            elapsed,
        })
    }

    fn wait_for_grace(&self, child: &mut Child, pgid: Pid) -> Result<(ExitStatus, bool), CollectError> {
        let deadline = Instant::now() + self.grace;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((status, false));
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("Process group {} ignored SIGINT, killing it", pgid);
                signal_group(pgid, Signal::SIGKILL);
                return Ok((child.wait()?, true));
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) => tracing::debug!("Sent {} to process group {}", signal, pgid),
        // The group already went away on its own.
        Err(Errno::ESRCH) => {}
        Err(err) => tracing::warn!("Failed to send {} to process group {}: {}", signal, pgid, err),
    }
}

fn read_captured(file: &mut File) -> Result<Vec<u8>, CollectError> {
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buf)?;
    Ok(buf)
}
