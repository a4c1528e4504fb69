//! Minimum kernel release checks.
//!
//! Releases such as `5.15.0-91-generic` are split on `.` and `-` and the first
//! three components are compared numerically. Components that do not start with
//! a digit count as zero, missing components as well.

use std::cmp::Ordering;
use std::fmt;

use crate::error::CollectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

fn leading_number(component: &str) -> u32 {
    let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

impl KernelVersion {
    pub fn parse(release: &str) -> Self {
        let mut parts = release
            .trim()
            .split(['.', '-'])
            .map(leading_number)
            .chain(std::iter::repeat(0));
        KernelVersion {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Release string of the running kernel, as reported by `uname -r`.
pub fn running_release() -> Option<String> {
    sysinfo::System::kernel_version()
}

/// Compare `running` against `required`, both given as release strings.
pub fn check_release(required: &str, running: &str) -> Result<(), CollectError> {
    match KernelVersion::parse(running).cmp(&KernelVersion::parse(required)) {
        Ordering::Less => Err(CollectError::UnsupportedKernel {
            required: required.to_string(),
            running: running.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Check the running kernel against `required`.
///
/// If the running release cannot be determined the check passes; the tools
/// themselves will complain if the kernel lacks what they need.
pub fn check_kernel_version(required: &str) -> Result<(), CollectError> {
    match running_release() {
        Some(running) => check_release(required, &running),
        None => {
            tracing::warn!("Could not determine kernel release, skipping check for {}", required);
            Ok(())
        }
    }
}
