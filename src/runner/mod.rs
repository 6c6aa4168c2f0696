//! Runner module - launching the interpreter on a pseudo-terminal
//!
//! - `LaunchSpec`: what to run, where, and with which isolation
//! - `pty`: spawning on a pseudo-terminal and forced termination
//! - `stream`: the reader that forwards terminal output
//!
//! The runner module does NOT:
//! - Decide timeouts or race them (see `evaluate`)
//! - Know about caching or workspaces

pub mod pty;
pub mod stream;

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crate::protocol::FAILURE_EXIT_CODE;

/// Exit code reported for a process killed by `signal`
pub fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}

/// Exit code of a finished process; signals map to `128 + signal`.
/// A status carrying neither is reported as a failure.
pub fn exit_code(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => signal_exit_code(signal),
        (None, None) => FAILURE_EXIT_CODE,
    }
}

/// Launch description for one execution
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Program path
    pub program: PathBuf,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory
    pub work_dir: PathBuf,
    /// Run in a fresh network namespace where supported
    pub isolate_network: bool,
}

impl LaunchSpec {
    pub fn new(program: impl AsRef<Path>, work_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            work_dir: work_dir.as_ref().to_path_buf(),
            isolate_network: false,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_network_isolation(mut self, enabled: bool) -> Self {
        self.isolate_network = enabled;
        self
    }

    /// Run `code` with the interpreter at `artifact`
    #[cfg(target_os = "linux")]
    pub fn interpreter(artifact: &Path, code: &str, work_dir: &Path) -> Self {
        Self::new(artifact, work_dir).with_args(["-e", code])
    }

    /// Elsewhere the interpreter cannot run; echo the code back instead
    #[cfg(not(target_os = "linux"))]
    pub fn interpreter(_artifact: &Path, code: &str, work_dir: &Path) -> Self {
        Self::new("/bin/echo", work_dir).with_args([code])
    }
}
