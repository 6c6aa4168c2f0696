//! Pseudo-terminal process spawning
//!
//! The child becomes a session leader with the terminal's slave side as its
//! controlling terminal and stdio. The parent keeps only the master side.

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

use super::LaunchSpec;
use crate::error::{EvalError, EvalResult};

const TERMINAL_SIZE: Winsize = Winsize {
    ws_row: 24,
    ws_col: 120,
    ws_xpixel: 0,
    ws_ypixel: 0,
};

/// A running child attached to a pseudo-terminal
pub struct PtyProcess {
    pub child: Child,
    /// Master side of the terminal, non-blocking; reads yield combined stdout/stderr
    pub master: File,
    /// Child pid, also its process group id
    pub pid: Pid,
}

impl PtyProcess {
    pub fn spawn(spec: &LaunchSpec) -> EvalResult<Self> {
        let OpenptyResult { master, slave } = openpty(&TERMINAL_SIZE, None)
            .map_err(|e| EvalError::LaunchFailed(format!("openpty: {}", e)))?;
        set_cloexec(&master)?;
        set_cloexec(&slave)?;
        set_nonblocking(&master)?;

        let child = {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .current_dir(&spec.work_dir)
                .stdin(stdio_for(&slave)?)
                .stdout(stdio_for(&slave)?)
                .stderr(Stdio::from(slave))
                .kill_on_drop(true);

            let isolate_network = spec.isolate_network;
            // SAFETY: only async-signal-safe syscalls run between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    attach_terminal()?;
                    isolate(isolate_network)
                });
            }

            cmd.spawn().map_err(|e| {
                EvalError::LaunchFailed(format!("{}: {}", spec.program.display(), e))
            })?
            // `cmd` drops here and closes the parent's copies of the slave
        };

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| EvalError::LaunchFailed("child exited before it was tracked".into()))?;

        debug!("Spawned {:?} as pid {}", spec.program, pid);

        Ok(Self {
            child,
            master: File::from(master),
            pid,
        })
    }
}

/// Kill the whole process group led by `pid`. Failures (already gone) are ignored.
pub fn terminate(pid: Pid) {
    if let Err(e) = killpg(pid, Signal::SIGKILL) {
        debug!("killpg({}) ignored: {}", pid, e);
    }
}

fn stdio_for(slave: &OwnedFd) -> EvalResult<Stdio> {
    slave
        .try_clone()
        .map(Stdio::from)
        .map_err(|e| EvalError::LaunchFailed(format!("dup pty: {}", e)))
}

fn set_cloexec(fd: &OwnedFd) -> EvalResult<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid descriptor owned by `fd` for the duration of the call.
    let rc = unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFD);
        if flags < 0 {
            flags
        } else {
            libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC)
        }
    };
    if rc < 0 {
        return Err(EvalError::LaunchFailed(format!(
            "fcntl: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Only the master is switched; the child's slave descriptors stay blocking
fn set_nonblocking(fd: &OwnedFd) -> EvalResult<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid descriptor owned by `fd` for the duration of the call.
    let rc = unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 {
            flags
        } else {
            libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK)
        }
    };
    if rc < 0 {
        return Err(EvalError::LaunchFailed(format!(
            "fcntl: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// New session with stdin (the slave) as controlling terminal
fn attach_terminal() -> io::Result<()> {
    setsid()?;
    // SAFETY: plain ioctl on fd 0, which is the slave after stdio setup.
    if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn isolate(network: bool) -> io::Result<()> {
    use nix::sched::{unshare, CloneFlags};

    if network {
        unshare(CloneFlags::CLONE_NEWNET)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn isolate(_network: bool) -> io::Result<()> {
    Ok(())
}
