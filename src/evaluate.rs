//! Execution orchestration for one request
//!
//! Staging (workspace + artifact) -> Launching (pty spawn) -> Running, where
//! the output reader and the process waiter run concurrently and the waiter
//! is raced against the deadline. Whatever happens, exactly one exit message
//! is sent, after all output the reader forwarded.

use nix::unistd::Pid;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{error, info, warn};

use crate::cache::ArtifactCache;
use crate::error::{EvalError, EvalResult};
use crate::protocol::{clamp_timeout, ExecutionOutcome, Request, StreamMessage};
use crate::runner::pty::{terminate, PtyProcess};
use crate::runner::stream::spawn_reader;
use crate::runner::{exit_code, signal_exit_code, LaunchSpec};
use crate::workspace::Workspace;

/// How long the reader may keep draining once the process group is dead
const READER_GRACE: Duration = Duration::from_millis(200);

/// How a request ended
#[derive(Debug)]
enum Termination {
    /// The process exited on its own, with any status
    Completed(i32),
    /// The deadline fired and the process was killed
    TimedOut(i32),
    /// The program could not be run, or its supervision broke down
    Failed(EvalError),
}

impl Termination {
    fn into_outcome(self) -> ExecutionOutcome {
        match self {
            Termination::Completed(code) | Termination::TimedOut(code) => {
                ExecutionOutcome::exited(code)
            }
            Termination::Failed(e) => ExecutionOutcome::failed(e.to_string()),
        }
    }
}

pub struct Evaluator {
    cache: Arc<ArtifactCache>,
    max_timeout_ms: u64,
    isolate_network: bool,
}

impl Evaluator {
    pub fn new(cache: Arc<ArtifactCache>, max_timeout_ms: u64, isolate_network: bool) -> Self {
        Self {
            cache,
            max_timeout_ms,
            isolate_network,
        }
    }

    pub fn max_timeout_ms(&self) -> u64 {
        self.max_timeout_ms
    }

    /// Run `request`, streaming into `outbox`, and finish with its exit message
    pub async fn execute(
        &self,
        session_id: u64,
        request: Request,
        outbox: mpsc::Sender<StreamMessage>,
    ) -> ExecutionOutcome {
        info!(
            "Session {}: executing version={}, files={}, timeout={}ms",
            session_id,
            request.version,
            request.files.len(),
            request.timeout
        );

        let termination = self.run(&request, &outbox).await;
        match &termination {
            Termination::Completed(code) => {
                info!("Session {}: exited with code {}", session_id, code)
            }
            Termination::TimedOut(code) => {
                info!("Session {}: timed out, killed with code {}", session_id, code)
            }
            Termination::Failed(e) => error!("Session {}: failed execution: {}", session_id, e),
        }

        let outcome = termination.into_outcome();
        if outbox.send(StreamMessage::exit(&outcome)).await.is_err() {
            warn!("Session {}: failed to deliver exit message", session_id);
        }
        outcome
    }

    async fn run(&self, request: &Request, outbox: &mpsc::Sender<StreamMessage>) -> Termination {
        // Staging
        let workspace = match Workspace::build(&request.files).await {
            Ok(workspace) => workspace,
            Err(e) => return Termination::Failed(e),
        };
        let artifact = match self.cache.resolve(&request.version).await {
            Ok(path) => path,
            Err(e) => return Termination::Failed(e),
        };

        let timeout = clamp_timeout(request.timeout, self.max_timeout_ms);
        if timeout.is_zero() {
            return Termination::TimedOut(signal_exit_code(libc::SIGKILL));
        }

        // Launching
        let spec = LaunchSpec::interpreter(&artifact, &request.code, workspace.path())
            .with_network_isolation(self.isolate_network);
        let process = match PtyProcess::spawn(&spec) {
            Ok(process) => process,
            Err(e) => return Termination::Failed(e),
        };

        // Running; the workspace outlives the process
        let termination = supervise(process, timeout, outbox.clone()).await;
        drop(workspace);
        termination
    }
}

/// Race process exit against the deadline, then join the reader
async fn supervise(
    process: PtyProcess,
    timeout: Duration,
    outbox: mpsc::Sender<StreamMessage>,
) -> Termination {
    let PtyProcess {
        mut child,
        master,
        pid,
    } = process;
    let deadline = Instant::now() + timeout;

    let mut reader = match spawn_reader(master, outbox) {
        Ok(reader) => reader,
        Err(e) => {
            terminate(pid);
            return Termination::Failed(e);
        }
    };
    let mut waiter = tokio::spawn(async move { child.wait().await });

    tokio::select! {
        waited = &mut waiter => {
            let status = match wait_result(waited) {
                Ok(status) => status,
                Err(e) => return join_after_failure(pid, reader, e).await,
            };

            // Descendants may still hold the terminal open
            let drained = match timeout_at(deadline, &mut reader).await {
                Ok(joined) => reader_result(joined),
                Err(_) => {
                    warn!("Process {} exited but its terminal is still open; killing group", pid);
                    terminate(pid);
                    join_reader(reader).await
                }
            };

            match drained {
                Ok(()) => Termination::Completed(exit_code(&status)),
                Err(e) => Termination::Failed(e),
            }
        }
        _ = sleep_until(deadline) => {
            terminate(pid);
            let waited = waiter.await;

            if let Err(e) = join_reader(reader).await {
                warn!("Output stream ended with error after timeout: {}", e);
            }

            match wait_result(waited) {
                Ok(status) => Termination::TimedOut(exit_code(&status)),
                Err(e) => Termination::Failed(e),
            }
        }
    }
}

/// Join the reader after the group was killed. A process that left the group
/// can keep the terminal open, so the reader gets `READER_GRACE` before it is
/// cancelled. Either way its `outbox` handle is gone when this returns.
async fn join_reader(mut reader: JoinHandle<EvalResult<usize>>) -> EvalResult<()> {
    match tokio::time::timeout(READER_GRACE, &mut reader).await {
        Ok(joined) => reader_result(joined),
        Err(_) => {
            warn!("Terminal held open by a detached process; dropping its output");
            reader.abort();
            match reader.await {
                Err(e) if e.is_cancelled() => Ok(()),
                joined => reader_result(joined),
            }
        }
    }
}

/// The waiter broke; take the group down so the reader reaches end-of-stream
async fn join_after_failure(
    pid: Pid,
    reader: JoinHandle<EvalResult<usize>>,
    err: EvalError,
) -> Termination {
    terminate(pid);
    if let Err(e) = join_reader(reader).await {
        warn!("Output reader failed: {}", e);
    }
    Termination::Failed(err)
}

fn reader_result(joined: Result<EvalResult<usize>, JoinError>) -> EvalResult<()> {
    match joined {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(EvalError::StreamError(e.to_string())),
    }
}

fn wait_result(waited: Result<io::Result<ExitStatus>, JoinError>) -> EvalResult<ExitStatus> {
    match waited {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(e)) => Err(EvalError::WaitFailed(e.to_string())),
        Err(e) => Err(EvalError::WaitFailed(e.to_string())),
    }
}
