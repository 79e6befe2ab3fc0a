//! Subprocess handle with process-tree termination.
//!
//! Every child is started as the leader of its own process group (a new
//! process group on Windows), so a timeout can take down the whole tree it
//! spawned rather than only the direct child. The platform backend is chosen
//! at compile time.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::InvocationDescriptor;
use crate::error::{ExecError, ExecResult};

/// How long to wait for the killed leader to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long output readers may lag behind process exit.
const READER_GRACE: Duration = Duration::from_secs(2);
/// Per-stream capture cap; older output is dropped first.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// How a waited-on process ended.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    /// `None` when the process could not be reaped after a kill.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessExit {
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut buf = buf.lock().unwrap_or_else(|p| p.into_inner());
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.len() > MAX_CAPTURE_BYTES {
                                let excess = buf.len() - MAX_CAPTURE_BYTES;
                                buf.drain(..excess);
                            }
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Wait up to `grace` for the reader to hit EOF.
    async fn settle(&mut self, grace: Duration) -> bool {
        match self.task.as_mut() {
            None => true,
            Some(task) => {
                if timeout(grace, task).await.is_ok() {
                    self.task = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let buf = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// A running category subprocess. Dropping it before `wait` completes
/// kills the whole tree.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    program: String,
    stdout: Capture,
    stderr: Capture,
    waited: bool,
}

impl ProcessHandle {
    /// Start `invocation` with piped output in its own process group.
    pub fn spawn(invocation: &InvocationDescriptor) -> ExecResult<Self> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        platform::isolate(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(pid = ?pid, command = %invocation, "spawned");
        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());
        Ok(Self {
            child,
            pid,
            program: invocation.program.clone(),
            stdout,
            stderr,
            waited: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the whole tree to exit.
    pub async fn terminate(&mut self) -> ExecResult<()> {
        match self.pid {
            Some(pid) => platform::signal_tree(pid, false).await,
            None => Ok(()),
        }
    }

    /// Forcibly kill the whole tree, then the leader itself.
    pub async fn kill_tree(&mut self) -> ExecResult<()> {
        let group = match self.pid {
            Some(pid) => platform::signal_tree(pid, true).await,
            None => Ok(()),
        };
        if let Err(e) = self.child.start_kill() {
            debug!(program = %self.program, error = %e, "leader already gone");
        }
        group
    }

    /// Wait for exit. At `limit` the tree is killed and the exit is marked
    /// timed out.
    pub async fn wait(mut self, limit: Duration) -> ExecResult<ProcessExit> {
        let (status, timed_out) = match timeout(limit, self.child.wait()).await {
            Ok(status) => (Some(status?), false),
            Err(_) => {
                warn!(
                    program = %self.program,
                    pid = ?self.pid,
                    limit_ms = limit.as_millis() as u64,
                    "timeout, killing process tree"
                );
                if let Err(e) = self.kill_tree().await {
                    warn!(error = %e, "process tree kill reported an error");
                }
                let status = timeout(KILL_GRACE, self.child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                (status, true)
            }
        };

        // Descendants that outlive the leader keep the pipes open.
        let settled = self.stdout.settle(READER_GRACE).await & self.stderr.settle(READER_GRACE).await;
        if !settled {
            if let Some(pid) = self.pid {
                debug!(pid, "reaping descendants still holding output pipes");
                if let Err(e) = platform::signal_tree(pid, true).await {
                    debug!(error = %e, "descendant kill failed");
                }
            }
            self.stdout.settle(READER_GRACE).await;
            self.stderr.settle(READER_GRACE).await;
        }

        self.waited = true;
        Ok(ProcessExit {
            status,
            timed_out,
            stdout: self.stdout.finish(),
            stderr: self.stderr.finish(),
        })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.waited {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };
        // kill_on_drop only reaches the leader.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(pid, program = %self.program, "handle dropped, killing process tree");
                runtime.spawn(async move {
                    if let Err(e) = platform::signal_tree(pid, true).await {
                        warn!(pid, error = %e, "failed to kill dropped process tree");
                    }
                });
            }
            Err(_) => warn!(pid, "handle dropped outside a runtime, process tree left running"),
        }
    }
}

#[cfg(unix)]
mod platform {
    use tokio::process::Command;

    use crate::error::{ExecError, ExecResult};

    pub(super) fn isolate(cmd: &mut Command) {
        cmd.process_group(0);
    }

    /// Signal every process in the group led by `pid`.
    pub(super) async fn signal_tree(pid: u32, force: bool) -> ExecResult<()> {
        let signal = if force { "-KILL" } else { "-TERM" };
        let output = Command::new("kill")
            .args([signal, "--", &format!("-{pid}")])
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such process") {
            Ok(())
        } else {
            Err(ExecError::Kill {
                pid,
                reason: stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(windows)]
mod platform {
    use tokio::process::Command;

    use crate::error::{ExecError, ExecResult};

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub(super) fn isolate(cmd: &mut Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    /// `taskkill /T` walks the child tree of `pid`.
    pub(super) async fn signal_tree(pid: u32, force: bool) -> ExecResult<()> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/T"];
        if force {
            args.push("/F");
        }
        args.extend(["/PID", pid_arg.as_str()]);
        let output = Command::new("taskkill").args(&args).output().await?;
        if output.status.success() || output.status.code() == Some(128) {
            Ok(())
        } else {
            Err(ExecError::Kill {
                pid,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
