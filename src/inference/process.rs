//! Child process supervision
//!
//! Spawns inference binaries with piped output, drains stderr in the
//! background and terminates them gracefully (SIGTERM, grace period, SIGKILL).

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::inference::EngineError;

/// Default time a child gets to exit after SIGTERM
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Bytes of stderr kept per process (tail)
const STDERR_LIMIT: usize = 64 * 1024;

/// Spawns supervised child processes
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl ProcessSupervisor {
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Spawn `program` with stdout piped and stderr drained in the background
    pub fn spawn(
        &self,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<ProcessHandle, EngineError> {
        tracing::debug!("Spawning {} {:?}", program.display(), args);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| EngineError::ProcessSpawnFailed {
            program: program.to_path_buf(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|mut pipe| {
            let sink = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match pipe.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut text = sink.lock().expect("stderr buffer mutex poisoned");
                            text.push_str(&String::from_utf8_lossy(&buf[..n]));
                            if text.len() > STDERR_LIMIT {
                                let mut cut = text.len() - STDERR_LIMIT;
                                while !text.is_char_boundary(cut) {
                                    cut += 1;
                                }
                                text.drain(..cut);
                            }
                        }
                    }
                }
            })
        });

        tracing::info!("Started {} (PID: {:?})", program.display(), pid);

        Ok(ProcessHandle {
            program: program.to_path_buf(),
            child,
            pid,
            stdout,
            stderr,
            stderr_task,
            exit_status: None,
            terminated: false,
            grace_period: self.grace_period,
        })
    }
}

/// A running (or exited) child process
///
/// Dropping the handle kills a still-running child.
pub struct ProcessHandle {
    program: PathBuf,
    child: Child,
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
    terminated: bool,
    grace_period: Duration,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exit_status", &self.exit_status)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Take the stdout pipe (once)
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Whether `terminate` was called on a live process
    pub fn was_terminated(&self) -> bool {
        self.terminated
    }

    /// Liveness check without blocking
    pub fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("Error checking {} status: {}", self.program.display(), e);
                false
            }
        }
    }

    /// Wait for exit and return the exit code (`None` when killed by a signal)
    pub async fn wait_exit_code(&mut self) -> Result<Option<i32>, EngineError> {
        let status = match self.exit_status {
            Some(status) => status,
            None => {
                let status = self.child.wait().await?;
                self.exit_status = Some(status);
                status
            }
        };
        self.join_stderr().await;
        Ok(status.code())
    }

    /// Stderr captured so far
    pub fn stderr_text(&self) -> String {
        self.stderr
            .lock()
            .expect("stderr buffer mutex poisoned")
            .clone()
    }

    /// Graceful stop: SIGTERM, wait the grace period, then SIGKILL.
    /// No-op when the process already exited.
    pub async fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }
        self.terminated = true;
        tracing::info!("Stopping {} (PID: {:?})", self.program.display(), self.pid);

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                match tokio::time::timeout(self.grace_period, self.child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(
                            "{} exited with status: {:?}",
                            self.program.display(),
                            status
                        );
                        self.exit_status = Some(status);
                        return;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Error waiting for {}: {}", self.program.display(), e)
                    }
                    Err(_) => tracing::warn!(
                        "{} didn't exit gracefully, killing...",
                        self.program.display()
                    ),
                }
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill {}: {}", self.program.display(), e);
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit_status = Some(status);
        }
    }

    async fn join_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            // A grandchild may keep the pipe open; don't wait on it forever
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                tracing::debug!("stderr drain of {} still running", self.program.display());
            }
        }
    }
}

/// Output of a short-lived helper invocation
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Run a program to completion, killing it when `limit` elapses
pub async fn run_with_timeout(
    program: &Path,
    args: &[String],
    env: &[(String, String)],
    limit: Duration,
) -> Result<CapturedOutput, EngineError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let child = cmd.spawn().map_err(|source| EngineError::ProcessSpawnFailed {
        program: program.to_path_buf(),
        source,
    })?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CapturedOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => Err(EngineError::LoadTimeout(limit)),
    }
}
