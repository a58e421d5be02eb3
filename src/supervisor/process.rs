//! One spawned sidecar process: the OS child, its assigned port, and the
//! output drain tasks that live exactly as long as the handle.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::ProcessConfig;

/// A running sidecar child and the configuration it was started with.
///
/// Owned exclusively by the supervisor; at most one exists per supervisor
/// instance. Dropping the handle kills the child (`kill_on_drop`) and aborts
/// the drain tasks.
pub struct SupervisedProcess {
    child: tokio::process::Child,
    pid: u32,
    config: ProcessConfig,
    exited: Option<ExitStatus>,
    drain_tasks: Vec<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Spawn the sidecar binary with arguments derived from `config`.
    ///
    /// stdout/stderr are piped and drained continuously into the log so the
    /// child can never block on a full output buffer.
    pub async fn launch(binary: &Path, config: ProcessConfig) -> std::io::Result<Self> {
        let mut cmd = Command::new(binary);
        cmd.args(config.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned sidecar has no pid"))?;

        let mut drain_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drain_tasks.push(spawn_drain(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            drain_tasks.push(spawn_drain(stderr, pid, "stderr"));
        }

        tracing::info!(pid, port = config.port, "sidecar process started");
        Ok(Self { child, pid, config, exited: None, drain_tasks })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Non-blocking liveness check; reaps and remembers the exit status the
    /// first time the child is observed dead.
    pub fn is_running(&mut self) -> bool {
        if self.exited.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.note_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "cannot query sidecar process state");
                false
            }
        }
    }

    /// Wait up to `grace` for a natural exit. Returns true once the child
    /// has exited.
    pub async fn wait_exit(&mut self, grace: Duration) -> bool {
        if self.exited.is_some() {
            return true;
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.note_exit(status);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "wait on sidecar process failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Kill the child outright and reap it. Idempotent.
    pub async fn force_kill(&mut self) {
        if self.exited.is_some() {
            return;
        }
        tracing::info!(pid = self.pid, "force-killing sidecar process");
        if let Err(e) = self.child.kill().await {
            tracing::debug!(pid = self.pid, error = %e, "kill failed, process likely gone");
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exited = Some(status);
        }
    }

    fn note_exit(&mut self, status: ExitStatus) {
        if status.success() {
            tracing::info!(pid = self.pid, "sidecar process exited cleanly");
        } else {
            tracing::warn!(pid = self.pid, %status, "sidecar process exited");
        }
        self.exited = Some(status);
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        // The drain tasks end on pipe EOF anyway; aborting just makes the
        // teardown immediate when the handle goes away first.
        for task in &self.drain_tasks {
            task.abort();
        }
    }
}

fn spawn_drain<R>(reader: R, pid: u32, channel: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        // Read errors end the loop; they must never escape into the supervisor.
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "sidecar", pid, channel, "{}", line);
        }
    })
}
