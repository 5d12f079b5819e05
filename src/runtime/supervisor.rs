//! Supervised worker processes.
//!
//! A [`SupervisedWorker`] owns exactly one child process. The child is
//! killed and reaped on [`SupervisedWorker::release`], and killed on drop if
//! release never ran, so no exit path can leak it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::{BridgeError, BridgeResult};

/// Program invocation for a worker; the report path is appended last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn to_command(&self, report_path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(report_path)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Captured output of a worker that exited on its own.
#[derive(Debug)]
pub struct WorkerOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

type Drain = JoinHandle<std::io::Result<Vec<u8>>>;

pub struct SupervisedWorker {
    child: Child,
    pid: Option<u32>,
    stdout: Option<Drain>,
    stderr: Option<Drain>,
    exit: Option<ExitStatus>,
    released: bool,
}

impl SupervisedWorker {
    /// Spawns the worker for `report_path`. Must run inside a tokio runtime.
    pub fn spawn(command: &WorkerCommand, report_path: &Path) -> BridgeResult<Self> {
        let mut child = command.to_command(report_path).spawn().map_err(|err| {
            BridgeError::Worker(format!(
                "failed to spawn {}: {err}",
                command.program.display()
            ))
        })?;
        let pid = child.id();
        // Pipes are drained in the background so a large report cannot
        // fill the pipe buffer and stall the worker.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            exit: None,
            released: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking check for worker exit.
    pub fn try_wait(&mut self) -> BridgeResult<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }

    /// Collects everything the worker wrote. Only valid after `try_wait`
    /// reported an exit.
    pub async fn output(&mut self) -> BridgeResult<WorkerOutput> {
        let Some(status) = self.exit else {
            return Err(BridgeError::Worker("worker has not exited".to_string()));
        };
        Ok(WorkerOutput {
            status,
            stdout: join_drain(self.stdout.take()).await?,
            stderr: join_drain(self.stderr.take()).await?,
        })
    }

    /// Kills the worker if it is still running and reaps it. Idempotent.
    pub async fn release(&mut self) -> BridgeResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.abort_drains();
        if self.exit.is_none() {
            // `kill` sends SIGKILL and waits, reaping the child.
            self.child.kill().await?;
            tracing::debug!(pid = ?self.pid, "worker killed");
        }
        Ok(())
    }

    fn abort_drains(&mut self) {
        for drain in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            drain.abort();
        }
    }
}

impl Drop for SupervisedWorker {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.abort_drains();
        if self.exit.is_none() {
            // tokio reaps the orphaned child in the background.
            if let Err(err) = self.child.start_kill() {
                tracing::warn!(pid = ?self.pid, "failed to kill dropped worker: {err}");
            }
        }
    }
}

fn drain<R>(mut pipe: R) -> Drain
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

async fn join_drain(drain: Option<Drain>) -> BridgeResult<Vec<u8>> {
    let Some(drain) = drain else {
        return Ok(Vec::new());
    };
    let bytes = drain
        .await
        .map_err(|err| BridgeError::Worker(format!("output reader failed: {err}")))??;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        )
    }

    fn spawn_sleeper() -> SupervisedWorker {
        SupervisedWorker::spawn(&sh("exec sleep 30"), Path::new("x")).expect("spawn")
    }

    async fn wait_for_exit(worker: &mut SupervisedWorker) -> ExitStatus {
        loop {
            if let Some(status) = worker.try_wait().expect("try_wait") {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn collects_stdout_and_report_argument() {
        let cmd = sh("printf '%s' \"$1\"");
        let mut worker = SupervisedWorker::spawn(&cmd, Path::new("/tmp/r.prof")).expect("spawn");
        assert!(wait_for_exit(&mut worker).await.success());
        let output = worker.output().await.expect("output");
        assert_eq!(output.stdout, b"/tmp/r.prof");
        worker.release().await.expect("release");
    }

    #[tokio::test]
    async fn passes_environment() {
        let cmd = sh("printf '%s' \"$PSTATS_TEST_VALUE\"").env("PSTATS_TEST_VALUE", "array");
        let mut worker = SupervisedWorker::spawn(&cmd, Path::new("x")).expect("spawn");
        wait_for_exit(&mut worker).await;
        assert_eq!(worker.output().await.expect("output").stdout, b"array");
    }

    #[tokio::test]
    async fn large_output_does_not_stall_worker() {
        let mut worker =
            SupervisedWorker::spawn(&sh("head -c 1048576 /dev/zero"), Path::new("x"))
                .expect("spawn");
        let status = tokio::time::timeout(Duration::from_secs(10), wait_for_exit(&mut worker))
            .await
            .expect("worker finished");
        assert!(status.success());
        assert_eq!(worker.output().await.expect("output").stdout.len(), 1 << 20);
    }

    #[tokio::test]
    async fn output_before_exit_is_an_error() {
        let mut worker = spawn_sleeper();
        assert!(matches!(worker.output().await, Err(BridgeError::Worker(_))));
        worker.release().await.expect("release");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn release_kills_and_reaps_running_worker() {
        let mut worker = spawn_sleeper();
        let pid = worker.pid().expect("pid");
        assert!(Path::new(&format!("/proc/{pid}")).exists());
        worker.release().await.expect("release");
        worker.release().await.expect("second release is a no-op");
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropped_worker_is_killed() {
        let worker = spawn_sleeper();
        let proc_dir = PathBuf::from(format!("/proc/{}", worker.pid().expect("pid")));
        assert!(proc_dir.exists());
        drop(worker);

        // The runtime reaps the orphan in the background.
        for _ in 0..100 {
            if !proc_dir.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} still exists after drop", proc_dir.display());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_worker_error() {
        let cmd = WorkerCommand::new("/nonexistent/pstats-worker", Vec::new());
        assert!(matches!(
            SupervisedWorker::spawn(&cmd, Path::new("x")),
            Err(BridgeError::Worker(_))
        ));
    }
}
