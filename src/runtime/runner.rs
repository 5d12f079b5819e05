//! Bounded, cancellable off-process conversion.
//!
//! One [`BoundedTaskRunner`] serves exactly one request: it spawns a single
//! worker, checks it once per poll interval, and finishes as soon as the
//! worker exits or the time budget runs out. The worker is released on every
//! terminal transition.

use tracing::Instrument as _;
use uuid::Uuid;

use std::path::Path;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::{BridgeResult, Config, SupervisedWorker, WorkerCommand};

/// Terminal state of one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { content: String },
    Failed { diagnostic: String },
    TimedOut,
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub request_id: Uuid,
    pub worker_pid: Option<u32>,
    pub elapsed: Duration,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone)]
pub struct BoundedTaskRunner {
    request_id: Uuid,
    worker: WorkerCommand,
    timeout: Duration,
    poll_interval: Duration,
}

impl BoundedTaskRunner {
    pub fn new(worker: WorkerCommand, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            worker,
            timeout,
            // A zero period would make the ticker panic.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &Config) -> BridgeResult<Self> {
        config.validate()?;
        Ok(Self::new(
            config.worker_command()?,
            config.timeout(),
            config.poll_interval(),
        ))
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Converts the report at `report_path` in a fresh worker.
    ///
    /// Returns `Err` only when no worker could be started; worker failures
    /// and timeouts are outcomes.
    pub async fn run(self, report_path: &Path) -> BridgeResult<RunRecord> {
        let span = tracing::debug_span!("stats_runner", request_id = %self.request_id);
        self.run_inner(report_path).instrument(span).await
    }

    async fn run_inner(self, report_path: &Path) -> BridgeResult<RunRecord> {
        let started = Instant::now();
        let mut worker = SupervisedWorker::spawn(&self.worker, report_path)?;
        let worker_pid = worker.pid();
        tracing::debug!(
            pid = ?worker_pid,
            path = %report_path.display(),
            "worker dispatched"
        );

        let outcome = self.supervise(&mut worker, started).await;
        if let Err(err) = worker.release().await {
            tracing::warn!(pid = ?worker_pid, "failed to release worker: {err}");
        }

        let elapsed = started.elapsed();
        match &outcome {
            TaskOutcome::Completed { content } => {
                tracing::info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    bytes = content.len(),
                    "conversion completed"
                );
            }
            TaskOutcome::Failed { diagnostic } => {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "conversion failed: {diagnostic}"
                );
            }
            TaskOutcome::TimedOut => {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "conversion timed out; worker killed"
                );
            }
        }

        Ok(RunRecord {
            request_id: self.request_id,
            worker_pid,
            elapsed,
            outcome,
        })
    }

    async fn supervise(&self, worker: &mut SupervisedWorker, started: Instant) -> TaskOutcome {
        let mut ticker =
            tokio::time::interval_at(started + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match worker.try_wait() {
                Ok(Some(_)) => return self.collect(worker, started).await,
                Ok(None) => {}
                Err(err) => {
                    return TaskOutcome::Failed {
                        diagnostic: format!("cannot poll worker: {err}"),
                    };
                }
            }
            if started.elapsed() > self.timeout {
                return TaskOutcome::TimedOut;
            }
            tracing::trace!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "worker still running"
            );
        }
    }

    async fn collect(&self, worker: &mut SupervisedWorker, started: Instant) -> TaskOutcome {
        // Output may still be held open by a grandchild of the worker.
        let remaining = self
            .timeout
            .saturating_sub(started.elapsed())
            .max(self.poll_interval);
        let output = match tokio::time::timeout(remaining, worker.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return TaskOutcome::Failed {
                    diagnostic: err.to_string(),
                };
            }
            Err(_) => return TaskOutcome::TimedOut,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let diagnostic = if stderr.is_empty() {
                format!("worker exited with {}", output.status)
            } else {
                format!("worker exited with {}: {stderr}", output.status)
            };
            return TaskOutcome::Failed { diagnostic };
        }

        match String::from_utf8(output.stdout) {
            Ok(content) => TaskOutcome::Completed { content },
            Err(err) => TaskOutcome::Failed {
                diagnostic: format!("worker output is not utf-8: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        )
    }

    fn runner(script: &str, timeout_ms: u64, poll_ms: u64) -> BoundedTaskRunner {
        BoundedTaskRunner::new(
            sh(script),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(poll_ms),
        )
    }

    fn temp_report(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pstats-bridge-runner-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("report.json");
        std::fs::write(&path, contents).expect("write");
        path
    }

    #[tokio::test]
    async fn completed_worker_returns_stdout() {
        let path = temp_report(r#"{"a.py,10,f":[1,1,0.5,0.5,{}]}"#);
        let record = runner("cat \"$1\"", 5_000, 20).run(&path).await.expect("run");
        assert_eq!(
            record.outcome,
            TaskOutcome::Completed {
                content: r#"{"a.py,10,f":[1,1,0.5,0.5,{}]}"#.to_string()
            }
        );
        assert!(record.elapsed >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn failing_worker_carries_diagnostic() {
        let record = runner("echo 'parse error: bad magic' >&2; exit 3", 5_000, 20)
            .run(Path::new("x"))
            .await
            .expect("run");
        match record.outcome {
            TaskOutcome::Failed { diagnostic } => {
                assert!(diagnostic.contains("parse error: bad magic"), "{diagnostic}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hung_worker_times_out_within_one_poll_interval() {
        let timeout = Duration::from_millis(300);
        let poll = Duration::from_millis(50);
        let record = BoundedTaskRunner::new(sh("exec sleep 30"), timeout, poll)
            .run(Path::new("x"))
            .await
            .expect("run");
        assert_eq!(record.outcome, TaskOutcome::TimedOut);
        assert!(record.elapsed >= timeout, "{:?}", record.elapsed);
        // One poll interval plus scheduling and kill slack.
        assert!(
            record.elapsed < timeout + poll + Duration::from_secs(2),
            "{:?}",
            record.elapsed
        );

        #[cfg(target_os = "linux")]
        {
            let pid = record.worker_pid.expect("pid");
            assert!(!Path::new(&format!("/proc/{pid}")).exists());
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_run_kills_its_worker() {
        let pid_file = temp_report("");
        let run = runner("echo $$ > \"$1\"; exec sleep 30", 30_000, 20).run(&pid_file);
        assert!(
            tokio::time::timeout(Duration::from_millis(300), run)
                .await
                .is_err()
        );

        let pid = std::fs::read_to_string(&pid_file).expect("pid file");
        let proc_dir = PathBuf::from(format!("/proc/{}", pid.trim()));
        for _ in 0..100 {
            if !proc_dir.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("worker {} survived its abandoned run", pid.trim());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_an_outcome() {
        let runner = BoundedTaskRunner::new(
            WorkerCommand::new("/nonexistent/worker", Vec::new()),
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        assert!(runner.run(Path::new("x")).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_runs_are_independent() {
        let mut tasks = Vec::new();
        for i in 0..6 {
            let path = temp_report(&format!("{{\"n\":{i}}}"));
            let script = if i % 3 == 0 { "exec sleep 30" } else { "cat \"$1\"" };
            let task_runner = runner(script, 500, 20);
            tasks.push(tokio::spawn(async move {
                let request_id = task_runner.request_id();
                (i, request_id, task_runner.run(&path).await.expect("run"))
            }));
        }

        let mut ids = std::collections::BTreeSet::new();
        for task in tasks {
            let (i, request_id, record) = task.await.expect("join");
            assert_eq!(record.request_id, request_id);
            ids.insert(request_id);
            if i % 3 == 0 {
                assert_eq!(record.outcome, TaskOutcome::TimedOut);
            } else {
                assert_eq!(
                    record.outcome,
                    TaskOutcome::Completed {
                        content: format!("{{\"n\":{i}}}")
                    }
                );
            }
        }
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn from_config_rejects_zero_poll_interval() {
        let cfg = Config {
            poll_interval_ms: 0,
            worker_program: Some(PathBuf::from("/bin/true")),
            ..Config::default()
        };
        assert!(BoundedTaskRunner::from_config(&cfg).is_err());
    }
}
