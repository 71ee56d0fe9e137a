//! Job executor
//!
//! Turns an `execute` request into a streamed run: every output line goes
//! out as a `log` message while the script runs, and exactly one `result`
//! follows once it has finished. Each delivery tries the duplex connection
//! first and falls back to the plain request path once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use es_core::traits::ControlPlane;
use es_core::{AgentId, JobResultReport};
use es_protocol::{ExecuteRequest, JobResult, JobStatus, OutboundMessage};

use super::runner::{ProcessRunner, RunError, NO_EXIT_CODE};
use crate::tunnel::PushChannel;

/// Deadline for requests that carry no positive timeout
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// What a finished job reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_code: i32,
    pub output: String,
}

impl JobOutcome {
    /// Classify a finished run.
    ///
    /// `output` is the captured lines joined by `\n`. A non-zero exit
    /// appends `exit code: N`, and a run with no exit code appends the
    /// error text, each on its own line.
    fn from_run(job_id: String, lines: Vec<String>, run: Result<i32, RunError>) -> Self {
        let output = lines.join("\n");
        match run {
            Ok(0) => Self {
                job_id,
                status: JobStatus::Success,
                exit_code: 0,
                output,
            },
            Ok(code) => Self {
                job_id,
                status: JobStatus::Failed,
                exit_code: code,
                output: append_line(output, &format!("exit code: {}", code)),
            },
            Err(e) => Self {
                job_id,
                status: JobStatus::Failed,
                exit_code: NO_EXIT_CODE,
                output: append_line(output, &e.to_string()),
            },
        }
    }

    fn to_message(&self) -> OutboundMessage {
        OutboundMessage::Result(JobResult {
            job_id: self.job_id.clone(),
            status: self.status,
            exit_code: self.exit_code,
            output: self.output.clone(),
        })
    }

    fn to_report(&self, agent_id: &AgentId) -> JobResultReport {
        JobResultReport {
            job_id: self.job_id.clone(),
            agent_id: agent_id.clone(),
            status: self.status,
            exit_code: self.exit_code,
            output: self.output.clone(),
        }
    }
}

fn append_line(output: String, line: &str) -> String {
    if output.is_empty() {
        line.to_string()
    } else {
        format!("{}\n{}", output, line)
    }
}

/// Runs jobs and delivers their logs and results
pub struct JobExecutor {
    agent_id: AgentId,
    runner: ProcessRunner,
    push: Arc<dyn PushChannel>,
    control_plane: Arc<dyn ControlPlane>,
    default_timeout: Duration,
}

impl JobExecutor {
    pub fn new(
        agent_id: AgentId,
        push: Arc<dyn PushChannel>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            agent_id,
            runner: ProcessRunner::new(),
            push,
            control_plane,
            default_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Deadline applied to `req`
    pub fn effective_timeout(&self, req: &ExecuteRequest) -> Duration {
        req.timeout_secs()
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Run `req` on its own task. Jobs are independent of one another and
    /// of the connection; the handle may be dropped.
    pub fn spawn(self: &Arc<Self>, req: ExecuteRequest) -> JoinHandle<JobOutcome> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.execute(req).await })
    }

    /// Run `req` to completion, streaming logs and delivering the result
    pub async fn execute(&self, req: ExecuteRequest) -> JobOutcome {
        let timeout = self.effective_timeout(&req);
        tracing::info!(
            job_id = %req.job_id,
            task_id = %req.task_id,
            timeout_secs = timeout.as_secs(),
            "executing job"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (run, lines) = tokio::join!(
            self.runner.run_streaming(&req.script, timeout, tx),
            self.forward_logs(&req.job_id, rx),
        );

        if let Err(e) = &run {
            tracing::warn!(job_id = %req.job_id, error = %e, "job did not complete");
        }

        let outcome = JobOutcome::from_run(req.job_id, lines, run);
        tracing::info!(
            job_id = %outcome.job_id,
            status = %outcome.status,
            exit_code = outcome.exit_code,
            "job finished"
        );

        self.deliver_result(&outcome).await;
        outcome
    }

    /// Forward lines in arrival order and return them all once the run
    /// closes the channel.
    async fn forward_logs(
        &self,
        job_id: &str,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            self.deliver_log(job_id, &line).await;
            lines.push(line);
        }
        lines
    }

    async fn deliver_log(&self, job_id: &str, line: &str) {
        let message = OutboundMessage::log(job_id, line);
        if let Err(e) = self.push.push(&message).await {
            tracing::debug!(job_id, error = %e, "log push failed, using request path");
            if let Err(e) = self.control_plane.report_log(job_id, line).await {
                tracing::error!(job_id, error = %e, "failed to report job log");
            }
        }
    }

    async fn deliver_result(&self, outcome: &JobOutcome) {
        let message = outcome.to_message();
        match self.push.push(&message).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(
                    job_id = %outcome.job_id,
                    error = %e,
                    "result push failed, using request path"
                );
                let report = outcome.to_report(&self.agent_id);
                if let Err(e) = self.control_plane.report_result(&report).await {
                    tracing::error!(job_id = %outcome.job_id, error = %e, "failed to report job result");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use es_core::{ConnectionError, ControlPlaneError, HeartbeatReport};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPush {
        offline: bool,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl PushChannel for RecordingPush {
        async fn push(&self, message: &OutboundMessage) -> Result<(), ConnectionError> {
            if self.offline {
                return Err(ConnectionError::NotConnected);
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingControlPlane {
        failing: bool,
        results: Mutex<Vec<JobResultReport>>,
        logs: Mutex<Vec<(String, String)>>,
    }

    impl RecordingControlPlane {
        fn outcome(&self) -> Result<(), ControlPlaneError> {
            if self.failing {
                return Err(ControlPlaneError::Api {
                    code: 500,
                    message: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ControlPlane for RecordingControlPlane {
        async fn report_result(&self, report: &JobResultReport) -> Result<(), ControlPlaneError> {
            self.results.lock().unwrap().push(report.clone());
            self.outcome()
        }

        async fn report_log(&self, job_id: &str, line: &str) -> Result<(), ControlPlaneError> {
            self.logs
                .lock()
                .unwrap()
                .push((job_id.to_string(), line.to_string()));
            self.outcome()
        }

        async fn send_heartbeat(&self, _: &HeartbeatReport) -> Result<(), ControlPlaneError> {
            Ok(())
        }
    }

    fn request(script: &str, timeout: i64) -> ExecuteRequest {
        ExecuteRequest {
            job_id: "j1".into(),
            task_id: "t1".into(),
            script: script.into(),
            timeout,
        }
    }

    fn executor(
        push: &Arc<RecordingPush>,
        plane: &Arc<RecordingControlPlane>,
    ) -> Arc<JobExecutor> {
        Arc::new(JobExecutor::new(
            AgentId::from("ag_test"),
            push.clone(),
            plane.clone(),
        ))
    }

    #[test]
    fn test_outcome_classification() {
        let ok = JobOutcome::from_run("j".into(), vec!["a".into(), "b".into()], Ok(0));
        assert_eq!(ok.status, JobStatus::Success);
        assert_eq!(ok.output, "a\nb");

        let failed = JobOutcome::from_run("j".into(), vec!["hi".into()], Ok(3));
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.exit_code, 3);
        assert_eq!(failed.output, "hi\nexit code: 3");

        let silent = JobOutcome::from_run("j".into(), Vec::new(), Ok(1));
        assert_eq!(silent.output, "exit code: 1");

        let timed_out = JobOutcome::from_run(
            "j".into(),
            vec!["started".into()],
            Err(RunError::TimedOut(Duration::from_secs(1))),
        );
        assert_eq!(timed_out.status, JobStatus::Failed);
        assert_eq!(timed_out.exit_code, -1);
        assert_eq!(timed_out.output, "started\nexecution timed out after 1s");
    }

    #[test]
    fn test_effective_timeout() {
        let push = Arc::new(RecordingPush::default());
        let plane = Arc::new(RecordingControlPlane::default());
        let exec = executor(&push, &plane);

        assert_eq!(exec.effective_timeout(&request("", 0)), DEFAULT_JOB_TIMEOUT);
        assert_eq!(exec.effective_timeout(&request("", -5)), DEFAULT_JOB_TIMEOUT);
        assert_eq!(
            exec.effective_timeout(&request("", 7)),
            Duration::from_secs(7)
        );
    }

    #[tokio::test]
    async fn test_logs_then_single_result_over_push() {
        let push = Arc::new(RecordingPush::default());
        let plane = Arc::new(RecordingControlPlane::default());
        let exec = executor(&push, &plane);

        let outcome = exec.execute(request("echo one; echo two; exit 3", 0)).await;
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.output, "one\ntwo\nexit code: 3");

        let sent = push.sent.lock().unwrap().clone();
        let kinds: Vec<_> = sent.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, ["log", "log", "result"]);
        assert_eq!(sent[0], OutboundMessage::log("j1", "one"));
        assert_eq!(sent[1], OutboundMessage::log("j1", "two"));
        match &sent[2] {
            OutboundMessage::Result(result) => {
                assert_eq!(result.status, JobStatus::Failed);
                assert_eq!(result.exit_code, 3);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(plane.results.lock().unwrap().is_empty());
        assert!(plane.logs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_when_push_unavailable() {
        let push = Arc::new(RecordingPush {
            offline: true,
            ..Default::default()
        });
        let plane = Arc::new(RecordingControlPlane::default());
        let exec = executor(&push, &plane);

        let outcome = exec.execute(request("echo hello", 0)).await;
        assert_eq!(outcome.status, JobStatus::Success);

        let results = plane.results.lock().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].agent_id.as_str(), "ag_test");
        assert_eq!(results[0].output, "hello");
        assert_eq!(results[0].status, JobStatus::Success);

        let logs = plane.logs.lock().unwrap().clone();
        assert_eq!(logs, [("j1".to_string(), "hello".to_string())]);
    }

    #[tokio::test]
    async fn test_fallback_failures_are_not_retried() {
        let push = Arc::new(RecordingPush {
            offline: true,
            ..Default::default()
        });
        let plane = Arc::new(RecordingControlPlane {
            failing: true,
            ..Default::default()
        });
        let exec = executor(&push, &plane);

        let outcome = exec.execute(request("echo a; echo b", 0)).await;
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.output, "a\nb");

        // Every line still gets its one attempt after an earlier failure.
        assert_eq!(plane.logs.lock().unwrap().len(), 2);
        assert_eq!(plane.results.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_request_timeout_terminates_job() {
        let push = Arc::new(RecordingPush::default());
        let plane = Arc::new(RecordingControlPlane::default());
        let exec = executor(&push, &plane);

        let outcome = tokio::time::timeout(
            Duration::from_secs(4),
            exec.spawn(request("echo started; sleep 5; echo late", 1)),
        )
        .await
        .expect("job outlived its timeout")
        .unwrap();

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, -1);
        assert_eq!(outcome.output, "started\nexecution timed out after 1s");

        let sent = push.sent.lock().unwrap();
        let kinds: Vec<_> = sent.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, ["log", "result"]);
    }

    #[tokio::test]
    async fn test_timeout_reports_failure() {
        let push = Arc::new(RecordingPush::default());
        let plane = Arc::new(RecordingControlPlane::default());
        let exec = Arc::new(
            JobExecutor::new(AgentId::from("ag_test"), push.clone(), plane.clone())
                .with_default_timeout(Duration::from_millis(300)),
        );

        let outcome = exec.spawn(request("sleep 5", 0)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.contains("timed out"));

        let sent = push.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "result");
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_failure() {
        let push = Arc::new(RecordingPush::default());
        let plane = Arc::new(RecordingControlPlane::default());
        let exec = JobExecutor::new(AgentId::from("ag_test"), push.clone(), plane.clone())
            .with_runner(ProcessRunner::with_shell("/nonexistent/shell"));

        let outcome = exec.execute(request("true", 0)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.starts_with("start /nonexistent/shell"));
    }
}
