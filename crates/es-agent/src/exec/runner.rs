//! Shell script runner
//!
//! Runs one script through `sh -c` to completion under a deadline. Knows
//! nothing about jobs or the network.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Interpreter used for scripts
pub const DEFAULT_SCRIPT_SHELL: &str = "/bin/sh";

/// Exit code reported when the process never produced one
pub const NO_EXIT_CODE: i32 = -1;

/// Reasons a script produced no exit code
#[derive(Debug, Error)]
pub enum RunError {
    /// The interpreter could not be started
    #[error("start {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on the process failed
    #[error("wait: {0}")]
    Wait(#[source] io::Error),

    /// Deadline expired; the process was killed
    #[error("execution timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Combined output and exit code of a finished script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// stdout followed by stderr
    pub output: String,
    pub exit_code: i32,
}

/// Runs scripts through a shell interpreter
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: PathBuf,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::with_shell(DEFAULT_SCRIPT_SHELL)
    }

    /// Use a different interpreter; it is invoked as `<shell> -c <script>`
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Run to completion and return the full output at once.
    pub async fn run(&self, script: &str, timeout: Duration) -> Result<RunOutput, RunError> {
        tracing::info!(length = script.len(), "executing script");

        let child = self.spawn(script)?;

        // Dropping the future on expiry drops the child, and kill_on_drop kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => {
                let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
                output.push_str(&String::from_utf8_lossy(&out.stderr));
                Ok(RunOutput {
                    output,
                    exit_code: exit_code(out.status),
                })
            }
            Ok(Err(e)) => Err(RunError::Wait(e)),
            Err(_) => Err(RunError::TimedOut(timeout)),
        }
    }

    /// Run to completion, sending every output line to `lines` as it is
    /// produced.
    ///
    /// stdout and stderr are scanned by two independent reader tasks and
    /// both must reach end-of-stream before the exit status is collected,
    /// so the capture is never truncated. `lines` is closed when this
    /// returns.
    pub async fn run_streaming(
        &self,
        script: &str,
        timeout: Duration,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<i32, RunError> {
        tracing::info!(length = script.len(), "executing script with line streaming");

        let mut child = self.spawn(script)?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, lines.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, lines.clone())));
        }
        drop(lines);

        let abort_handles: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();

        let finished = tokio::time::timeout(timeout, async {
            for reader in readers {
                let _ = reader.await;
            }
            child.wait().await
        })
        .await;

        match finished {
            Ok(Ok(status)) => Ok(exit_code(status)),
            Ok(Err(e)) => Err(RunError::Wait(e)),
            Err(_) => {
                // A background grandchild may still hold the pipes open.
                for handle in abort_handles {
                    handle.abort();
                }
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "kill after timeout failed");
                }
                let _ = child.wait().await;
                Err(RunError::TimedOut(timeout))
            }
        }
    }

    fn spawn(&self, script: &str) -> Result<Child, RunError> {
        Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                shell: self.shell.display().to_string(),
                source,
            })
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Exit code of a finished process; a signal-terminated process has none.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(NO_EXIT_CODE)
}

async fn forward_lines<R>(reader: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                if lines.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_secs(10);

    async fn collect(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_run_combines_stdout_and_stderr() {
        let runner = ProcessRunner::new();
        let out = runner
            .run("echo out; echo err 1>&2; exit 4", SHORT)
            .await
            .unwrap();

        assert_eq!(out.exit_code, 4);
        assert_eq!(out.output, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let runner = ProcessRunner::new();
        let err = runner
            .run("sleep 5", Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = ProcessRunner::with_shell("/nonexistent/shell");
        let err = runner.run("true", SHORT).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
        assert!(err.to_string().starts_with("start /nonexistent/shell"));
    }

    #[tokio::test]
    async fn test_streaming_delivers_every_line() {
        let runner = ProcessRunner::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let script = "for i in 1 2 3; do echo line$i; done; echo oops 1>&2";
        let (code, lines) = tokio::join!(runner.run_streaming(script, SHORT, tx), collect(rx));

        assert_eq!(code.unwrap(), 0);
        assert_eq!(lines.len(), 4);
        let stdout: Vec<_> = lines.iter().filter(|l| l.starts_with("line")).collect();
        assert_eq!(stdout, ["line1", "line2", "line3"]);
        assert!(lines.contains(&"oops".to_string()));
    }

    #[tokio::test]
    async fn test_streaming_keeps_partial_last_line() {
        let runner = ProcessRunner::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let (code, lines) = tokio::join!(
            runner.run_streaming("printf 'a\\r\\nb'", SHORT, tx),
            collect(rx)
        );

        assert_eq!(code.unwrap(), 0);
        assert_eq!(lines, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_streaming_timeout_closes_channel() {
        let runner = ProcessRunner::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let (result, lines) = tokio::join!(
            runner.run_streaming("echo started; sleep 5", Duration::from_millis(300), tx),
            collect(rx)
        );

        assert!(matches!(result, Err(RunError::TimedOut(_))));
        assert_eq!(lines, ["started"]);
    }

    #[tokio::test]
    async fn test_streaming_nonzero_exit() {
        let runner = ProcessRunner::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let (code, _) = tokio::join!(runner.run_streaming("exit 7", SHORT, tx), collect(rx));
        assert_eq!(code.unwrap(), 7);
    }
}
