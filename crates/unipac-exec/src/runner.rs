use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use unipac_core::event::OutputStream;
use unipac_core::{CommandSpec, Error, Result};

/// How often the runner checks the cancellation token while the child runs.
pub const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Grace between SIGTERM and SIGKILL when tearing a process group down.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Installs can involve large downloads or compilation; minutes, not seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// The exactly-once report of a finished (or killed) child.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Exit code, or -1 if the child died from a signal.
    pub code: i32,
    /// Full stderr, retained for recoverable-condition matching even when
    /// stdout looked clean.
    pub stderr: String,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.code == 0 && !self.cancelled
    }
}

/// Spawns one command per call, streams its output line by line and enforces
/// cooperative cancellation plus a hung-process timeout.
pub struct Runner {
    timeout: Duration,
}

impl Runner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        lines: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<RunOutcome> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| Error::Other("empty command".to_string()))?;

        debug!(command = %spec, "spawning");

        let mut child = Command::new(program)
            .args(args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own group so cancellation can kill the whole tree, not just
            // the elevation wrapper
            .process_group(0)
            .spawn()?;

        let pgid = child.id().map(|id| Pid::from_raw(id as i32));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other("child stderr not captured".to_string()))?;

        let out_task = tokio::spawn(drain(stdout, OutputStream::Stdout, lines.clone()));

        // stderr is both streamed and collected for the matchers
        let err_lines = lines;
        let err_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
                if err_lines
                    .send(OutputLine {
                        stream: OutputStream::Stderr,
                        text: line,
                    })
                    .is_err()
                {
                    break;
                }
            }
            collected
        });

        let deadline = Instant::now() + self.timeout;
        let mut cancelled = false;
        let mut timed_out = false;

        // poll at a fixed interval so cancellation is observed promptly while
        // the drain tasks keep the pipes empty
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                cancelled = true;
            } else if Instant::now() >= deadline {
                timed_out = true;
            }
            if cancelled || timed_out {
                break terminate_group(pgid, &mut child).await?;
            }
            sleep(CANCEL_POLL).await;
        };

        let _ = out_task.await;
        let stderr_text = err_task.await.unwrap_or_default();

        if timed_out {
            warn!(command = %spec, "killed after timeout");
            return Err(Error::Timeout(self.timeout.as_secs()));
        }

        Ok(RunOutcome {
            code: status.code().unwrap_or(-1),
            stderr: stderr_text,
            cancelled,
        })
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(
    pipe: impl AsyncRead + Unpin,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputLine>,
) {
    let mut reader = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if tx.send(OutputLine { stream, text: line }).is_err() {
            break;
        }
    }
}

// SIGTERM first, then SIGKILL after a short grace if the group ignores it
async fn terminate_group(pgid: Option<Pid>, child: &mut Child) -> std::io::Result<ExitStatus> {
    if let Some(pgid) = pgid {
        let _ = killpg(pgid, Signal::SIGTERM);
    }
    match timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            if let Some(pgid) = pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    async fn run_collect(
        runner: &Runner,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> (Result<RunOutcome>, Vec<OutputLine>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = runner.run(spec, cancel, tx).await;
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        (outcome, lines)
    }

    #[tokio::test]
    async fn test_stdout_lines_delivered_in_order() {
        let runner = Runner::new();
        let cancel = CancellationToken::new();
        let (outcome, lines) =
            run_collect(&runner, &sh("for i in 1 2 3 4 5; do echo line$i; done"), &cancel).await;

        let outcome = outcome.unwrap();
        assert!(outcome.success());

        let stdout: Vec<&str> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["line1", "line2", "line3", "line4", "line5"]);
    }

    #[tokio::test]
    async fn test_stderr_captured_separately() {
        let runner = Runner::new();
        let cancel = CancellationToken::new();
        let (outcome, lines) =
            run_collect(&runner, &sh("echo out; echo err >&2; exit 3"), &cancel).await;

        let outcome = outcome.unwrap();
        assert_eq!(outcome.code, 3);
        assert!(!outcome.success());
        assert!(outcome.stderr.contains("err"));
        assert!(!outcome.stderr.contains("out"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.text == "err"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_within_grace_period() {
        let runner = Runner::new();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let started = StdInstant::now();
        let spec = sh("sleep 30");
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            cancel2.cancel();
        });

        let outcome = runner.run(&spec, &cancel, tx).await.unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_reported_as_error() {
        let runner = Runner::with_timeout(Duration::from_millis(300));
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let started = StdInstant::now();
        let err = runner.run(&sh("sleep 30"), &cancel, tx).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_env_overlay_applied() {
        let runner = Runner::new();
        let cancel = CancellationToken::new();
        let mut spec = sh("echo $UNIPAC_TEST_VAR");
        spec.env
            .push(("UNIPAC_TEST_VAR".to_string(), "overlay".to_string()));

        let (outcome, lines) = run_collect(&runner, &spec, &cancel).await;
        assert!(outcome.unwrap().success());
        assert!(lines.iter().any(|l| l.text == "overlay"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_io_error() {
        let runner = Runner::new();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = CommandSpec::new(vec!["/nonexistent/unipac-test-binary".to_string()]);
        let err = runner.run(&spec, &cancel, tx).await.unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
    }
}
