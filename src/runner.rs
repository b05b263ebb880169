//! # External Command Runner
//!
//! Single place where the controller spawns long-running external commands
//! (`nix`, `nixos-rebuild` via `nix shell`, `nixos-anywhere`, `ssh`, `scp`).
//! stdout and stderr are consumed as independent line streams and re-emitted
//! through `tracing` in real time; the last lines of each stream are kept
//! for condition messages. Every run is bounded by a hard wall-clock
//! timeout: on expiry the process receives SIGTERM, a short grace period,
//! then SIGKILL.
//!
//! Commands are always a program plus an argument vector. Callers never
//! hand a raw shell string to this module; argument values have already
//! passed input validation.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// How many lines of each stream are retained for the condition message.
pub const STREAM_TAIL_LINES: usize = 20;

/// Grace period between SIGTERM and SIGKILL on timeout or cancellation.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A fully composed external command: program, argument vector and extra
/// environment variables layered over the inherited environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Space-joined rendering used for logging and error messages.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of a finished (or killed) command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

impl CommandOutcome {
    /// Condition-message sized summary of the captured stderr.
    pub fn stderr_summary(&self) -> String {
        if self.stderr_tail.is_empty() {
            "no stderr output captured".to_string()
        } else {
            self.stderr_tail.join("\n")
        }
    }
}

/// Full output of a short command run in captured mode.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the reconcilers and the operating system. Production code
/// uses [`SubprocessRunner`]; tests substitute a recording implementation
/// to assert which commands would have been spawned.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion within `timeout`, streaming output to
    /// the log as it arrives. Used for the long nixos apply commands.
    ///
    /// A non-zero exit is reported inside [`CommandOutcome`], not as an
    /// `Err`; errors are reserved for spawn failures and timeouts.
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutcome>;

    /// Run a short command and capture its full output (probes, hardware
    /// scans), without streaming.
    async fn run_captured(&self, spec: &CommandSpec, timeout: Duration)
        -> Result<CapturedOutput>;
}

/// Real implementation backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubprocessRunner;

async fn pump_stream<R>(reader: Option<R>, command: String, is_stderr: bool) -> Vec<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STREAM_TAIL_LINES);
    let Some(reader) = reader else {
        return Vec::new();
    };

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                if is_stderr {
                    error!(target: "external", command = %command, "{line}");
                } else {
                    info!(target: "external", command = %command, "{line}");
                }
                if tail.len() == STREAM_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(err) => {
                warn!(command = %command, error = %err, "failed to read command output");
                break;
            }
        }
    }
    tail.into()
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %err, "failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutcome> {
        let display_str = spec.display_line();
        info!(command = %display_str, timeout_secs = timeout.as_secs(), "executing command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            Error::TransientIo(
                anyhow::Error::new(err).context(format!("failed to spawn `{display_str}`")),
            )
        })?;

        let stdout_task = tokio::spawn(pump_stream(child.stdout.take(), display_str.clone(), false));
        let stderr_task = tokio::spawn(pump_stream(child.stderr.take(), display_str.clone(), true));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Err(Error::TransientIo(
                    anyhow::Error::new(err).context(format!("failed to wait for `{display_str}`")),
                ));
            }
            Err(_elapsed) => {
                error!(command = %display_str, timeout_secs = timeout.as_secs(), "command timed out");
                send_sigterm(&child);
                if tokio::time::timeout(TERMINATE_GRACE, child.wait())
                    .await
                    .is_err()
                {
                    warn!(command = %display_str, "process ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(Error::Timeout {
                    command: display_str,
                    timeout,
                });
            }
        };

        let stdout_tail = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        let outcome = CommandOutcome {
            success: status.success(),
            exit_code: status.code(),
            stdout_tail,
            stderr_tail,
        };

        if outcome.success {
            info!(command = %display_str, "command completed successfully");
        } else {
            error!(command = %display_str, exit_code = ?outcome.exit_code, "command failed");
        }
        Ok(outcome)
    }

    async fn run_captured(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CapturedOutput> {
        let display_str = spec.display_line();
        debug!(command = %display_str, "executing command (captured)");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(Error::TransientIo(
                    anyhow::Error::new(err).context(format!("failed to run `{display_str}`")),
                ));
            }
            Err(_elapsed) => {
                return Err(Error::Timeout {
                    command: display_str,
                    timeout,
                });
            }
        };

        Ok(CapturedOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_line_joins_with_spaces() {
        let spec = CommandSpec::new("nix")
            .args(["--extra-experimental-features", "nix-command flakes"])
            .arg("run");
        assert_eq!(
            spec.display_line(),
            "nix --extra-experimental-features nix-command flakes run"
        );
    }

    #[test]
    fn env_vars_accumulate() {
        let spec = CommandSpec::new("nix").env_var("NIX_SSHOPTS", "-i /tmp/key");
        assert_eq!(spec.env, vec![("NIX_SSHOPTS".into(), "-i /tmp/key".into())]);
    }

    #[test]
    fn stderr_summary_for_empty_tail() {
        let outcome = CommandOutcome {
            success: false,
            exit_code: Some(1),
            stdout_tail: vec![],
            stderr_tail: vec![],
        };
        assert_eq!(outcome.stderr_summary(), "no stderr output captured");
    }

    #[tokio::test]
    async fn runs_simple_command() {
        let outcome = SubprocessRunner
            .run(
                &CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout_tail, vec!["out".to_string()]);
        assert_eq!(outcome.stderr_tail, vec!["err".to_string()]);
    }

    #[tokio::test]
    async fn captures_exit_code_and_tail() {
        let outcome = SubprocessRunner
            .run(
                &CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stderr_summary(), "boom");
    }

    #[tokio::test]
    async fn tail_is_bounded() {
        let outcome = SubprocessRunner
            .run(
                &CommandSpec::new("sh").args(["-c", "seq 1 100"]),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout_tail.len(), STREAM_TAIL_LINES);
        assert_eq!(outcome.stdout_tail.last().map(String::as_str), Some("100"));
        assert_eq!(outcome.stdout_tail.first().map(String::as_str), Some("81"));
    }

    #[tokio::test]
    async fn times_out_and_kills() {
        let start = std::time::Instant::now();
        let result = SubprocessRunner
            .run(
                &CommandSpec::new("sh").args(["-c", "sleep 30"]),
                Duration::from_millis(200),
            )
            .await;
        match result {
            Err(Error::Timeout { command, .. }) => assert!(command.contains("sleep")),
            other => panic!("expected Timeout, got {other:?}"),
        }
        // SIGTERM is honored by sleep, so we should be nowhere near the
        // 30 second sleep nor the full grace period.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn captured_mode_returns_full_output() {
        let output = SubprocessRunner
            .run_captured(
                &CommandSpec::new("sh").args(["-c", "seq 1 100"]),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.lines().count(), 100);
    }

    #[tokio::test]
    async fn captured_mode_times_out() {
        let result = SubprocessRunner
            .run_captured(
                &CommandSpec::new("sh").args(["-c", "sleep 30"]),
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn environment_is_injected() {
        let outcome = SubprocessRunner
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "printf '%s' \"$NIX_SSHOPTS\""])
                    .env_var("NIX_SSHOPTS", "-i /tmp/key"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout_tail, vec!["-i /tmp/key".to_string()]);
    }
}
