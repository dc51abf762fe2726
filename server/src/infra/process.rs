//! External process adapter
//!
//! Both backends drive external command-line tools. Everything goes through
//! [`ProcessRunner`] so tests can script tool output without spawning.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use crate::domain::environment::{CommandResult, LogStream};
use crate::error::{Error, Result};

/// A single external tool invocation
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: &HashMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// True when the argument list contains `needle` as a contiguous run
    pub fn has_args(&self, needle: &[&str]) -> bool {
        if needle.is_empty() {
            return true;
        }
        self.args
            .windows(needle.len())
            .any(|w| w.iter().zip(needle).all(|(a, b)| a == b))
    }
}

impl fmt::Debug for Invocation {
    // Keeps stdin payloads, env values and bearer tokens out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        let mut redact_next = false;
        for arg in &self.args {
            if redact_next {
                write!(f, " ***")?;
            } else {
                write!(f, " {}", arg)?;
            }
            redact_next = arg == "--token";
        }
        Ok(())
    }
}

/// Runs external tools
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion; a non-zero exit is returned as data, not an error
    async fn run(&self, invocation: Invocation) -> Result<CommandResult>;

    /// Spawn and stream stdout line by line until the child exits or the
    /// stream is dropped
    async fn stream(&self, invocation: Invocation) -> Result<LogStream>;
}

/// [`ProcessRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: Invocation) -> Result<CommandResult> {
        debug!("Running {:?}", invocation);
        let start = Instant::now();

        let mut child = Self::command(&invocation).spawn().map_err(|e| {
            Error::ProcessError(format!("Failed to spawn {}: {}", invocation.program, e))
        })?;

        if let Some(input) = &invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                // Dropping closes the pipe so the child sees EOF
                drop(stdin);
            }
        }

        // Dropping the wait future drops the child, which kills it
        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| Error::CommandTimeout(limit.as_millis() as u64))??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, invocation: Invocation) -> Result<LogStream> {
        debug!("Streaming {:?}", invocation);

        let mut child = Self::command(&invocation).spawn().map_err(|e| {
            Error::ProcessError(format!("Failed to spawn {}: {}", invocation.program, e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessError("Child stdout unavailable".to_string()))?;

        let lines = LinesStream::new(BufReader::new(stdout).lines());
        // The closure owns the child; dropping the stream kills it
        let stream = lines.map(move |line| {
            let _ = child.id();
            line.map(|l| format!("{}\n", l)).map_err(Error::from)
        });

        Ok(stream.boxed())
    }
}

/// Run and convert a non-zero exit into [`Error::CommandFailed`]
pub async fn run_checked(runner: &dyn ProcessRunner, invocation: Invocation) -> Result<CommandResult> {
    let result = runner.run(invocation).await?;
    if !result.success() {
        return Err(Error::CommandFailed {
            exit_code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_args_matches_contiguous_run() {
        let inv = Invocation::new("kubectl").args(["get", "pods", "-n", "default"]);
        assert!(inv.has_args(&["get", "pods"]));
        assert!(inv.has_args(&["-n", "default"]));
        assert!(!inv.has_args(&["get", "default"]));
        assert!(inv.has_args(&[]));
    }

    #[test]
    fn test_debug_hides_stdin_and_env() {
        let inv = Invocation::new("kubectl")
            .args(["apply", "-f", "-"])
            .env("TOKEN", "secret")
            .stdin("kind: Secret");
        let printed = format!("{:?}", inv);
        assert_eq!(printed, "kubectl apply -f -");

        let inv = Invocation::new("kubectl").args(["--server", "https://k", "--token", "abc", "get", "ns"]);
        assert_eq!(format!("{:?}", inv), "kubectl --server https://k --token *** get ns");
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let runner = TokioProcessRunner::new();
        let result = runner
            .run(Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .expect("sh should run");
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let runner = TokioProcessRunner::new();
        let result = runner
            .run(Invocation::new("cat").stdin("hello"))
            .await
            .expect("cat should run");
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_error() {
        let runner = TokioProcessRunner::new();
        let err = runner
            .run(
                Invocation::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout(50)));
    }

    #[tokio::test]
    async fn test_run_checked_rejects_non_zero_exit() {
        let runner = TokioProcessRunner::new();
        let err = run_checked(&runner, Invocation::new("sh").args(["-c", "exit 1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_stream_yields_lines() {
        let runner = TokioProcessRunner::new();
        let stream = runner
            .stream(Invocation::new("sh").args(["-c", "echo a; echo b"]))
            .await
            .expect("stream should start");
        let lines: Vec<String> = stream.map(|l| l.unwrap()).collect().await;
        assert_eq!(lines, vec!["a\n".to_string(), "b\n".to_string()]);
    }
}
