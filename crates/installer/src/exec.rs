//! Subprocess executor.
//!
//! Every external binary the installer runs (kubectl, terraform, helm,
//! mkcert, k3d, git) goes through [`Executor`], which:
//! - captures stdout and stderr for both success and failure
//! - bounds the call by a deadline and kills the child when it expires
//! - optionally streams output line by line into the log

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default deadline for short commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Lines of stderr kept for error reports from streamed commands.
const STDERR_TAIL_LINES: usize = 40;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr (tail only for streamed commands).
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Errors from running a subprocess.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program exited non-zero.
    #[error("{program} exited with {status:?}: {}", output.stderr.trim())]
    Failed {
        program: String,
        status: Option<i32>,
        output: CommandOutput,
    },

    /// The deadline passed; the child was killed.
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    /// Reading the child's pipes failed.
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Captured output, when the command ran to completion.
    #[must_use]
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// A single command invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl Invocation {
    /// Start describing a call to `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Merge extra environment on top of the ambient one.
    #[must_use]
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Set a single environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Override the deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map_or_else(|| self.program.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Next line from an optional pipe; `None` once closed.
async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

/// Runs [`Invocation`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    /// Run to completion, capturing both streams.
    ///
    /// # Errors
    /// Returns [`ExecError::Failed`] (with the captured output) on non-zero
    /// exit, [`ExecError::Timeout`] when the deadline passes.
    pub async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        let program = invocation.program_name();
        debug!(program = %program, args = ?invocation.args, "Running command");

        let child = invocation
            .command()
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(invocation.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                program: program.clone(),
                timeout: invocation.timeout,
            })?
            .map_err(|source| ExecError::Io {
                program: program.clone(),
                source,
            })?;

        let captured = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        Self::check(program, captured)
    }

    /// Run to completion, logging each output line as it arrives.
    ///
    /// Only the last lines of stderr are kept in the returned output.
    ///
    /// # Errors
    /// Same as [`Executor::run`].
    pub async fn run_streaming(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        let program = invocation.program_name();
        info!(program = %program, args = ?invocation.args, "Running command (streaming)");

        let mut child = invocation
            .command()
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let name = program.clone();

        let pump = async move {
            let mut stdout_buf = String::new();
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

            let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
            let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

            loop {
                tokio::select! {
                    line = next_line(&mut out_lines), if out_lines.is_some() => match line? {
                        Some(line) => {
                            info!(target: "k1_cli::exec", program = %name, "{line}");
                            stdout_buf.push_str(&line);
                            stdout_buf.push('\n');
                        }
                        None => out_lines = None,
                    },
                    line = next_line(&mut err_lines), if err_lines.is_some() => match line? {
                        Some(line) => {
                            warn!(target: "k1_cli::exec", program = %name, "{line}");
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        None => err_lines = None,
                    },
                    else => break,
                }
            }

            let status = child.wait().await?;
            let stderr_tail = tail.into_iter().collect::<Vec<_>>().join("\n");
            Ok::<_, std::io::Error>(CommandOutput {
                status: status.code(),
                stdout: stdout_buf,
                stderr: stderr_tail,
            })
        };

        let captured = tokio::time::timeout(invocation.timeout, pump)
            .await
            .map_err(|_| ExecError::Timeout {
                program: program.clone(),
                timeout: invocation.timeout,
            })?
            .map_err(|source| ExecError::Io {
                program: program.clone(),
                source,
            })?;

        Self::check(program, captured)
    }

    fn check(program: String, output: CommandOutput) -> Result<CommandOutput, ExecError> {
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::Failed {
                program,
                status: output.status,
                output,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = Executor
            .run(&Invocation::new("sh").args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_run_returns_streams_on_failure() {
        let err = Executor
            .run(&Invocation::new("sh").args(["-c", "echo out; echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        let output = err.output().unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_run_enforces_deadline() {
        let err = Executor
            .run(
                &Invocation::new("sh")
                    .args(["-c", "sleep 5"])
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_streaming_keeps_stderr_tail() {
        let err = Executor
            .run_streaming(&Invocation::new("sh").args([
                "-c",
                "for i in $(seq 1 60); do echo line$i >&2; done; exit 1",
            ]))
            .await
            .unwrap_err();
        let tail = &err.output().unwrap().stderr;
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.ends_with("line60"));
    }

    #[tokio::test]
    async fn test_env_is_merged() {
        let out = Executor
            .run(&Invocation::new("sh").args(["-c", "echo $K1_TEST_VALUE"]).env("K1_TEST_VALUE", "42"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = Executor
            .run(&Invocation::new("/nonexistent/k1-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
