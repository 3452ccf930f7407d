//! External process execution with a hard timeout.
//!
//! [`CommandRunner`] is the seam between filter stages and the operating
//! system: the syntax stage only ever talks to this trait, which lets tests
//! substitute a recording runner and assert that no process was spawned.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ProcessError;

/// Longest stdout/stderr excerpt kept in memory, in bytes.
const MAX_CAPTURE_BYTES: usize = 16 * 1024;

/// A single process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            timeout: Duration::from_secs(120),
        }
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
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg1 arg2`, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Spawns processes. A timeout is reported as [`ProcessError::Timeout`], after
/// the process has been killed.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        tracing::debug!(
            command = %spec.display(),
            cwd = %spec.working_dir.display(),
            "Spawning process"
        );

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Dropping the `wait_with_output` future on timeout drops the child,
        // and `kill_on_drop` terminates it.
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: capture(&output.stdout),
                stderr: capture(&output.stderr),
                duration: start.elapsed(),
            }),
            Ok(Err(source)) => Err(ProcessError::Wait {
                program: spec.program.clone(),
                source,
            }),
            Err(_) => {
                tracing::warn!(
                    command = %spec.display(),
                    timeout_secs = spec.timeout.as_secs(),
                    "Process timed out and was killed"
                );
                Err(ProcessError::Timeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                })
            }
        }
    }
}

fn capture(bytes: &[u8]) -> String {
    let clipped = &bytes[..bytes.len().min(MAX_CAPTURE_BYTES)];
    String::from_utf8_lossy(clipped).into_owned()
}

/// Locate `program` the way a shell would: as a path if it contains a
/// separator, otherwise by searching `PATH`.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
