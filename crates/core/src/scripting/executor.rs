//! Unified job execution interface and shared types.
//!
//! Defines [`ScriptExecutor`], the trait that all runtime executors implement,
//! along with [`ScriptInput`], [`ScriptOutput`], and [`ScriptError`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::LogStream;

/// A single line of child output, forwarded while the process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: LogStream,
    pub line: String,
}

/// Input data passed to a script executor.
#[derive(Debug, Clone)]
pub struct ScriptInput {
    /// JSON payload piped to the job's stdin.
    pub data: Value,
    /// Extra arguments appended after the script path.
    pub args: Vec<String>,
    /// Additional environment variables set for the child process.
    pub env_vars: Vec<(String, String)>,
    /// Inherited variables removed from the child environment.
    pub env_remove: Vec<String>,
    /// Working directory for the child process (uses current dir if `None`).
    pub working_directory: Option<PathBuf>,
    /// Maximum wall-clock time before the process is killed.
    pub timeout: Duration,
    /// Receives each stdout/stderr line as it is produced.
    pub output: Option<mpsc::Sender<OutputLine>>,
    /// Cancelling this token terminates the process.
    pub cancel: CancellationToken,
}

impl ScriptInput {
    /// Input with the given payload and timeout and nothing else set.
    pub fn new(data: Value, timeout: Duration) -> Self {
        Self {
            data,
            args: Vec::new(),
            env_vars: Vec::new(),
            env_remove: Vec::new(),
            working_directory: None,
            timeout,
            output: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Captured output from a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptOutput {
    /// Stdout captured from the process (capped).
    pub stdout: String,
    /// Stderr captured from the process (capped).
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Last non-empty stdout line parsed as JSON, if it is valid JSON.
    pub parsed_output: Option<Value>,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `max_lines` lines of stderr, for failure diagnostics.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Why a job could not run to completion.
///
/// A job that runs and exits non-zero is not an error here; callers
/// inspect [`ScriptOutput::exit_code`].
#[derive(Debug)]
pub enum ScriptError {
    /// Entrypoint path or program does not exist.
    NotFound(String),
    /// Entrypoint exists but cannot be executed.
    PermissionDenied(String),
    /// Killed after exceeding [`ScriptInput::timeout`].
    Timeout { elapsed_ms: u64 },
    /// Stopped because [`ScriptInput::cancel`] fired.
    Cancelled { elapsed_ms: u64 },
    /// Spawning, piping or waiting on the child failed.
    Io(std::io::Error),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "Entrypoint not found: {path}"),
            Self::PermissionDenied(detail) => write!(f, "Entrypoint not executable: {detail}"),
            Self::Timeout { elapsed_ms } => write!(f, "Job timed out after {elapsed_ms}ms"),
            Self::Cancelled { elapsed_ms } => write!(f, "Job cancelled after {elapsed_ms}ms"),
            Self::Io(err) => write!(f, "Job I/O error: {err}"),
        }
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Trait implemented by all runtime executors (shell, python, binary).
///
/// Each executor receives a file path and structured input, spawns the
/// appropriate subprocess, and returns structured output or an error.
pub trait ScriptExecutor: Send + Sync {
    /// Execute the script at `script_path` with the given `input`.
    fn execute(
        &self,
        script_path: &str,
        input: ScriptInput,
    ) -> impl std::future::Future<Output = Result<ScriptOutput, ScriptError>> + Send;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_entrypoint() {
        let err = ScriptError::NotFound("/opt/jobs/etl".to_string());
        assert_eq!(err.to_string(), "Entrypoint not found: /opt/jobs/etl");

        let err = ScriptError::Timeout { elapsed_ms: 5000 };
        assert_eq!(err.to_string(), "Job timed out after 5000ms");

        let err = ScriptError::Cancelled { elapsed_ms: 120 };
        assert_eq!(err.to_string(), "Job cancelled after 120ms");
    }

    #[test]
    fn only_io_errors_have_a_source() {
        let err = ScriptError::Io(std::io::Error::other("broken pipe"));
        assert!(std::error::Error::source(&err).is_some());

        let err = ScriptError::Cancelled { elapsed_ms: 100 };
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let output = ScriptOutput {
            stdout: String::new(),
            stderr: "one\ntwo\n\nthree\nfour\n".to_string(),
            exit_code: 1,
            duration_ms: 10,
            parsed_output: None,
        };
        assert_eq!(output.stderr_tail(2), "three\nfour");
        assert_eq!(output.stderr_tail(10), "one\ntwo\nthree\nfour");
        assert!(!output.success());
    }
}
