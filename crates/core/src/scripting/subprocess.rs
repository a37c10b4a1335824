//! Shared subprocess management utilities.
//!
//! Provides [`run_command`], the common subprocess execution logic used by
//! all three executors (shell, python, binary). Each executor builds a
//! [`tokio::process::Command`] appropriate for its runtime and delegates
//! the actual spawn + I/O + timeout + cancellation handling here.
//!
//! Children run in their own process group so that termination reaches
//! anything the job spawned, not just the top-level interpreter.

use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::executor::{OutputLine, ScriptError, ScriptInput, ScriptOutput};
use crate::types::LogStream;

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Output exceeding this limit is still forwarded line by line but is
/// no longer kept in [`ScriptOutput`].
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Time a terminated job gets between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for output readers after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawn `cmd` as a child process, pipe JSON input to stdin, stream and
/// capture stdout/stderr, and enforce the configured timeout and
/// cancellation.
///
/// The caller is responsible for setting the command program and script
/// path before calling this function. Arguments, environment, and working
/// directory from [`ScriptInput`] are applied here.
pub async fn run_command(
    cmd: &mut Command,
    input: ScriptInput,
) -> Result<ScriptOutput, ScriptError> {
    // `kill_on_drop(true)` ensures the child is killed if this future is dropped.
    cmd.args(&input.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    // SAFETY: the closure runs between fork and exec and only calls
    // `setpgid`, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }

    for (key, value) in &input.env_vars {
        cmd.env(key, value);
    }
    for key in &input.env_remove {
        cmd.env_remove(key);
    }

    if let Some(dir) = &input.working_directory {
        cmd.current_dir(dir);
    }

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => ScriptError::NotFound(program.clone()),
        ErrorKind::PermissionDenied => ScriptError::PermissionDenied(program.clone()),
        _ => ScriptError::Io(e),
    })?;

    // Write the JSON payload from a separate task so a job that never
    // reads stdin cannot stall us on a full pipe.
    if let Some(mut stdin) = child.stdin.take() {
        let json_bytes = serde_json::to_vec(&input.data).unwrap_or_default();
        tokio::spawn(async move {
            let _ = stdin.write_all(&json_bytes).await;
        });
    }

    let stdout_task = tokio::spawn(read_lines(
        child.stdout.take(),
        LogStream::Stdout,
        input.output.clone(),
    ));
    let stderr_task = tokio::spawn(read_lines(
        child.stderr.take(),
        LogStream::Stderr,
        input.output.clone(),
    ));

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep(input.timeout) => Waited::TimedOut,
        _ = input.cancel.cancelled() => Waited::Cancelled,
    };

    match waited {
        Waited::Exited(Ok(status)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let stdout = drain(stdout_task).await;
            let stderr = drain(stderr_task).await;
            let exit_code = status.code().unwrap_or(-1);
            let parsed_output = parse_output(&stdout);

            Ok(ScriptOutput {
                stdout,
                stderr,
                exit_code,
                duration_ms,
                parsed_output,
            })
        }
        Waited::Exited(Err(e)) => Err(ScriptError::Io(e)),
        Waited::TimedOut => {
            tracing::warn!(program = %program, "Job timed out, terminating");
            terminate(&mut child, KILL_GRACE).await;
            let _ = drain(stdout_task).await;
            let _ = drain(stderr_task).await;
            Err(ScriptError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
        Waited::Cancelled => {
            tracing::info!(program = %program, "Job cancelled, terminating");
            terminate(&mut child, KILL_GRACE).await;
            let _ = drain(stdout_task).await;
            let _ = drain(stderr_task).await;
            Err(ScriptError::Cancelled {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

/// Stop a child: SIGTERM its process group, wait up to `grace`, then
/// SIGKILL whatever is left.
pub async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group(pid, libc::SIGTERM);
            let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
            // Stragglers in the group are killed either way.
            signal_group(pid, libc::SIGKILL);
            if exited {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // SAFETY: `kill` has no memory-safety preconditions. A negative pid
    // addresses the process group the child created with `setpgid(0, 0)`.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        tracing::debug!(pid, signal, "Signalling job process group failed");
    }
}

/// Await an output reader, giving up after [`DRAIN_TIMEOUT`].
///
/// A grandchild that inherited the pipe can keep it open after the job
/// exits; in that case whatever the reader holds is abandoned.
async fn drain(task: JoinHandle<String>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

/// Read a stream line by line, forwarding each line to `sink` and
/// capturing up to [`MAX_OUTPUT_BYTES`].
async fn read_lines<R: AsyncRead + Unpin>(
    handle: Option<R>,
    stream: LogStream,
    sink: Option<mpsc::Sender<OutputLine>>,
) -> String {
    let mut captured = String::new();
    let Some(handle) = handle else {
        return captured;
    };

    let mut reader = BufReader::new(handle);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&raw);
                let line = decoded.trim_end_matches(['\n', '\r']);

                if captured.len() + line.len() < MAX_OUTPUT_BYTES {
                    captured.push_str(line);
                    captured.push('\n');
                }

                if let Some(tx) = &sink {
                    // A closed receiver only stops forwarding; capture continues.
                    let _ = tx
                        .send(OutputLine {
                            stream,
                            line: line.to_string(),
                        })
                        .await;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Job output stream read failed");
                break;
            }
        }
    }

    captured
}

/// Parse job stdout as JSON: the whole stream first, then its last
/// non-empty line (jobs usually log before printing a summary).
fn parse_output(stdout: &str) -> Option<Value> {
    serde_json::from_str(stdout.trim()).ok().or_else(|| {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| serde_json::from_str(line).ok())
    })
}
