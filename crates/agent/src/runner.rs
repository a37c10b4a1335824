//! Execution Runner.
//!
//! Takes one claimed [`WorkItem`] from `RUNNING` to a terminal state:
//! local resource pre-flight, per-run working directory, subprocess
//! execution with streamed logs, and the final status report. Every
//! failure inside a run ends as a reported state; nothing here returns an
//! error to the agent loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use outpost_core::backoff::{retry, BackoffConfig, RetryPolicy};
use outpost_core::run_state::RunState;
use outpost_core::scripting::execute_entrypoint;
use outpost_core::scripting::executor::{OutputLine, ScriptError, ScriptInput, ScriptOutput};
use outpost_core::types::{Entrypoint, LogEntry, LogStream, RunId, Runtime, WorkItem};
use outpost_db::{ConnectionError, LocalResource};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::WorkSource;
use crate::config::API_KEY_VAR;
use crate::error::SourceError;
use crate::registry::RunRegistry;

/// Maximum log lines per `send_logs` request.
pub const LOG_BATCH_SIZE: usize = 50;

/// Buffered log lines are flushed at least this often.
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// How long the runner waits for buffered logs to ship after a job ends.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Stderr lines attached to a failure diagnostic.
const STDERR_TAIL_LINES: usize = 20;

/// A local resource the runner can verify before starting a job.
#[async_trait]
pub trait ResourceConnector: Send + Sync {
    /// Check the resource answers, retrying a bounded number of times.
    async fn check(&self, cancel: &CancellationToken) -> Result<(), ConnectionError>;

    /// Environment variables that let a job connect to the resource.
    fn job_env(&self) -> Vec<(String, String)>;
}

#[async_trait]
impl ResourceConnector for LocalResource {
    async fn check(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        LocalResource::check(self, cancel).await
    }

    fn job_env(&self) -> Vec<(String, String)> {
        self.config().to_env_vars()
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub work_pool: String,
    pub agent_name: String,
    /// Each run gets `{work_dir}/{run_id}` as its working directory.
    pub work_dir: PathBuf,
    /// Used when the deployment has no timeout of its own.
    pub default_timeout: Duration,
    /// Retries for the terminal status report.
    pub report_retry: RetryPolicy,
    /// Variables removed from every job environment.
    pub env_remove: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            work_pool: "default".to_string(),
            agent_name: "outpost".to_string(),
            work_dir: PathBuf::from("./runs"),
            default_timeout: Duration::from_secs(3600),
            report_retry: RetryPolicy::new(3, BackoffConfig::default()),
            env_remove: vec![API_KEY_VAR.to_string()],
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: RunState,
    /// Diagnostic sent with the terminal state.
    pub message: String,
    /// The job's JSON result, if its stdout ended with one.
    pub result: Option<Value>,
    pub duration: Duration,
}

struct Finished {
    state: RunState,
    message: String,
    result: Option<Value>,
}

impl Finished {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            state: RunState::Failed,
            message: message.into(),
            result: None,
        }
    }

    fn cancelled(message: impl Into<String>) -> Self {
        Self {
            state: RunState::Cancelled,
            message: message.into(),
            result: None,
        }
    }
}

pub struct Runner {
    source: Arc<dyn WorkSource>,
    resource: Option<Arc<dyn ResourceConnector>>,
    settings: RunnerSettings,
    registry: Arc<RunRegistry>,
}

impl Runner {
    pub fn new(
        source: Arc<dyn WorkSource>,
        resource: Option<Arc<dyn ResourceConnector>>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            source,
            resource,
            settings,
            registry: Arc::new(RunRegistry::new()),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Runs in flight on this runner. Shared with the agent loop.
    pub fn registry(&self) -> Arc<RunRegistry> {
        Arc::clone(&self.registry)
    }

    /// Execute a claimed item and report its terminal state.
    ///
    /// The item must already be `RUNNING` on the control plane.
    pub async fn run(&self, item: &WorkItem, cancel: CancellationToken) -> RunOutcome {
        let started = Instant::now();
        tracing::info!(
            run_id = %item.id,
            deployment = %item.deployment.name,
            flow = %item.deployment.flow_name,
            "Run started",
        );

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let shipper = tokio::spawn(ship_logs(Arc::clone(&self.source), item.id, rx));

        let finished = self.execute(item, &cancel, &tx).await;
        agent_line(&tx, &finished.message).await;
        drop(tx);

        match tokio::time::timeout(LOG_DRAIN_TIMEOUT, shipper).await {
            Ok(Ok(shipped)) => tracing::debug!(run_id = %item.id, shipped, "Run logs flushed"),
            Ok(Err(e)) => tracing::warn!(run_id = %item.id, error = %e, "Log shipper stopped"),
            Err(_) => tracing::warn!(run_id = %item.id, "Log shipping did not finish in time"),
        }

        self.registry.mark_reporting(item.id, finished.state);
        self.report_final(item.id, finished.state, &finished.message)
            .await;

        let duration = started.elapsed();
        match finished.state {
            RunState::Completed => tracing::info!(
                run_id = %item.id,
                duration_ms = duration.as_millis() as u64,
                "Run completed",
            ),
            RunState::Cancelled => tracing::info!(
                run_id = %item.id,
                message = %finished.message,
                "Run cancelled",
            ),
            _ => tracing::warn!(
                run_id = %item.id,
                message = %finished.message,
                "Run failed",
            ),
        }

        RunOutcome {
            run_id: item.id,
            state: finished.state,
            message: finished.message,
            result: finished.result,
            duration,
        }
    }

    /// Report a run whose task panicked as failed.
    pub async fn report_panic(&self, item: &WorkItem, started: Instant) -> RunOutcome {
        let message = "Run task panicked".to_string();
        tracing::error!(run_id = %item.id, "Run task panicked");
        self.registry.mark_reporting(item.id, RunState::Failed);
        self.report_final(item.id, RunState::Failed, &message).await;
        RunOutcome {
            run_id: item.id,
            state: RunState::Failed,
            message,
            result: None,
            duration: started.elapsed(),
        }
    }

    async fn execute(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
        logs: &mpsc::Sender<OutputLine>,
    ) -> Finished {
        let mut env = vec![
            ("OUTPOST_RUN_ID".to_string(), item.id.to_string()),
            ("OUTPOST_DEPLOYMENT".to_string(), item.deployment.name.clone()),
            ("OUTPOST_WORK_POOL".to_string(), self.settings.work_pool.clone()),
            ("OUTPOST_AGENT_NAME".to_string(), self.settings.agent_name.clone()),
        ];

        if item.deployment.requires_local_resource {
            let Some(resource) = &self.resource else {
                return Finished::failed(
                    "Deployment requires the local resource, but none is configured",
                );
            };

            agent_line(logs, "Checking local resource").await;
            match resource.check(cancel).await {
                Ok(()) => env.extend(resource.job_env()),
                Err(ConnectionError::Cancelled) => {
                    return Finished::cancelled(
                        "Run cancelled while connecting to the local resource",
                    )
                }
                Err(e) => {
                    tracing::warn!(run_id = %item.id, error = %e, "Local resource pre-flight failed");
                    return Finished::failed(format!("{}: {e}", e.kind()));
                }
            }
        }

        if cancel.is_cancelled() {
            return Finished::cancelled("Run cancelled before the job started");
        }

        let run_dir = self.settings.work_dir.join(item.id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            return Finished::failed(format!(
                "Failed to create working directory {}: {e}",
                run_dir.display()
            ));
        }

        let entrypoint = match resolve_entrypoint(&item.deployment.entrypoint) {
            Ok(entrypoint) => entrypoint,
            Err(e) => return Finished::failed(format!("Failed to resolve entrypoint: {e}")),
        };

        let timeout = item
            .deployment
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_timeout);

        let mut input = ScriptInput::new(item.effective_parameters(), timeout);
        input.env_vars = env;
        input.env_remove = self.settings.env_remove.clone();
        input.working_directory = Some(run_dir);
        input.output = Some(logs.clone());
        input.cancel = cancel.clone();

        tracing::debug!(
            run_id = %item.id,
            path = %entrypoint.path,
            runtime = ?entrypoint.runtime,
            timeout_secs = timeout.as_secs(),
            "Launching job",
        );

        classify(execute_entrypoint(&entrypoint, input).await)
    }

    async fn report_final(&self, run_id: RunId, state: RunState, message: &str) {
        // Final reports go out even during shutdown.
        let never = CancellationToken::new();
        let result = retry(
            &self.settings.report_retry,
            &never,
            SourceError::is_transient,
            |_| {
                self.source
                    .report_status(run_id, state, Some(message.to_string()), Vec::new())
            },
        )
        .await;

        match result {
            Ok(ack) if ack.is_accepted() => {}
            Ok(ack) => tracing::warn!(
                run_id = %run_id,
                state = %state,
                status = ?ack.status,
                reason = ?ack.reason,
                "Control plane did not accept the final state",
            ),
            Err(e) => tracing::error!(
                run_id = %run_id,
                state = %state,
                error = %e,
                "Failed to report final state",
            ),
        }
    }
}

/// Map the executor result to a terminal state and diagnostic.
fn classify(result: Result<ScriptOutput, ScriptError>) -> Finished {
    match result {
        Ok(output) if output.success() => Finished {
            state: RunState::Completed,
            message: format!("Job completed in {}ms", output.duration_ms),
            result: output.parsed_output,
        },
        Ok(output) => {
            let tail = output.stderr_tail(STDERR_TAIL_LINES);
            if tail.is_empty() {
                Finished::failed(format!("Job exited with code {}", output.exit_code))
            } else {
                Finished::failed(format!(
                    "Job exited with code {}: {tail}",
                    output.exit_code
                ))
            }
        }
        Err(ScriptError::Cancelled { elapsed_ms }) => {
            Finished::cancelled(format!("Run cancelled after {elapsed_ms}ms"))
        }
        Err(ScriptError::Timeout { elapsed_ms }) => {
            Finished::failed(format!("Job timed out after {elapsed_ms}ms"))
        }
        Err(e) => Finished::failed(format!("Job could not be executed: {e}")),
    }
}

/// Make relative script paths independent of the per-run working
/// directory. Bare binary names are left for `PATH` lookup.
fn resolve_entrypoint(entrypoint: &Entrypoint) -> std::io::Result<Entrypoint> {
    let path = Path::new(&entrypoint.path);
    let bare_binary =
        entrypoint.runtime == Runtime::Binary && path.components().count() == 1;
    if path.is_absolute() || bare_binary {
        return Ok(entrypoint.clone());
    }

    let absolute = std::env::current_dir()?.join(path);
    Ok(Entrypoint {
        path: absolute.to_string_lossy().into_owned(),
        ..entrypoint.clone()
    })
}

async fn agent_line(tx: &mpsc::Sender<OutputLine>, line: &str) {
    let _ = tx
        .send(OutputLine {
            stream: LogStream::Agent,
            line: line.to_string(),
        })
        .await;
}

/// Forward job output to the control plane in batches.
///
/// Returns the number of lines shipped. A batch that fails to send is
/// dropped; the run itself is unaffected.
async fn ship_logs(
    source: Arc<dyn WorkSource>,
    run_id: RunId,
    mut rx: mpsc::Receiver<OutputLine>,
) -> usize {
    let mut batch: Vec<LogEntry> = Vec::with_capacity(LOG_BATCH_SIZE);
    let mut shipped = 0;
    let mut ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    batch.push(LogEntry::new(run_id, line.stream, line.line));
                    if batch.len() >= LOG_BATCH_SIZE {
                        shipped += flush(source.as_ref(), run_id, &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                shipped += flush(source.as_ref(), run_id, &mut batch).await;
            }
        }
    }

    shipped + flush(source.as_ref(), run_id, &mut batch).await
}

async fn flush(source: &dyn WorkSource, run_id: RunId, batch: &mut Vec<LogEntry>) -> usize {
    if batch.is_empty() {
        return 0;
    }
    let logs = std::mem::take(batch);
    let count = logs.len();
    match source.send_logs(run_id, logs).await {
        Ok(()) => count,
        Err(e) => {
            tracing::warn!(run_id = %run_id, dropped = count, error = %e, "Failed to ship run logs");
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
