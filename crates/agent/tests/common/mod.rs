//! Shared fixtures for agent integration tests: an in-memory work source
//! and helpers to build work items backed by temporary shell scripts.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use outpost_agent::client::{HeartbeatAck, StateAck};
use outpost_agent::{Agent, LoopSettings, ResourceConnector, Runner, RunnerSettings, SourceError, WorkSource};
use outpost_core::backoff::{BackoffConfig, RetryPolicy};
use outpost_core::run_state::RunState;
use outpost_core::types::{Deployment, Entrypoint, LogEntry, RunId, Runtime, WorkItem};
use serde_json::{json, Value};

/// What the next `poll` returns.
pub enum PollReply {
    Item(WorkItem),
    Empty,
    Transient,
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub run_id: RunId,
    pub state: RunState,
    pub message: Option<String>,
}

/// In-memory [`WorkSource`] that records everything the agent sends.
///
/// Once the scripted replies run out, every poll returns no work.
#[derive(Default)]
pub struct FakeSource {
    replies: Mutex<VecDeque<PollReply>>,
    polls: AtomicUsize,
    poll_times: Mutex<Vec<tokio::time::Instant>>,
    reports: Mutex<Vec<Report>>,
    log_batches: Mutex<Vec<Vec<LogEntry>>>,
    heartbeats: AtomicUsize,
    pending_cancels: Mutex<Vec<RunId>>,
    rejected: Mutex<HashSet<RunId>>,
    stall_claims: AtomicBool,
    stall_final_reports: AtomicBool,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Arc<Self> {
        let source = Self::new();
        for item in items {
            source.push(PollReply::Item(item));
        }
        source
    }

    pub fn push(&self, reply: PollReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Answer the claim for `run_id` with `reject`.
    pub fn reject_claim(&self, run_id: RunId) {
        self.rejected.lock().unwrap().insert(run_id);
    }

    /// Record `RUNNING` reports but never answer them.
    pub fn stall_claims(&self) {
        self.stall_claims.store(true, Ordering::SeqCst);
    }

    /// Record `COMPLETED` and `FAILED` reports but never answer them.
    pub fn stall_final_reports(&self) {
        self.stall_final_reports.store(true, Ordering::SeqCst);
    }

    /// Ask for `run_id` to be cancelled on the next heartbeat.
    pub fn request_cancel(&self, run_id: RunId) {
        self.pending_cancels.lock().unwrap().push(run_id);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn poll_times(&self) -> Vec<tokio::time::Instant> {
        self.poll_times.lock().unwrap().clone()
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    pub fn states_for(&self, run_id: RunId) -> Vec<RunState> {
        self.reports()
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .map(|r| r.state)
            .collect()
    }

    pub fn final_report(&self, run_id: RunId) -> Option<Report> {
        self.reports()
            .into_iter()
            .rev()
            .find(|r| r.run_id == run_id && r.state.is_terminal())
    }

    pub fn log_batches(&self) -> Vec<Vec<LogEntry>> {
        self.log_batches.lock().unwrap().clone()
    }

    pub fn log_lines(&self, run_id: RunId) -> Vec<String> {
        self.log_batches()
            .into_iter()
            .flatten()
            .filter(|entry| entry.run_id == run_id)
            .map(|entry| entry.message)
            .collect()
    }
}

#[async_trait]
impl WorkSource for FakeSource {
    async fn poll(&self, _pool: &str) -> Result<Option<WorkItem>, SourceError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.poll_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());

        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(PollReply::Item(item)) => Ok(Some(item)),
            Some(PollReply::Empty) | None => Ok(None),
            Some(PollReply::Transient) => Err(SourceError::Api {
                status: 503,
                body: "unavailable".to_string(),
            }),
            Some(PollReply::Unauthorized) => Err(SourceError::Unauthorized { status: 401 }),
        }
    }

    async fn report_status(
        &self,
        run_id: RunId,
        state: RunState,
        message: Option<String>,
        logs: Vec<LogEntry>,
    ) -> Result<StateAck, SourceError> {
        if !logs.is_empty() {
            self.send_logs(run_id, logs).await?;
        }
        self.reports.lock().unwrap().push(Report {
            run_id,
            state,
            message,
        });

        let stalled = match state {
            RunState::Running => self.stall_claims.load(Ordering::SeqCst),
            RunState::Completed | RunState::Failed => {
                self.stall_final_reports.load(Ordering::SeqCst)
            }
            _ => false,
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        if state == RunState::Running && self.rejected.lock().unwrap().contains(&run_id) {
            return Ok(StateAck::reject("claimed by another agent"));
        }
        Ok(StateAck::accept())
    }

    async fn send_logs(&self, _run_id: RunId, logs: Vec<LogEntry>) -> Result<(), SourceError> {
        self.log_batches.lock().unwrap().push(logs);
        Ok(())
    }

    async fn heartbeat(&self, _pool: &str, _running: &[RunId]) -> Result<HeartbeatAck, SourceError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let cancel = std::mem::take(&mut *self.pending_cancels.lock().unwrap());
        Ok(HeartbeatAck { cancel })
    }
}

/// A work item that runs `body` with bash.
///
/// The returned temp file must outlive the run.
pub fn shell_item(body: &str) -> (WorkItem, tempfile::NamedTempFile) {
    let mut script = tempfile::Builder::new()
        .suffix(".sh")
        .tempfile()
        .expect("create temp script");
    writeln!(script, "#!/bin/bash").expect("write shebang");
    write!(script, "{body}").expect("write body");
    script.flush().expect("flush script");

    let item = WorkItem {
        id: RunId::new_v4(),
        deployment: Deployment {
            id: RunId::new_v4(),
            name: "test-deployment".to_string(),
            flow_name: "Test Flow".to_string(),
            work_pool: "test-pool".to_string(),
            entrypoint: Entrypoint {
                runtime: Runtime::Shell,
                path: script.path().to_str().expect("utf-8 path").to_string(),
                args: vec![],
            },
            parameters: json!({}),
            requires_local_resource: false,
            timeout_secs: None,
        },
        parameters: json!({}),
        state: RunState::Pending,
        created_at: None,
    };
    (item, script)
}

pub fn with_parameters(mut item: WorkItem, defaults: Value, overrides: Value) -> WorkItem {
    item.deployment.parameters = defaults;
    item.parameters = overrides;
    item
}

pub fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, BackoffConfig::fixed(Duration::from_millis(5)))
}

pub fn runner_settings(work_dir: &Path) -> RunnerSettings {
    RunnerSettings {
        work_pool: "test-pool".to_string(),
        agent_name: "test-agent".to_string(),
        work_dir: work_dir.to_path_buf(),
        default_timeout: Duration::from_secs(30),
        report_retry: quick_retry(2),
        ..RunnerSettings::default()
    }
}

pub fn loop_settings() -> LoopSettings {
    LoopSettings {
        work_pool: "test-pool".to_string(),
        poll_interval: Duration::from_millis(50),
        max_concurrent_runs: 4,
        shutdown_grace: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(3600),
        poll_backoff: BackoffConfig::fixed(Duration::from_millis(20)),
        claim_retry: quick_retry(1),
    }
}

pub fn build_runner(
    source: &Arc<FakeSource>,
    resource: Option<Arc<dyn ResourceConnector>>,
    work_dir: &Path,
) -> Arc<Runner> {
    let source: Arc<dyn WorkSource> = source.clone();
    Arc::new(Runner::new(source, resource, runner_settings(work_dir)))
}

pub fn build_agent(
    source: &Arc<FakeSource>,
    resource: Option<Arc<dyn ResourceConnector>>,
    settings: LoopSettings,
    work_dir: &Path,
) -> Agent {
    let runner = build_runner(source, resource, work_dir);
    let source: Arc<dyn WorkSource> = source.clone();
    Agent::new(settings, source, runner)
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Every recorded state for a run is a legal step from the previous one,
/// starting from `PENDING`.
pub fn assert_monotonic(states: &[RunState]) {
    let mut current = RunState::Pending;
    for &next in states {
        assert!(
            current.can_transition_to(next),
            "illegal transition {current} -> {next} in {states:?}"
        );
        current = next;
    }
}
