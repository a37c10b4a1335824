//! Agent Loop.
//!
//! One coordinating loop polls the work source, claims items, and hands
//! each one to the [`Runner`] on its own task. Concurrency is bounded by a
//! semaphore; a poll only happens while a permit is free. The loop never
//! runs jobs itself, so a slow or failing job cannot stall polling.
//!
//! ```text
//! IDLE -> POLLING -> DISPATCHING -> RUNNING (n) -> IDLE
//! ```
//!
//! Shutdown stops polling immediately, lets in-flight runs finish for the
//! grace period, then cancels whatever is left.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use outpost_core::backoff::{next_delay, retry, BackoffConfig, RetryError, RetryPolicy};
use outpost_core::run_state::RunState;
use outpost_core::scripting::subprocess::KILL_GRACE;
use outpost_core::types::WorkItem;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::client::WorkSource;
use crate::error::{AgentError, SourceError};
use crate::registry::RunRegistry;
use crate::runner::{RunOutcome, Runner};

/// Extra time after [`KILL_GRACE`] for cancelled runs to report.
const CANCEL_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// Waiting for the next poll with nothing in flight.
    Idle,
    Polling,
    /// Claiming an item and starting its run.
    Dispatching,
    /// Waiting for the next poll while runs are in flight.
    Running,
    /// Shutdown requested; draining in-flight runs.
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub work_pool: String,
    /// Wait after a poll that returned no work.
    pub poll_interval: Duration,
    pub max_concurrent_runs: usize,
    pub shutdown_grace: Duration,
    pub heartbeat_interval: Duration,
    /// Backoff for transient control-plane failures while polling.
    pub poll_backoff: BackoffConfig,
    /// Retries for the `RUNNING` claim report.
    pub claim_retry: RetryPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            work_pool: "default".to_string(),
            poll_interval: Duration::from_secs(10),
            max_concurrent_runs: 4,
            shutdown_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            poll_backoff: BackoffConfig::default(),
            claim_retry: RetryPolicy::new(2, BackoffConfig::default()),
        }
    }
}

/// Counters returned when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSummary {
    pub polls: u64,
    pub claimed: u64,
    /// Claimed items the control plane handed to someone else.
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl AgentSummary {
    fn record(&mut self, state: RunState) {
        match state {
            RunState::Completed => self.completed += 1,
            RunState::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
    }
}

enum Tick {
    Shutdown,
    Joined(Result<RunOutcome, JoinError>),
    Heartbeat,
    Poll,
}

pub struct Agent {
    settings: LoopSettings,
    source: Arc<dyn WorkSource>,
    runner: Arc<Runner>,
    registry: Arc<RunRegistry>,
    semaphore: Arc<Semaphore>,
    phase: watch::Sender<AgentPhase>,
}

impl Agent {
    pub fn new(settings: LoopSettings, source: Arc<dyn WorkSource>, runner: Arc<Runner>) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1)));
        let (phase, _) = watch::channel(AgentPhase::Idle);
        Self {
            settings,
            source,
            registry: runner.registry(),
            runner,
            semaphore,
            phase,
        }
    }

    /// Subscribe to phase changes.
    pub fn phase(&self) -> watch::Receiver<AgentPhase> {
        self.phase.subscribe()
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        Arc::clone(&self.registry)
    }

    fn set_phase(&self, phase: AgentPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                tracing::trace!(from = ?*current, to = ?phase, "Agent phase");
                *current = phase;
                true
            }
        });
    }

    fn settle_phase(&self) {
        if self.registry.is_empty() {
            self.set_phase(AgentPhase::Idle);
        } else {
            self.set_phase(AgentPhase::Running);
        }
    }

    /// Run until `shutdown` fires or a fatal control-plane error occurs.
    ///
    /// In-flight runs are drained in both cases before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<AgentSummary, AgentError> {
        tracing::info!(
            work_pool = %self.settings.work_pool,
            max_concurrent_runs = self.settings.max_concurrent_runs,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "Agent loop started",
        );

        let mut tasks: JoinSet<RunOutcome> = JoinSet::new();
        let mut summary = AgentSummary::default();
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut next_poll = tokio::time::Instant::now();
        let mut backoff = self.settings.poll_backoff.initial_delay;

        let exit = loop {
            self.settle_phase();

            let tick = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Tick::Shutdown,
                Some(joined) = tasks.join_next() => Tick::Joined(joined),
                _ = heartbeat.tick() => Tick::Heartbeat,
                _ = tokio::time::sleep_until(next_poll),
                    if self.semaphore.available_permits() > 0 => Tick::Poll,
            };

            match tick {
                Tick::Shutdown => {
                    tracing::info!("Shutdown requested, polling stopped");
                    break Ok(());
                }
                Tick::Joined(joined) => self.finish(joined, &mut summary),
                Tick::Heartbeat => {
                    if let Err(e) = self.send_heartbeat(&shutdown).await {
                        if e.is_fatal() {
                            break Err(AgentError::ControlPlane(e));
                        }
                        tracing::warn!(error = %e, "Heartbeat failed");
                    }
                }
                Tick::Poll => {
                    // Only this loop acquires permits, so one is free here.
                    let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                        continue;
                    };

                    self.set_phase(AgentPhase::Polling);
                    summary.polls += 1;
                    let polled = tokio::select! {
                        _ = shutdown.cancelled() => continue,
                        polled = self.source.poll(&self.settings.work_pool) => polled,
                    };

                    match polled {
                        Ok(Some(item)) => {
                            backoff = self.settings.poll_backoff.initial_delay;
                            // Poll again right away while capacity remains.
                            next_poll = tokio::time::Instant::now();
                            summary.claimed += 1;
                            if let Err(e) = self
                                .dispatch(item, permit, &shutdown, &mut tasks, &mut summary)
                                .await
                            {
                                break Err(AgentError::ControlPlane(e));
                            }
                        }
                        Ok(None) => {
                            backoff = self.settings.poll_backoff.initial_delay;
                            next_poll = tokio::time::Instant::now() + self.settings.poll_interval;
                            tracing::debug!(
                                work_pool = %self.settings.work_pool,
                                "No work available",
                            );
                        }
                        Err(e) if e.is_fatal() => {
                            tracing::error!(error = %e, "Control plane rejected credentials");
                            break Err(AgentError::ControlPlane(e));
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                retry_in_ms = backoff.as_millis() as u64,
                                "Poll failed, backing off",
                            );
                            next_poll = tokio::time::Instant::now() + backoff;
                            backoff = next_delay(backoff, &self.settings.poll_backoff);
                        }
                    }
                }
            }
        };

        self.drain(&mut tasks, &mut summary).await;
        self.set_phase(AgentPhase::Stopped);

        tracing::info!(
            polls = summary.polls,
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Agent loop stopped",
        );

        exit.map(|()| summary)
    }

    /// Claim `item` by moving it to `RUNNING`, then start its run.
    ///
    /// Only fatal errors are returned; anything else skips the item.
    /// Shutdown interrupts the confirmation.
    async fn dispatch(
        &self,
        item: WorkItem,
        permit: OwnedSemaphorePermit,
        shutdown: &CancellationToken,
        tasks: &mut JoinSet<RunOutcome>,
        summary: &mut AgentSummary,
    ) -> Result<(), SourceError> {
        self.set_phase(AgentPhase::Dispatching);
        let run_id = item.id;

        if let Err(e) = item.state.transition(RunState::Running) {
            tracing::warn!(run_id = %run_id, error = %e, "Claimed item is not runnable, skipping");
            summary.skipped += 1;
            return Ok(());
        }

        let Some(cancel) = self.registry.register(run_id, &item.deployment.name) else {
            tracing::warn!(run_id = %run_id, "Run is already in flight, skipping duplicate claim");
            summary.skipped += 1;
            return Ok(());
        };

        let message = Some(format!("Claimed by agent {}", self.runner.settings().agent_name));
        let ack = retry(
            &self.settings.claim_retry,
            shutdown,
            SourceError::is_transient,
            |_| {
                self.source
                    .report_status(run_id, RunState::Running, message.clone(), Vec::new())
            },
        )
        .await;

        match ack {
            Ok(ack) if ack.is_accepted() => {}
            Ok(ack) => {
                tracing::info!(
                    run_id = %run_id,
                    status = ?ack.status,
                    reason = ?ack.reason,
                    "Claim not confirmed, skipping",
                );
                self.registry.remove(run_id);
                summary.skipped += 1;
                return Ok(());
            }
            Err(RetryError::Cancelled) => {
                tracing::info!(run_id = %run_id, "Shutdown while confirming claim, skipping");
                self.registry.remove(run_id);
                summary.skipped += 1;
                return Ok(());
            }
            Err(RetryError::Failed { error, .. }) if error.is_fatal() => {
                self.registry.remove(run_id);
                return Err(error);
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to confirm claim, skipping");
                self.registry.remove(run_id);
                summary.skipped += 1;
                return Ok(());
            }
        }

        let runner = Arc::clone(&self.runner);
        tasks.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            match AssertUnwindSafe(runner.run(&item, cancel)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => runner.report_panic(&item, started).await,
            }
        });
        tracing::debug!(run_id = %run_id, in_flight = tasks.len(), "Run dispatched");
        Ok(())
    }

    fn finish(&self, joined: Result<RunOutcome, JoinError>, summary: &mut AgentSummary) {
        match joined {
            Ok(outcome) => {
                self.registry.remove(outcome.run_id);
                summary.record(outcome.state);
            }
            // Aborted runs are counted and reported from the registry by `drain`.
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(error = %e, "Run task ended abnormally");
                summary.failed += 1;
            }
        }
    }

    async fn send_heartbeat(&self, shutdown: &CancellationToken) -> Result<(), SourceError> {
        let running = self.registry.running_ids();
        let ack = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            ack = self.source.heartbeat(&self.settings.work_pool, &running) => ack?,
        };

        for run_id in ack.cancel {
            if self.registry.cancel(run_id) {
                tracing::info!(run_id = %run_id, "Cancellation requested by control plane");
            }
        }
        Ok(())
    }

    /// Wait for in-flight runs: first for the grace period, then cancel
    /// them and wait for their subprocesses to be terminated.
    async fn drain(&self, tasks: &mut JoinSet<RunOutcome>, summary: &mut AgentSummary) {
        if tasks.is_empty() {
            return;
        }
        self.set_phase(AgentPhase::Stopping);
        tracing::info!(
            in_flight = tasks.len(),
            grace_secs = self.settings.shutdown_grace.as_secs(),
            "Waiting for in-flight runs",
        );

        if self
            .join_until(tasks, summary, self.settings.shutdown_grace)
            .await
        {
            return;
        }

        let cancelled = self.registry.cancel_all();
        tracing::warn!(cancelled, "Grace period expired, cancelling in-flight runs");

        if self
            .join_until(tasks, summary, KILL_GRACE + CANCEL_REPORT_TIMEOUT)
            .await
        {
            return;
        }

        tracing::error!(remaining = tasks.len(), "Runs did not stop, aborting");
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            self.finish(joined, summary);
        }

        for abandoned in self.registry.drain() {
            let run_id = abandoned.run_id;
            if let Some(state) = abandoned.reporting {
                // Its terminal report was already sent; never follow it
                // with a second one.
                tracing::warn!(
                    run_id = %run_id,
                    state = %state,
                    "Run aborted while reporting its final state",
                );
                summary.record(state);
                continue;
            }

            summary.cancelled += 1;
            let report = self.source.report_status(
                run_id,
                RunState::Cancelled,
                Some("Agent shut down".to_string()),
                Vec::new(),
            );
            match tokio::time::timeout(CANCEL_REPORT_TIMEOUT, report).await {
                Ok(Ok(_)) => tracing::info!(run_id = %run_id, "Aborted run reported cancelled"),
                Ok(Err(e)) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Failed to report aborted run")
                }
                Err(_) => tracing::warn!(run_id = %run_id, "Cancellation report timed out"),
            }
        }
    }

    /// Join tasks until all are done (`true`) or `limit` passes (`false`).
    async fn join_until(
        &self,
        tasks: &mut JoinSet<RunOutcome>,
        summary: &mut AgentSummary,
        limit: Duration,
    ) -> bool {
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => self.finish(joined, summary),
                    None => return true,
                },
                _ = &mut deadline => return false,
            }
        }
    }
}
