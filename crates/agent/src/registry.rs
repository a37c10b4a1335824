//! In-flight run registry.
//!
//! Owned by the agent loop. Each entry holds the run's own
//! [`CancellationToken`], so a single run can be stopped (remote
//! cancellation) or all of them at once (shutdown after the grace period).
//! A run that has started sending its terminal state is marked, so a
//! forced shutdown never reports it a second time.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use outpost_core::run_state::RunState;
use outpost_core::types::RunId;
use tokio_util::sync::CancellationToken;

struct RunEntry {
    deployment: String,
    started_at: Instant,
    cancel: CancellationToken,
    /// Terminal state whose report is under way.
    reporting: Option<RunState>,
}

/// Snapshot of one in-flight run.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: RunId,
    pub deployment: String,
    pub started_at: Instant,
    pub reporting: Option<RunState>,
}

/// A run left in the registry when the agent stopped waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned {
    pub run_id: RunId,
    /// Set if the run had already started reporting this terminal state.
    pub reporting: Option<RunState>,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
        // Entries stay consistent even if a holder panicked.
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new run and return its cancellation token.
    ///
    /// Returns `None` if the run is already registered.
    pub fn register(&self, run_id: RunId, deployment: &str) -> Option<CancellationToken> {
        let mut runs = self.lock();
        if runs.contains_key(&run_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        runs.insert(
            run_id,
            RunEntry {
                deployment: deployment.to_string(),
                started_at: Instant::now(),
                cancel: cancel.clone(),
                reporting: None,
            },
        );
        Some(cancel)
    }

    /// Stop tracking a run. Returns `false` if it was not registered.
    pub fn remove(&self, run_id: RunId) -> bool {
        self.lock().remove(&run_id).is_some()
    }

    /// Cancel one run. Returns `false` if it is not in flight.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.lock().get(&run_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight run, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let runs = self.lock();
        for entry in runs.values() {
            entry.cancel.cancel();
        }
        runs.len()
    }

    /// Record that `run_id` is about to report `state` as its final state.
    /// Returns `false` if the run is not registered.
    pub fn mark_reporting(&self, run_id: RunId, state: RunState) -> bool {
        match self.lock().get_mut(&run_id) {
            Some(entry) => {
                entry.reporting = Some(state);
                true
            }
            None => false,
        }
    }

    /// Remove and return every remaining run.
    pub fn drain(&self) -> Vec<Abandoned> {
        self.lock()
            .drain()
            .map(|(run_id, entry)| Abandoned {
                run_id,
                reporting: entry.reporting,
            })
            .collect()
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.lock().contains_key(&run_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn running_ids(&self) -> Vec<RunId> {
        self.lock().keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| RunInfo {
                run_id: *id,
                deployment: entry.deployment.clone(),
                started_at: entry.started_at,
                reporting: entry.reporting,
            })
            .collect();
        runs.sort_by_key(|info| info.started_at);
        runs
    }
}
