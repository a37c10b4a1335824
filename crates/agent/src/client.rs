//! Work Source Client: the agent's side of the control-plane API.
//!
//! [`WorkSource`] is the seam the agent loop and runner are written
//! against; [`HttpWorkSource`] is the production implementation.
//!
//! | Operation       | Request                                          |
//! |-----------------|--------------------------------------------------|
//! | claim           | `POST /work_pools/{pool}/runs/claim`             |
//! | state change    | `POST /runs/{id}/state`                          |
//! | log shipping    | `POST /runs/{id}/logs`                           |
//! | heartbeat       | `POST /agents/{agent}/heartbeat`                 |

use std::time::Duration;

use async_trait::async_trait;
use outpost_core::run_state::RunState;
use outpost_core::types::{LogEntry, RunId, WorkItem};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Upper bound on a single control-plane request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error bodies longer than this are truncated before logging.
const MAX_ERROR_BODY: usize = 512;

/// The control plane's answer to a proposed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accept,
    /// The transition is not allowed, e.g. the run was claimed elsewhere.
    Reject,
    /// The run should be abandoned.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAck {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StateAck {
    pub fn accept() -> Self {
        Self {
            status: AckStatus::Accept,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Reject,
            reason: Some(reason.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == AckStatus::Accept
    }
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Runs an operator asked to cancel.
    #[serde(default)]
    pub cancel: Vec<RunId>,
}

/// Body of `POST /runs/{id}/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `POST /work_pools/{pool}/runs/claim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub agent: String,
}

/// Body of `POST /agents/{agent}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub work_pool: String,
    pub running: Vec<RunId>,
}

/// Remote source of work and sink for run status.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Claim the next runnable item from `pool`, if any.
    async fn poll(&self, pool: &str) -> Result<Option<WorkItem>, SourceError>;

    /// Propose a state change. `logs` are shipped before the state.
    async fn report_status(
        &self,
        run_id: RunId,
        state: RunState,
        message: Option<String>,
        logs: Vec<LogEntry>,
    ) -> Result<StateAck, SourceError>;

    /// Ship a batch of log lines for a run.
    async fn send_logs(&self, run_id: RunId, logs: Vec<LogEntry>) -> Result<(), SourceError>;

    /// Report liveness and the runs in flight.
    async fn heartbeat(&self, pool: &str, running: &[RunId]) -> Result<HeartbeatAck, SourceError>;
}

/// [`WorkSource`] over HTTP(S) with bearer-token authentication.
pub struct HttpWorkSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    agent_name: String,
}

impl HttpWorkSource {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("outpost-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            agent_name: agent_name.into(),
        })
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, SourceError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl WorkSource for HttpWorkSource {
    async fn poll(&self, pool: &str) -> Result<Option<WorkItem>, SourceError> {
        let body = ClaimRequest {
            agent: self.agent_name.clone(),
        };
        let response = self
            .post(&format!("work_pools/{pool}/runs/claim"), &body)
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        // The item is already claimed for us; log the raw body so the run
        // can be recovered by hand.
        let bytes = response.bytes().await?;
        let item: WorkItem = serde_json::from_slice(&bytes).map_err(|e| {
            tracing::error!(
                pool,
                error = %e,
                body = %String::from_utf8_lossy(&bytes),
                "Claimed work item could not be decoded",
            );
            SourceError::Decode(e.to_string())
        })?;
        tracing::debug!(run_id = %item.id, pool, "Claimed work item");
        Ok(Some(item))
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

        let body = StateRequest { state, message };
        let response = self.post(&format!("runs/{run_id}/state"), &body).await?;
        decode(response).await
    }

    async fn send_logs(&self, run_id: RunId, logs: Vec<LogEntry>) -> Result<(), SourceError> {
        if logs.is_empty() {
            return Ok(());
        }
        self.post(&format!("runs/{run_id}/logs"), &logs).await?;
        Ok(())
    }

    async fn heartbeat(&self, pool: &str, running: &[RunId]) -> Result<HeartbeatAck, SourceError> {
        let body = HeartbeatRequest {
            work_pool: pool.to_string(),
            running: running.to_vec(),
        };
        let response = self
            .post(&format!("agents/{}/heartbeat", self.agent_name), &body)
            .await?;

        // An empty body means nothing to cancel.
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(HeartbeatAck::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

/// Map non-success responses to [`SourceError`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SourceError::Unauthorized {
            status: status.as_u16(),
        });
    }
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        body.truncate(cut);
        body.push_str("...");
    }
    Err(SourceError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SourceError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| SourceError::Decode(e.to_string()))
}
