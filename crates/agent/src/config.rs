//! Agent configuration loaded from environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use outpost_core::backoff::{BackoffConfig, RetryPolicy};
use outpost_core::types::{validate_name, WorkPool};
use outpost_db::DatabaseConfig;

use crate::agent::LoopSettings;
use crate::error::ConfigError;
use crate::runner::RunnerSettings;

/// Variable holding the control-plane API key. Removed from job environments.
pub const API_KEY_VAR: &str = "OUTPOST_API_KEY";

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Everything the agent process needs to start.
///
/// `Debug` output redacts the API key and the database password.
#[derive(Clone)]
pub struct AgentConfig {
    /// Control-plane base URL, without a trailing slash.
    pub api_url: String,
    pub api_key: String,
    pub work_pool: String,
    pub agent_name: String,
    pub poll_interval: Duration,
    pub max_concurrent_runs: usize,
    /// How long in-flight runs may keep going after shutdown is requested.
    pub shutdown_grace: Duration,
    pub heartbeat_interval: Duration,
    /// Default run timeout when the deployment does not set one.
    pub run_timeout: Duration,
    /// Parent of the per-run working directories.
    pub work_dir: PathBuf,
    pub database: DatabaseConfig,
    /// Retries applied to the local database pre-flight check.
    pub db_retry: RetryPolicy,
    pub log_format: LogFormat,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("work_pool", &self.work_pool)
            .field("agent_name", &self.agent_name)
            .field("poll_interval", &self.poll_interval)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("run_timeout", &self.run_timeout)
            .field("work_dir", &self.work_dir)
            .field("database", &self.database)
            .field("db_retry", &self.db_retry)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl AgentConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                   | Default           |
    /// |---------------------------|-------------------|
    /// | `OUTPOST_API_URL`         | required          |
    /// | `OUTPOST_API_KEY`         | required          |
    /// | `OUTPOST_WORK_POOL`       | required          |
    /// | `OUTPOST_AGENT_NAME`      | `outpost-<uuid8>` |
    /// | `POLL_INTERVAL_SECS`      | `10`              |
    /// | `MAX_CONCURRENT_RUNS`     | `4`               |
    /// | `SHUTDOWN_GRACE_SECS`     | `30`              |
    /// | `HEARTBEAT_INTERVAL_SECS` | `30`              |
    /// | `RUN_TIMEOUT_SECS`        | `3600`            |
    /// | `WORK_DIR`                | `./runs`          |
    /// | `DB_CONNECT_RETRIES`      | `2`               |
    /// | `DB_RETRY_DELAY_SECS`     | `5`               |
    /// | `LOG_FORMAT`              | `text`            |
    ///
    /// Database settings (`DB_HOST`, `DB_PORT`, ...) are read by
    /// [`DatabaseConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_url = lookup("OUTPOST_API_URL").ok_or(ConfigError::Missing("OUTPOST_API_URL"))?;
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "OUTPOST_API_URL",
                message: format!("expected an http(s) URL, got '{api_url}'"),
            });
        }
        let api_url = api_url.trim_end_matches('/').to_string();

        let api_key = lookup(API_KEY_VAR).ok_or(ConfigError::Missing(API_KEY_VAR))?;

        let work_pool =
            lookup("OUTPOST_WORK_POOL").ok_or(ConfigError::Missing("OUTPOST_WORK_POOL"))?;
        let work_pool = WorkPool::process(work_pool)
            .map_err(|e| ConfigError::Invalid {
                key: "OUTPOST_WORK_POOL",
                message: e.to_string(),
            })?
            .name;

        let agent_name = lookup("OUTPOST_AGENT_NAME").unwrap_or_else(default_agent_name);
        validate_name("agent name", &agent_name).map_err(|e| ConfigError::Invalid {
            key: "OUTPOST_AGENT_NAME",
            message: e.to_string(),
        })?;

        let max_concurrent_runs: usize = parse_or(&lookup, "MAX_CONCURRENT_RUNS", 4)?;
        if max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_RUNS",
                message: "must be at least 1".to_string(),
            });
        }

        let poll_interval = secs(parse_or(&lookup, "POLL_INTERVAL_SECS", 10)?);
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "POLL_INTERVAL_SECS",
                message: "must be at least 1".to_string(),
            });
        }

        let heartbeat_interval = secs(parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", 30)?);
        if heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "HEARTBEAT_INTERVAL_SECS",
                message: "must be at least 1".to_string(),
            });
        }

        let database = DatabaseConfig::from_lookup(&lookup).map_err(|e| ConfigError::Invalid {
            key: "DB_*",
            message: e.to_string(),
        })?;

        let db_retry = RetryPolicy::new(
            parse_or(&lookup, "DB_CONNECT_RETRIES", 2)?,
            BackoffConfig::fixed(secs(parse_or(&lookup, "DB_RETRY_DELAY_SECS", 5)?)),
        );

        let log_format = match lookup("LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };

        Ok(Self {
            api_url,
            api_key,
            work_pool,
            agent_name,
            poll_interval,
            max_concurrent_runs,
            shutdown_grace: secs(parse_or(&lookup, "SHUTDOWN_GRACE_SECS", 30)?),
            heartbeat_interval,
            run_timeout: secs(parse_or(&lookup, "RUN_TIMEOUT_SECS", 3600)?),
            work_dir: PathBuf::from(lookup("WORK_DIR").unwrap_or_else(|| "./runs".to_string())),
            database,
            db_retry,
            log_format,
        })
    }

    /// Settings for the coordinating loop.
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            work_pool: self.work_pool.clone(),
            poll_interval: self.poll_interval,
            max_concurrent_runs: self.max_concurrent_runs,
            shutdown_grace: self.shutdown_grace,
            heartbeat_interval: self.heartbeat_interval,
            ..LoopSettings::default()
        }
    }

    /// Settings for the execution runner.
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            work_pool: self.work_pool.clone(),
            agent_name: self.agent_name.clone(),
            work_dir: self.work_dir.clone(),
            default_timeout: self.run_timeout,
            ..RunnerSettings::default()
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Invalid {
                key: "LOG_FORMAT",
                message: format!("expected 'text' or 'json', got '{other}'"),
            }),
        }
    }
}

fn default_agent_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("outpost-{}", &id[..8])
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            message: format!("expected a non-negative integer, got '{raw}'"),
        }),
        None => Ok(default),
    }
}
