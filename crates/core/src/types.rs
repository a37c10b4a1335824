//! Shared domain types for work pools, deployments, runs, and logs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::run_state::RunState;

/// Runs and deployments are identified by UUIDs assigned by the control plane.
pub type RunId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Maximum length of a work pool or agent name.
const MAX_NAME_LEN: usize = 128;

/// Validate a work pool or agent name.
///
/// Names end up in URL path segments, so only ASCII alphanumerics,
/// hyphen, underscore, and dot are accepted.
pub fn validate_name(kind: &str, name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(format!("{kind} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "{kind} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(format!(
            "{kind} '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// A named queue that deployments publish into and agents poll from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPool {
    pub name: String,
    /// Pool type, e.g. `"process"`.
    #[serde(rename = "type", default = "default_pool_type")]
    pub pool_type: String,
}

fn default_pool_type() -> String {
    "process".to_string()
}

impl WorkPool {
    /// Build a `process` pool after validating its name.
    pub fn process(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        validate_name("work pool name", &name)?;
        Ok(Self {
            name,
            pool_type: default_pool_type(),
        })
    }
}

/// Runtime used to launch a deployment's entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// Run the entrypoint with `bash`.
    Shell,
    /// Run the entrypoint with a Python interpreter.
    Python,
    /// Execute the entrypoint directly.
    Binary,
}

/// What to execute for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    pub runtime: Runtime,
    /// Script or binary path (a bare name is looked up on `PATH`).
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A job definition bound to a work pool. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: RunId,
    pub name: String,
    pub flow_name: String,
    pub work_pool: String,
    pub entrypoint: Entrypoint,
    /// Default parameters, overridden per run.
    #[serde(default = "empty_object")]
    pub parameters: Value,
    /// The job needs the local database; the runner checks it first.
    #[serde(default)]
    pub requires_local_resource: bool,
    /// Per-deployment wall-clock limit. Falls back to the agent default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A unit of work claimed from a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: RunId,
    pub deployment: Deployment,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    pub state: RunState,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl WorkItem {
    /// Deployment defaults overlaid with this run's parameters.
    pub fn effective_parameters(&self) -> Value {
        merge_parameters(&self.deployment.parameters, &self.parameters)
    }
}

/// Overlay `overrides` onto `defaults` key by key.
///
/// Only top-level keys are merged. If either side is not a JSON object
/// the override wins outright (unless it is `null`).
pub fn merge_parameters(defaults: &Value, overrides: &Value) -> Value {
    match (defaults, overrides) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, value) in over {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, over) => over.clone(),
    }
}

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Emitted by the agent itself about the run.
    Agent,
}

/// Severity attached to shipped log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One log line shipped to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: RunId,
    pub stream: LogStream,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: Timestamp,
}

impl LogEntry {
    /// Build an entry stamped with the current time.
    ///
    /// Stderr lines are shipped at warning level; they are often
    /// ordinary progress output, so they are not treated as errors.
    pub fn new(run_id: RunId, stream: LogStream, message: impl Into<String>) -> Self {
        let level = match stream {
            LogStream::Stderr => LogLevel::Warning,
            LogStream::Stdout | LogStream::Agent => LogLevel::Info,
        };
        Self {
            run_id,
            stream,
            level,
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn deployment(parameters: Value) -> Deployment {
        Deployment {
            id: RunId::new_v4(),
            name: "local-db-etl".to_string(),
            flow_name: "Local DB ETL".to_string(),
            work_pool: "local-pool".to_string(),
            entrypoint: Entrypoint {
                runtime: Runtime::Binary,
                path: "outpost-etl".to_string(),
                args: vec![],
            },
            parameters,
            requires_local_resource: true,
            timeout_secs: None,
        }
    }

    #[test]
    fn valid_names() {
        assert!(validate_name("pool", "local-pool").is_ok());
        assert!(validate_name("pool", "etl_pool.v2").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("pool", "").is_err());
        assert!(validate_name("pool", "pool/../admin").is_err());
        assert!(validate_name("pool", "my pool").is_err());
        assert!(validate_name("pool", &"p".repeat(200)).is_err());
    }

    #[test]
    fn process_pool_defaults_type() {
        let pool = WorkPool::process("local-pool").unwrap();
        assert_eq!(pool.pool_type, "process");
        let json = serde_json::to_value(&pool).unwrap();
        assert_eq!(json["type"], "process");
    }

    #[test]
    fn run_parameters_override_deployment_defaults() {
        let item = WorkItem {
            id: RunId::new_v4(),
            deployment: deployment(json!({"table_name": "sample_data", "multiplier": 1.1})),
            parameters: json!({"multiplier": 2.0}),
            state: RunState::Pending,
            created_at: None,
        };
        let merged = item.effective_parameters();
        assert_eq!(merged["table_name"], "sample_data");
        assert_eq!(merged["multiplier"], 2.0);
    }

    #[test]
    fn null_override_keeps_defaults() {
        let merged = merge_parameters(&json!({"a": 1}), &Value::Null);
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn work_item_deserializes_with_missing_optionals() {
        let id = RunId::new_v4();
        let raw = json!({
            "id": id,
            "state": "PENDING",
            "deployment": {
                "id": RunId::new_v4(),
                "name": "etl",
                "flow_name": "Local DB ETL",
                "work_pool": "local-pool",
                "entrypoint": { "runtime": "shell", "path": "flows/etl.sh" }
            }
        });
        let item: WorkItem = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(item.id, id);
        assert_eq!(item.deployment.entrypoint.runtime, Runtime::Shell);
        assert!(item.deployment.entrypoint.args.is_empty());
        assert!(!item.deployment.requires_local_resource);
        assert_eq!(item.parameters, json!({}));
    }

    #[test]
    fn stderr_lines_are_warnings() {
        let entry = LogEntry::new(RunId::new_v4(), LogStream::Stderr, "progress");
        assert_eq!(entry.level, LogLevel::Warning);
        let entry = LogEntry::new(entry.run_id, LogStream::Agent, "Job finished");
        assert_eq!(entry.level, LogLevel::Info);
    }
}
