//! `outpost-agent` library crate.
//!
//! The binary entrypoint lives in `main.rs`; the modules are exposed here
//! so integration tests can drive the loop against fake control planes.

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod runner;

pub use agent::{Agent, AgentPhase, AgentSummary, LoopSettings};
pub use client::{HttpWorkSource, WorkSource};
pub use config::AgentConfig;
pub use error::{AgentError, ConfigError, SourceError};
pub use runner::{ResourceConnector, RunOutcome, Runner, RunnerSettings};
