//! `outpost-etl` -- the local database ETL job.
//!
//! Launched by the agent as a subprocess. Reads its parameters as JSON on
//! stdin and the database settings from `DB_*` environment variables,
//! then seeds, extracts, transforms and loads the sample table.

pub mod error;
pub mod params;
pub mod pipeline;

pub use error::EtlError;
pub use params::EtlParams;
pub use pipeline::{run, EtlSummary};
