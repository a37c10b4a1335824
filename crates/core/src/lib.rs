//! Domain types and execution primitives shared by the agent and jobs.
//!
//! Nothing in this crate talks to the network or a database.

pub mod backoff;
pub mod error;
pub mod run_state;
pub mod scripting;
pub mod types;
