//! Local Resource Connector for the execution host's PostgreSQL database.
//!
//! The database is reachable only from the local network; neither its
//! address nor its credentials are ever sent to the control plane.

pub mod config;
pub mod connector;
pub mod error;

pub use config::DatabaseConfig;
pub use connector::{connect, health_check, ConnectionFuture, DbPool, LocalResource};
pub use error::ConnectionError;
