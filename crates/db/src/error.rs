/// Failures reaching or using the local database.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Every connection attempt failed with a retryable error.
    #[error("Database at {address} unreachable after {attempts} attempt(s): {source}")]
    Unreachable {
        address: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// The server answered but refused the connection (bad credentials,
    /// unknown database, ...). Not retried.
    #[error("Database at {address} rejected the connection: {source}")]
    Rejected {
        address: String,
        #[source]
        source: sqlx::Error,
    },

    /// Cancellation fired while connecting.
    #[error("Database connection cancelled")]
    Cancelled,

    /// A statement failed on an established connection.
    #[error("Database error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Invalid database configuration: {0}")]
    Config(String),
}

impl ConnectionError {
    /// Short machine-readable kind, attached to run failure diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } | Self::Rejected { .. } => "connection_error",
            Self::Cancelled => "cancelled",
            Self::Query(_) => "query_error",
            Self::Config(_) => "config_error",
        }
    }
}

/// Whether a connection-phase error is worth another attempt.
///
/// I/O failures and pool timeouts usually mean the server is still
/// starting or briefly unreachable. SQLSTATE class `08` (connection
/// exception) and `57P03` (cannot connect now) are transient too;
/// authentication and catalog errors are not.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || code == "57P03")
            .unwrap_or(false),
        _ => false,
    }
}
