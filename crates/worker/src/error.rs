use outpost_db::ConnectionError;

#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error("Invalid job parameters: {0}")]
    Params(String),

    #[error("Invalid table name '{0}'")]
    InvalidTable(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Table setup failed: {0}")]
    Setup(#[source] sqlx::Error),

    #[error("Extraction from '{table}' failed: {source}")]
    Extract {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Malformed record: {0}")]
    Record(String),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
