//! Setup, extract, transform and load steps.
//!
//! Each step is a free function over a borrowed pool or record set so the
//! database steps can be tested against a throwaway database and the pure
//! steps without one. [`run`] strings them together and owns the pool.

use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use outpost_core::backoff::RetryPolicy;
use outpost_db::{DatabaseConfig, DbPool};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::types::Json;
use tokio_util::sync::CancellationToken;

use crate::error::EtlError;
use crate::params::{quote_identifier, EtlParams};

pub type Record = Map<String, Value>;

/// Table created and seeded on first run.
pub const SEED_TABLE: &str = "sample_data";

const SEED_ROWS: [(&str, i32); 3] = [("Alice", 100), ("Bob", 150), ("Charlie", 200)];

/// Records echoed to the log by [`load`].
const PREVIEW_RECORDS: usize = 5;

/// Printed as the job's last stdout line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EtlSummary {
    pub rows: usize,
    pub output_file: Option<String>,
}

/// Connect, run every step, and close the pool whatever the outcome.
pub async fn run(
    config: &DatabaseConfig,
    policy: &RetryPolicy,
    params: &EtlParams,
    cancel: &CancellationToken,
) -> Result<EtlSummary, EtlError> {
    tracing::info!(
        database = %config.name,
        address = %config.address(),
        "Starting local DB ETL",
    );

    let pool = outpost_db::connect(config, policy, cancel).await?;
    let result = run_steps(&pool, params, Path::new(".")).await;
    pool.close().await;
    tracing::info!("Database connection closed");

    result
}

/// Everything after the connection is established. Output paths are
/// resolved against `out_dir`.
pub async fn run_steps(
    pool: &DbPool,
    params: &EtlParams,
    out_dir: &Path,
) -> Result<EtlSummary, EtlError> {
    setup_table(pool).await?;

    let records = extract(pool, &params.table_name).await?;
    if records.is_empty() {
        tracing::warn!(table = %params.table_name, "No data extracted, skipping transform and load");
        return Ok(EtlSummary {
            rows: 0,
            output_file: None,
        });
    }

    let records = transform(records, params.multiplier, unix_now())?;
    let path = out_dir.join(&params.output_filename);
    load(&records, &path)?;

    Ok(EtlSummary {
        rows: records.len(),
        output_file: Some(params.output_filename.clone()),
    })
}

/// Create and seed [`SEED_TABLE`] if it does not exist yet.
///
/// Runs in one transaction; dropping it on error rolls back. Returns
/// whether the table was created.
pub async fn setup_table(pool: &DbPool) -> Result<bool, EtlError> {
    let mut tx = pool.begin().await.map_err(EtlError::Setup)?;

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_name = $1)",
    )
    .bind(SEED_TABLE)
    .fetch_one(&mut *tx)
    .await
    .map_err(EtlError::Setup)?;

    if exists {
        tracing::info!(table = SEED_TABLE, "Table already exists");
        return Ok(false);
    }

    tracing::info!(table = SEED_TABLE, "Table does not exist, creating and populating");
    sqlx::query(
        r#"CREATE TABLE sample_data (
            id SERIAL PRIMARY KEY,
            name VARCHAR(50),
            value INTEGER,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )"#,
    )
    .execute(&mut *tx)
    .await
    .map_err(EtlError::Setup)?;

    for (name, value) in SEED_ROWS {
        sqlx::query("INSERT INTO sample_data (name, value) VALUES ($1, $2)")
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(EtlError::Setup)?;
    }

    tx.commit().await.map_err(EtlError::Setup)?;
    tracing::info!(table = SEED_TABLE, rows = SEED_ROWS.len(), "Table created and populated");
    Ok(true)
}

/// Every row of `table` as a JSON object keyed by column name.
pub async fn extract(pool: &DbPool, table: &str) -> Result<Vec<Record>, EtlError> {
    let query = format!("SELECT to_jsonb(t) FROM {} AS t", quote_identifier(table)?);
    tracing::info!(query = %query, "Executing query");

    let rows: Vec<Json<Record>> = sqlx::query_scalar(&query)
        .fetch_all(pool)
        .await
        .map_err(|source| EtlError::Extract {
            table: table.to_string(),
            source,
        })?;

    tracing::info!(table, rows = rows.len(), "Extracted rows");
    Ok(rows.into_iter().map(|Json(record)| record).collect())
}

/// Add `processed_value` and `processed_at_agent` to each record.
///
/// A missing or null `value` counts as zero; any other non-number is an
/// error.
pub fn transform(
    mut records: Vec<Record>,
    multiplier: f64,
    processed_at: f64,
) -> Result<Vec<Record>, EtlError> {
    tracing::info!(records = records.len(), multiplier, "Transforming records");

    for record in &mut records {
        let value = match record.get("value") {
            None | Some(Value::Null) => 0.0,
            Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
            Some(other) => {
                return Err(EtlError::Record(format!("'value' is not a number: {other}")));
            }
        };
        record.insert("processed_value".to_string(), Value::from(value * multiplier));
        record.insert("processed_at_agent".to_string(), Value::from(processed_at));
    }

    tracing::info!("Transformation complete");
    Ok(records)
}

/// Log a preview of `records` and write them to `path`, one JSON object
/// per line.
pub fn load(records: &[Record], path: &Path) -> Result<(), EtlError> {
    tracing::info!(records = records.len(), "Loading records");
    for record in records.iter().take(PREVIEW_RECORDS) {
        let shown = Value::Object(record.clone());
        tracing::info!("{shown}");
    }
    if records.len() > PREVIEW_RECORDS {
        tracing::info!("... and {} more records.", records.len() - PREVIEW_RECORDS);
    }

    let write_err = |source| EtlError::Write {
        path: path.display().to_string(),
        source,
    };
    let file = std::fs::File::create(path).map_err(write_err)?;
    let mut out = std::io::BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record).map_err(|e| write_err(e.into()))?;
        out.write_all(b"\n").map_err(write_err)?;
    }
    out.flush().map_err(write_err)?;

    tracing::info!(path = %path.display(), "Data written");
    Ok(())
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
