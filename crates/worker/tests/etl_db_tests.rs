//! Database steps against a throwaway PostgreSQL database.
//!
//! Run with `DATABASE_URL` pointing at a server the tests may create
//! databases on, and `--ignored`.

use assert_matches::assert_matches;
use outpost_etl::pipeline::{extract, run_steps, setup_table, SEED_TABLE};
use outpost_etl::{EtlError, EtlParams};
use serde_json::{json, Value};
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Test: table setup
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = false)]
#[ignore = "requires PostgreSQL"]
async fn setup_creates_and_seeds_table_once(pool: PgPool) {
    assert!(setup_table(&pool).await.unwrap());
    assert!(!setup_table(&pool).await.unwrap());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sample_data")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 3);
}

// ---------------------------------------------------------------------------
// Test: extract
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = false)]
#[ignore = "requires PostgreSQL"]
async fn extract_returns_rows_keyed_by_column(pool: PgPool) {
    setup_table(&pool).await.unwrap();

    let mut records = extract(&pool, SEED_TABLE).await.unwrap();
    records.sort_by_key(|r| r["id"].as_i64());

    let names: Vec<&Value> = records.iter().map(|r| &r["name"]).collect();
    assert_eq!(names, [&json!("Alice"), &json!("Bob"), &json!("Charlie")]);
    assert_eq!(records[1]["value"], json!(150));
    assert!(records[0].contains_key("created_at"));
}

#[sqlx::test(migrations = false)]
#[ignore = "requires PostgreSQL"]
async fn extract_from_unknown_table_fails(pool: PgPool) {
    let err = extract(&pool, "no_such_table").await.unwrap_err();
    assert_matches!(err, EtlError::Extract { table, .. } if table == "no_such_table");
}

// ---------------------------------------------------------------------------
// Test: full flow
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = false)]
#[ignore = "requires PostgreSQL"]
async fn run_steps_writes_transformed_records(pool: PgPool) {
    let out_dir = tempfile::tempdir().unwrap();
    let params = EtlParams {
        multiplier: 2.0,
        ..EtlParams::default()
    };

    let summary = run_steps(&pool, &params, out_dir.path()).await.unwrap();

    assert_eq!(summary.rows, 3);
    assert_eq!(summary.output_file.as_deref(), Some("output_data.txt"));

    let written = std::fs::read_to_string(out_dir.path().join("output_data.txt")).unwrap();
    let mut processed: Vec<f64> = written
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap())
        .map(|r| r["processed_value"].as_f64().unwrap())
        .collect();
    processed.sort_by(f64::total_cmp);
    assert_eq!(processed, [200.0, 300.0, 400.0]);
}

#[sqlx::test(migrations = false)]
#[ignore = "requires PostgreSQL"]
async fn empty_table_skips_transform_and_load(pool: PgPool) {
    sqlx::query("CREATE TABLE empty_source (id SERIAL PRIMARY KEY, value INTEGER)")
        .execute(&pool)
        .await
        .unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let params = EtlParams {
        table_name: "empty_source".to_string(),
        ..EtlParams::default()
    };

    let summary = run_steps(&pool, &params, out_dir.path()).await.unwrap();

    assert_eq!(summary.rows, 0);
    assert_eq!(summary.output_file, None);
    assert!(!out_dir.path().join("output_data.txt").exists());
}
