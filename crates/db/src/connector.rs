//! Local Resource Connector.
//!
//! [`connect`] builds a PostgreSQL pool with a bounded number of retries.
//! [`LocalResource`] owns that pool for the lifetime of the agent,
//! connecting on first use, and hands out connections through
//! [`LocalResource::with_connection`] so that every acquired connection is
//! returned to the pool when the caller's scope ends.

use std::future::Future;
use std::pin::Pin;

use outpost_core::backoff::{retry, RetryError, RetryPolicy};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgConnection;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseConfig;
use crate::error::{is_transient, ConnectionError};

pub type DbPool = sqlx::PgPool;

/// Future returned by a [`LocalResource::with_connection`] callback.
pub type ConnectionFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'c>>;

/// Create a connection pool, retrying transient failures per `policy`.
pub async fn connect(
    config: &DatabaseConfig,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<DbPool, ConnectionError> {
    let address = config.address();
    let options = config.connect_options();

    let result = retry(policy, cancel, is_transient, |attempt| {
        let options = options.clone();
        let address = address.clone();
        async move {
            tracing::info!(
                address = %address,
                attempt,
                "Connecting to local database",
            );
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.connect_timeout)
                .connect_with(options)
                .await
        }
    })
    .await;

    match result {
        Ok(pool) => {
            tracing::info!(address = %address, "Database connection pool created");
            Ok(pool)
        }
        Err(RetryError::Cancelled) => Err(ConnectionError::Cancelled),
        Err(RetryError::Failed { attempts, error }) if is_transient(&error) => {
            tracing::error!(address = %address, attempts, error = %error, "Database unreachable");
            Err(ConnectionError::Unreachable {
                address,
                attempts,
                source: error,
            })
        }
        Err(RetryError::Failed { error, .. }) => {
            tracing::error!(address = %address, error = %error, "Database rejected connection");
            Err(ConnectionError::Rejected {
                address,
                source: error,
            })
        }
    }
}

/// Run a trivial query to verify the connection works.
pub async fn health_check(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(conn).await?;
    Ok(())
}

/// A database reachable only from the execution host.
///
/// The pool is created on first use and shared by all runs; sqlx
/// serialises acquisition per connection slot.
pub struct LocalResource {
    config: DatabaseConfig,
    retry: RetryPolicy,
    pool: OnceCell<DbPool>,
}

impl LocalResource {
    pub fn new(config: DatabaseConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            retry,
            pool: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The shared pool, connecting (with retries) if needed.
    ///
    /// A failed connection is not cached; the next caller tries again.
    pub async fn pool(&self, cancel: &CancellationToken) -> Result<&DbPool, ConnectionError> {
        self.pool
            .get_or_try_init(|| connect(&self.config, &self.retry, cancel))
            .await
    }

    /// Acquire a connection, run `f` with it, and release it.
    ///
    /// The connection goes back to the pool when this returns, whether `f`
    /// succeeded or not. Acquisition itself is retried like connecting.
    pub async fn with_connection<T, F>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, ConnectionError>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> ConnectionFuture<'c, T>,
    {
        let pool = self.pool(cancel).await?;

        let mut conn = match retry(&self.retry, cancel, is_transient, |_| pool.acquire()).await {
            Ok(conn) => conn,
            Err(RetryError::Cancelled) => return Err(ConnectionError::Cancelled),
            Err(RetryError::Failed { attempts, error }) => {
                return Err(ConnectionError::Unreachable {
                    address: self.config.address(),
                    attempts,
                    source: error,
                })
            }
        };

        let result = f(&mut *conn).await;
        drop(conn);
        Ok(result?)
    }

    /// Verify the database answers a query.
    pub async fn check(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.with_connection(cancel, |conn| Box::pin(health_check(conn)))
            .await
    }

    /// Close the pool if it was ever opened.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            tracing::info!(address = %self.config.address(), "Database pool closed");
        }
    }
}
