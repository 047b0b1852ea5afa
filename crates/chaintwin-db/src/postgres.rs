//! `PostgreSQL` pool backing the durable node store.
//!
//! Queries are built at runtime (not compile-time checked) so the crate
//! builds without a live database. All queries are parameterized.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::DbError;

/// Pool size. Each node write holds one connection for a single statement.
const MAX_CONNECTIONS: u32 = 10;

/// Idle connections are recycled after five minutes.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection pool handle to `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Connect to `url`, waiting at most `acquire_timeout` for a connection
    /// on every query.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed, or
    /// [`DbError::Connectivity`] if the server cannot be reached.
    pub async fn connect(url: &str, acquire_timeout: Duration) -> Result<Self, DbError> {
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| DbError::Config(format!("Invalid database URL: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(IDLE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| DbError::postgres("postgres connect", &e))?;

        tracing::info!(
            max_connections = MAX_CONNECTIONS,
            acquire_timeout_ms = u64::try_from(acquire_timeout.as_millis()).unwrap_or(u64::MAX),
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Apply pending migrations (the `nodes` table).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if any migration fails.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Node store migrations applied");
        Ok(())
    }

    /// The underlying [`PgPool`].
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drain and close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}
