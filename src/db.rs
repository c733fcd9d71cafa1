use crate::config::Config;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    /// Builds the bounded connection pool and applies pending migrations.
    ///
    /// Pool sizing is tuned for a read-mostly 2M+ row workload: a handful of
    /// warm connections, idle recycling, and a short acquire timeout so that
    /// exhaustion surfaces as a retryable error instead of a hang.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.db_min_connections)
            .max_connections(config.db_max_connections)
            .idle_timeout(Duration::from_secs(config.db_idle_timeout_secs))
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .connect(&config.database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool })
    }
}
