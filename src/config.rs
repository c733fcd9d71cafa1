use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    /// Base URL of the upstream registry feed (SODA-style JSON endpoint).
    pub feed_base_url: String,
    /// Optional app token forwarded as `X-App-Token` to avoid throttling.
    pub feed_app_token: Option<String>,
    /// Fixed page size for feed pulls; the feed enforces a hard cap.
    pub feed_page_size: u32,
    /// Seconds before a single feed request times out.
    pub feed_timeout_secs: u64,
    /// Retry attempts for a transient feed failure before skipping the page.
    pub feed_max_retries: u32,

    /// Rows per batched upsert into the carrier store.
    pub ingest_batch_size: usize,
    /// Full refreshes a record may miss before being marked inactive.
    pub inactive_grace_refreshes: i32,

    pub db_min_connections: u32,
    pub db_max_connections: u32,
    /// Idle connections are recycled after this many seconds.
    pub db_idle_timeout_secs: u64,
    /// Pool acquire timeout; exceeding it surfaces as a retryable 503.
    pub db_acquire_timeout_secs: u64,

    /// Server-enforced maximum page size for search queries.
    pub max_page_size: u32,

    /// Directory for export artifacts.
    pub export_dir: String,
    /// Rows fetched from the query engine per export chunk.
    pub export_chunk_size: u32,
    /// CSV exports larger than this are rejected up front.
    pub export_max_rows_csv: u64,
    /// Hours before an export artifact expires and becomes sweepable.
    pub export_ttl_hours: i64,

    /// Optional JSON file overriding the default lead score weight table.
    pub score_weights_path: Option<String>,

    /// Whether the in-process job scheduler runs (daily refresh, stats, sweeps).
    pub scheduler_enabled: bool,
    /// Hour of day (UTC) for the scheduled full refresh.
    pub refresh_schedule_hour: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            feed_base_url: std::env::var("FEED_BASE_URL")
                .unwrap_or_else(|_| {
                    "https://data.transportation.gov/resource/az4n-8mr2.json".to_string()
                })
                .trim()
                .to_string(),
            feed_app_token: std::env::var("SODA_APP_TOKEN")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            feed_page_size: parse_env("FEED_PAGE_SIZE", 50_000)?,
            feed_timeout_secs: parse_env("FEED_TIMEOUT_SECS", 30)?,
            feed_max_retries: parse_env("FEED_MAX_RETRIES", 3)?,
            ingest_batch_size: parse_env("INGEST_BATCH_SIZE", 1000)?,
            inactive_grace_refreshes: parse_env("INACTIVE_GRACE_REFRESHES", 2)?,
            db_min_connections: parse_env("DB_MIN_CONNECTIONS", 5)?,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 20)?,
            db_idle_timeout_secs: parse_env("DB_IDLE_TIMEOUT_SECS", 300)?,
            db_acquire_timeout_secs: parse_env("DB_ACQUIRE_TIMEOUT_SECS", 10)?,
            max_page_size: parse_env("MAX_PAGE_SIZE", 1000)?,
            export_dir: std::env::var("EXPORT_DIR")
                .unwrap_or_else(|_| "/tmp/fmcsa_exports".to_string()),
            export_chunk_size: parse_env("EXPORT_CHUNK_SIZE", 50_000)?,
            export_max_rows_csv: parse_env("EXPORT_MAX_ROWS_CSV", 1_000_000)?,
            export_ttl_hours: parse_env("EXPORT_TTL_HOURS", 24)?,
            score_weights_path: std::env::var("SCORE_WEIGHTS_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            scheduler_enabled: std::env::var("ENABLE_SCHEDULER")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(true),
            refresh_schedule_hour: parse_env("REFRESH_SCHEDULE_HOUR", 2)?,
        };

        if config.feed_page_size == 0 {
            anyhow::bail!("FEED_PAGE_SIZE must be positive");
        }
        if config.max_page_size == 0 {
            anyhow::bail!("MAX_PAGE_SIZE must be positive");
        }
        if config.db_min_connections > config.db_max_connections {
            anyhow::bail!("DB_MIN_CONNECTIONS cannot exceed DB_MAX_CONNECTIONS");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Feed base URL: {}", config.feed_base_url);
        tracing::debug!("Server port: {}", config.port);

        Ok(config)
    }
}

fn parse_env<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number (got '{}')", name, raw)),
        Err(_) => Ok(default),
    }
}
