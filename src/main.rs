use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fmcsa_carrier_api::config::Config;
use fmcsa_carrier_api::db::Database;
use fmcsa_carrier_api::export::ExportService;
use fmcsa_carrier_api::feed::RegistryFeedClient;
use fmcsa_carrier_api::handlers::{self, AppState};
use fmcsa_carrier_api::ingest::IngestionPipeline;
use fmcsa_carrier_api::insurance_cache::InsuranceCacheService;
use fmcsa_carrier_api::jobs::{JobDeps, JobRegistry};
use fmcsa_carrier_api::scoring::{LeadScorer, ScoreWeights};
use fmcsa_carrier_api::stats::StatsService;
use fmcsa_carrier_api::store::CarrierStore;

/// Main entry point for the carrier registry service.
///
/// Initializes logging, configuration, the database pool and migrations,
/// all services, and the background job registry, then starts the Axum
/// server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fmcsa_carrier_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db = Database::new(&config).await?;
    tracing::info!("Database connection pool established");

    let store = CarrierStore::new(db.pool.clone());
    store.ensure_partitions(3).await?;

    let feed = Arc::new(RegistryFeedClient::new(
        config.feed_base_url.clone(),
        config.feed_app_token.clone(),
        config.feed_page_size,
        config.feed_timeout_secs,
        config.feed_max_retries,
    )?);

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&feed),
        store.clone(),
        config.ingest_batch_size,
        config.inactive_grace_refreshes,
    ));

    let stats = Arc::new(StatsService::new(db.pool.clone()));
    let exports = Arc::new(ExportService::new(
        config.export_dir.clone(),
        config.export_chunk_size,
        config.export_max_rows_csv,
        config.export_ttl_hours,
    )?);
    let insurance = InsuranceCacheService::new(db.pool.clone());

    let weights = match &config.score_weights_path {
        Some(path) => {
            let weights = ScoreWeights::from_file(path)
                .map_err(|e| anyhow::anyhow!("score weights: {}", e))?;
            tracing::info!(path, "Loaded score weight overrides");
            weights
        }
        None => ScoreWeights::default(),
    };
    let scorer = Arc::new(LeadScorer::new(weights));

    let jobs = JobRegistry::new();
    if config.scheduler_enabled {
        Arc::clone(&jobs).start(JobDeps {
            pipeline: Arc::clone(&pipeline),
            stats: Arc::clone(&stats),
            store: store.clone(),
            exports: Arc::clone(&exports),
            refresh_hour: config.refresh_schedule_hour,
        })
        .await;
    } else {
        tracing::warn!("Scheduler disabled; refreshes must be triggered manually");
    }

    let app_state = Arc::new(AppState {
        db: db.pool.clone(),
        config: config.clone(),
        store,
        pipeline,
        stats,
        exports,
        insurance,
        jobs: Arc::clone(&jobs),
        scorer,
    });

    // Rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        .route("/api/carriers", get(handlers::search_carriers))
        .route("/api/carriers/:usdot_number", get(handlers::get_carrier))
        .route("/api/leads/expiring", get(handlers::expiring_leads))
        .route("/api/leads/expired", get(handlers::expired_leads))
        .route("/api/leads/high-value", get(handlers::high_value_leads))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/stats/summary", get(handlers::stats_summary))
        .route("/api/stats/top-states", get(handlers::top_states))
        .route(
            "/api/stats/insurance-forecast",
            get(handlers::insurance_forecast),
        )
        .route("/api/stats/refresh", post(handlers::refresh_stats))
        .route("/api/export", post(handlers::create_export))
        .route(
            "/api/export/status/:file_id",
            get(handlers::export_status),
        )
        .route(
            "/api/export/download/:file_id",
            get(handlers::download_export),
        )
        .route("/api/ingest/refresh", post(handlers::trigger_refresh))
        .route("/api/jobs", get(handlers::list_jobs))
        .layer(
            ServiceBuilder::new()
                // 2MB max payload; export requests are small JSON bodies
                .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting for load balancer probes
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    app_state.jobs.shutdown().await;

    Ok(())
}
