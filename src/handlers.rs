use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::AppError;
use crate::export::{ExportService, StorePages};
use crate::filters::{validate_pagination, FilterPlan};
use crate::ingest::IngestionPipeline;
use crate::insurance_cache::InsuranceCacheService;
use crate::jobs::JobRegistry;
use crate::models::{
    CachedInsurance, Carrier, CarrierSummary, EntityType, ExpiredLeadsQuery, ExpiringLeadsQuery,
    ExportRequest, ExportResponse, HighValueLeadsQuery, Lead, OperatingStatus, Pagination,
    SafetyRating, SearchFilters, SearchResponse,
};
use crate::scoring::{compare_leads, InsuranceStatus, LeadScorer};
use crate::stats::StatsService;
use crate::store::CarrierStore;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool, kept for health probes.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    pub store: CarrierStore,
    pub pipeline: Arc<IngestionPipeline>,
    pub stats: Arc<StatsService>,
    pub exports: Arc<ExportService>,
    pub insurance: InsuranceCacheService,
    pub jobs: Arc<JobRegistry>,
    pub scorer: Arc<LeadScorer>,
}

/// Health check endpoint.
///
/// Reports degraded (503) when the database probe fails, so load
/// balancers stop routing before the pool is fully gone. The carrier
/// count comes from the stats snapshot so the probe never runs an
/// aggregate over the partitioned table.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let carrier_count = state.stats.peek().await.map(|s| s.total_carriers);
    let last_refresh = state
        .pipeline
        .last_run()
        .await
        .map(|run| run.finished_at);
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "service": "fmcsa-carrier-api",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "connected" } else { "unreachable" },
            "carrier_count": carrier_count,
            "last_refresh": last_refresh,
        })),
    )
}

/// Flat query-string form of the search surface. Kept separate from
/// [`SearchFilters`] because query-string deserialization cannot handle
/// flattened nested structs. Unknown parameter names are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CarrierSearchParams {
    pub usdot_number: Option<i64>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub entity_type: Option<EntityType>,
    pub operating_status: Option<OperatingStatus>,
    pub safety_rating: Option<SafetyRating>,
    pub min_power_units: Option<i32>,
    pub max_power_units: Option<i32>,
    pub min_drivers: Option<i32>,
    pub max_drivers: Option<i32>,
    #[serde(default)]
    pub hazmat_only: bool,
    pub insurance_expiring_days: Option<i32>,
    /// Comma-separated in the query string.
    pub insurance_companies: Option<String>,
    pub text_search: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl CarrierSearchParams {
    fn into_parts(self) -> (SearchFilters, Pagination) {
        let insurance_companies = self.insurance_companies.and_then(|raw| {
            let items: Vec<String> = raw
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if items.is_empty() {
                None
            } else {
                Some(items)
            }
        });
        let filters = SearchFilters {
            usdot_number: self.usdot_number,
            state: self.state,
            city: self.city,
            entity_type: self.entity_type,
            operating_status: self.operating_status,
            safety_rating: self.safety_rating,
            min_power_units: self.min_power_units,
            max_power_units: self.max_power_units,
            min_drivers: self.min_drivers,
            max_drivers: self.max_drivers,
            hazmat_only: self.hazmat_only,
            insurance_expiring_days: self.insurance_expiring_days,
            insurance_companies,
            text_search: self.text_search,
        };
        let pagination = Pagination {
            page: self.page.unwrap_or(1),
            per_page: self.per_page.unwrap_or(100),
        };
        (filters, pagination)
    }
}

/// GET /api/carriers
///
/// Filtered, paginated carrier search. Insurance status is annotated on
/// each row relative to today, and the side-channel insurance company is
/// attached where a cache row exists.
pub async fn search_carriers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CarrierSearchParams>,
) -> Result<Json<SearchResponse<CarrierSummary>>, AppError> {
    let (filters, pagination) = params.into_parts();
    validate_pagination(&pagination, state.config.max_page_size)?;

    let today = Utc::now().date_naive();
    let plan = FilterPlan::compile(filters, today)?;
    let (rows, total, query_time_ms) = state
        .store
        .query(&plan, pagination.limit(), pagination.offset())
        .await?;

    let summaries = annotate(&state, &rows, today).await?;
    Ok(Json(SearchResponse::new(
        summaries,
        total,
        pagination,
        query_time_ms,
    )))
}

/// Detail view: the full stored record plus computed insurance standing
/// and the side-channel insurance row when present.
#[derive(Debug, Serialize)]
pub struct CarrierDetail {
    #[serde(flatten)]
    pub carrier: Carrier,
    pub insurance_status: InsuranceStatus,
    pub days_until_insurance_expiration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insurance: Option<CachedInsurance>,
}

/// GET /api/carriers/:usdot_number
pub async fn get_carrier(
    State(state): State<Arc<AppState>>,
    Path(usdot_number): Path<i64>,
) -> Result<Json<CarrierDetail>, AppError> {
    let carrier = state
        .store
        .get(usdot_number)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("carrier {} not found", usdot_number)))?;

    let today = Utc::now().date_naive();
    let insurance = state.insurance.get(usdot_number).await?;
    Ok(Json(CarrierDetail {
        insurance_status: InsuranceStatus::classify(carrier.liability_insurance_date, today),
        days_until_insurance_expiration: carrier
            .liability_insurance_date
            .map(|d| (d - today).num_days()),
        insurance,
        carrier,
    }))
}

#[derive(Debug, Serialize)]
pub struct LeadsResponse {
    pub leads: Vec<Lead>,
    pub total: usize,
    pub generated_at: chrono::DateTime<Utc>,
}

/// GET /api/leads/expiring
///
/// Active carriers whose liability insurance expires within the window,
/// scored and ranked for outreach.
pub async fn expiring_leads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExpiringLeadsQuery>,
) -> Result<Json<LeadsResponse>, AppError> {
    if query.days_ahead < 0 {
        return Err(AppError::BadRequest(
            "days_ahead must be non-negative; use /api/leads/expired for lapsed coverage"
                .to_string(),
        ));
    }
    let filters = SearchFilters {
        state: query.state,
        min_power_units: query.min_power_units,
        operating_status: Some(OperatingStatus::Active),
        insurance_expiring_days: Some(query.days_ahead),
        ..Default::default()
    };
    lead_response(&state, filters, query.limit).await
}

/// GET /api/leads/expired
///
/// Carriers whose liability insurance lapsed within the lookback window.
pub async fn expired_leads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExpiredLeadsQuery>,
) -> Result<Json<LeadsResponse>, AppError> {
    if query.max_days_expired <= 0 {
        return Err(AppError::BadRequest(
            "max_days_expired must be positive".to_string(),
        ));
    }
    let filters = SearchFilters {
        state: query.state,
        min_power_units: query.min_power_units,
        operating_status: Some(OperatingStatus::Active),
        insurance_expiring_days: Some(-query.max_days_expired),
        ..Default::default()
    };
    lead_response(&state, filters, query.limit).await
}

/// GET /api/leads/high-value
///
/// Large-fleet carriers with insurance coming due; the fleet-size floor
/// keeps small operators out of the account-manager queue.
pub async fn high_value_leads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HighValueLeadsQuery>,
) -> Result<Json<LeadsResponse>, AppError> {
    if query.days_ahead < 0 {
        return Err(AppError::BadRequest(
            "days_ahead must be non-negative".to_string(),
        ));
    }
    if query.min_power_units < 1 {
        return Err(AppError::BadRequest(
            "min_power_units must be at least 1".to_string(),
        ));
    }
    let filters = SearchFilters {
        state: query.state,
        min_power_units: Some(query.min_power_units),
        operating_status: Some(OperatingStatus::Active),
        insurance_expiring_days: Some(query.days_ahead),
        ..Default::default()
    };
    lead_response(&state, filters, query.limit).await
}

async fn lead_response(
    state: &Arc<AppState>,
    filters: SearchFilters,
    limit: u32,
) -> Result<Json<LeadsResponse>, AppError> {
    let limit = limit.clamp(1, state.config.max_page_size) as i64;
    let today = Utc::now().date_naive();
    let plan = FilterPlan::compile(filters, today)?;
    let rows = state.store.query_rows(&plan, limit, 0).await?;

    let mut leads: Vec<Lead> = rows
        .iter()
        .map(|c| state.scorer.build_lead(c, today))
        .collect();
    leads.sort_by(compare_leads);

    let usdots: Vec<i64> = leads.iter().map(|l| l.carrier.usdot_number).collect();
    let companies = state.insurance.companies_for(&usdots).await?;
    for lead in &mut leads {
        lead.carrier.insurance_company = companies.get(&lead.carrier.usdot_number).cloned();
    }

    Ok(Json(LeadsResponse {
        total: leads.len(),
        leads,
        generated_at: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub state: Option<String>,
}

/// GET /api/stats
///
/// Global statistics come from the cached snapshot; a state filter
/// computes fresh, bypassing the snapshot.
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    match params.state.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => {
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(AppError::BadRequest(
                    "state must be a 2-letter code".to_string(),
                ));
            }
            let stats = state.stats.for_state(code).await?;
            Ok(Json(serde_json::to_value(stats).map_err(|e| {
                AppError::InternalError(format!("serialize stats: {}", e))
            })?))
        }
        _ => {
            let stats = state.stats.current().await?;
            Ok(Json(serde_json::to_value(stats.as_ref()).map_err(|e| {
                AppError::InternalError(format!("serialize stats: {}", e))
            })?))
        }
    }
}

/// GET /api/stats/summary
///
/// Condensed top-line numbers from the cached snapshot.
pub async fn stats_summary(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.stats.current().await?;
    Ok(Json(json!({
        "total_carriers": stats.total_carriers,
        "active_carriers": stats.active_carriers,
        "inactive_carriers": stats.inactive_carriers,
        "hazmat_carriers": stats.hazmat_carriers,
        "insurance": &stats.insurance_stats,
        "computed_at": stats.computed_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TopStatesParams {
    #[serde(default = "default_top_states_limit")]
    pub limit: usize,
}

fn default_top_states_limit() -> usize {
    10
}

/// GET /api/stats/top-states
pub async fn top_states(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopStatesParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    if params.limit == 0 || params.limit > 60 {
        return Err(AppError::BadRequest(
            "limit must be between 1 and 60".to_string(),
        ));
    }
    let stats = state.stats.current().await?;
    let states: Vec<serde_json::Value> = stats
        .top_states(params.limit)
        .into_iter()
        .map(|(state, carriers)| json!({"state": state, "carriers": carriers}))
        .collect();
    Ok(Json(json!({
        "states": states,
        "computed_at": stats.computed_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ForecastParams {
    #[serde(default = "default_forecast_months")]
    pub months: i32,
}

fn default_forecast_months() -> i32 {
    12
}

/// GET /api/stats/insurance-forecast
///
/// Monthly counts of active carriers whose liability insurance expires
/// within the window; computed fresh on each call.
pub async fn insurance_forecast(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ForecastParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !(1..=24).contains(&params.months) {
        return Err(AppError::BadRequest(
            "months must be between 1 and 24".to_string(),
        ));
    }
    let forecast = state.stats.expiration_forecast(params.months).await?;
    Ok(Json(json!({
        "months": params.months,
        "forecast": forecast,
    })))
}

/// POST /api/stats/refresh
pub async fn refresh_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.stats.refresh().await?;
    Ok(Json(json!({
        "status": "refreshed",
        "total_carriers": stats.total_carriers,
        "computed_at": stats.computed_at,
    })))
}

/// POST /api/export
///
/// Runs the export synchronously and returns the download descriptor.
pub async fn create_export(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExportRequest>,
) -> Result<Json<ExportResponse>, AppError> {
    let today = Utc::now().date_naive();
    let plan = FilterPlan::compile(request.filters, today)?;
    let source = StorePages::new(&state.store, &plan);
    let response = state
        .exports
        .run(
            &source,
            request.format,
            &request.columns,
            request.include_raw_data,
            today,
        )
        .await?;
    Ok(Json(response))
}

/// GET /api/export/status/:file_id
///
/// Re-serves the download descriptor for a live export, so clients can
/// recover it after losing the creation response.
pub async fn export_status(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<ExportResponse>, AppError> {
    let artifact = state.exports.artifact(file_id).await?;
    Ok(Json(ExportResponse {
        file_id: artifact.file_id,
        filename: artifact.filename,
        format: artifact.format,
        size_bytes: artifact.size_bytes,
        row_count: artifact.row_count,
        truncated: artifact.truncated,
        download_url: format!("/api/export/download/{}", artifact.file_id),
        expires_at: artifact.expires_at,
    }))
}

/// GET /api/export/download/:file_id
pub async fn download_export(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let artifact = state.exports.artifact(file_id).await?;

    let request = Request::builder()
        .body(Body::empty())
        .map_err(|e| AppError::InternalError(format!("build file request: {}", e)))?;
    let response = ServeFile::new(&artifact.path)
        .oneshot(request)
        .await
        .map_err(|e| AppError::InternalError(format!("serve export file: {}", e)))?;

    let mut response = response.into_response();
    if response.status() != StatusCode::OK {
        // Registry said live but the file is gone; treat as expired.
        return Err(AppError::NotFound(format!("export {} not found", file_id)));
    }
    let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    if let Ok(value) = header::HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// POST /api/ingest/refresh
///
/// Kicks off a full refresh in the background; 409 when one is already
/// running.
pub async fn trigger_refresh(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    Arc::clone(&state.pipeline).spawn_refresh()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "started",
            "detail": "refresh running in background; poll /api/jobs for progress",
        })),
    ))
}

/// GET /api/jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let jobs = state.jobs.statuses().await;
    let last_refresh = state.pipeline.last_run().await;
    Ok(Json(json!({
        "jobs": jobs,
        "last_refresh": last_refresh,
    })))
}

/// Attaches computed insurance status and side-channel companies to a page
/// of rows.
async fn annotate(
    state: &Arc<AppState>,
    rows: &[Carrier],
    today: NaiveDate,
) -> Result<Vec<CarrierSummary>, AppError> {
    let usdots: Vec<i64> = rows.iter().map(|c| c.usdot_number).collect();
    let companies = state.insurance.companies_for(&usdots).await?;
    Ok(rows
        .iter()
        .map(|c| {
            let mut summary = c.summarize(today);
            summary.insurance_company = companies.get(&c.usdot_number).cloned();
            summary
        })
        .collect())
}
