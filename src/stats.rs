use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::errors::{AppError, ResultExt};
use crate::models::{CarrierStatistics, ExpirationForecastEntry, InsuranceBuckets};

/// Serves aggregate statistics from an in-memory snapshot.
///
/// The snapshot swaps atomically under a read lock, so readers never see a
/// half-built rollup. Refreshes are single-flight: concurrent triggers
/// coalesce onto one computation via the refresh lock plus a generation
/// counter.
pub struct StatsService {
    pool: PgPool,
    snapshot: RwLock<Option<Arc<CarrierStatistics>>>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl StatsService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            snapshot: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the snapshot if one exists, never triggering a computation.
    /// The health endpoint reads through this so probes stay cheap.
    pub async fn peek(&self) -> Option<Arc<CarrierStatistics>> {
        self.snapshot.read().await.clone()
    }

    /// Returns the current snapshot, computing the first one on demand.
    pub async fn current(&self) -> Result<Arc<CarrierStatistics>, AppError> {
        if let Some(snapshot) = self.snapshot.read().await.clone() {
            return Ok(snapshot);
        }
        self.refresh().await
    }

    /// Recomputes the global snapshot. A caller that blocks behind an
    /// in-flight refresh gets that refresh's result instead of running a
    /// second computation.
    pub async fn refresh(&self) -> Result<Arc<CarrierStatistics>, AppError> {
        let generation_before = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != generation_before {
            if let Some(snapshot) = self.snapshot.read().await.clone() {
                return Ok(snapshot);
            }
        }

        let stats = Arc::new(self.compute(None).await?);
        *self.snapshot.write().await = Some(stats.clone());
        self.generation.fetch_add(1, Ordering::Release);
        tracing::info!(
            total_carriers = stats.total_carriers,
            "Statistics snapshot refreshed"
        );
        Ok(stats)
    }

    /// Computes statistics restricted to one state, bypassing the snapshot.
    pub async fn for_state(&self, state: &str) -> Result<CarrierStatistics, AppError> {
        self.compute(Some(state)).await
    }

    async fn compute(&self, state: Option<&str>) -> Result<CarrierStatistics, AppError> {
        let totals = {
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT count(*) AS total, \
                 count(*) FILTER (WHERE operating_status = 'ACTIVE') AS active, \
                 count(*) FILTER (WHERE operating_status = 'INACTIVE') AS inactive, \
                 count(*) FILTER (WHERE hazmat_flag) AS hazmat, \
                 coalesce(avg(power_units), 0)::float8 AS avg_power_units, \
                 coalesce(avg(drivers), 0)::float8 AS avg_drivers \
                 FROM carriers",
            );
            push_state_filter(&mut qb, state);
            qb.build()
                .fetch_one(&self.pool)
                .await
                .context("compute carrier totals")?
        };

        let by_state = self
            .grouped_counts("physical_state", state)
            .await
            .context("compute state rollup")?;
        let by_entity_type = self
            .grouped_counts("entity_type", state)
            .await
            .context("compute entity type rollup")?;
        let by_operating_status = self
            .grouped_counts("operating_status", state)
            .await
            .context("compute operating status rollup")?;

        let insurance_stats = {
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT \
                 count(*) FILTER (WHERE liability_insurance_date IS NULL) AS unknown, \
                 count(*) FILTER (WHERE liability_insurance_date < CURRENT_DATE) AS expired, \
                 count(*) FILTER (WHERE liability_insurance_date \
                   BETWEEN CURRENT_DATE AND CURRENT_DATE + 30) AS expiring_30, \
                 count(*) FILTER (WHERE liability_insurance_date \
                   BETWEEN CURRENT_DATE + 31 AND CURRENT_DATE + 60) AS expiring_60, \
                 count(*) FILTER (WHERE liability_insurance_date \
                   BETWEEN CURRENT_DATE + 61 AND CURRENT_DATE + 90) AS expiring_90, \
                 count(*) FILTER (WHERE liability_insurance_date > CURRENT_DATE + 90) AS valid \
                 FROM carriers WHERE operating_status = 'ACTIVE'",
            );
            if let Some(state) = state {
                qb.push(" AND physical_state = ")
                    .push_bind(state.to_uppercase());
            }
            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .context("compute insurance buckets")?;
            InsuranceBuckets {
                unknown: row.get("unknown"),
                expired: row.get("expired"),
                expiring_30_days: row.get("expiring_30"),
                expiring_60_days: row.get("expiring_60"),
                expiring_90_days: row.get("expiring_90"),
                valid: row.get("valid"),
            }
        };

        Ok(CarrierStatistics {
            total_carriers: totals.get("total"),
            active_carriers: totals.get("active"),
            inactive_carriers: totals.get("inactive"),
            by_state,
            by_entity_type,
            by_operating_status,
            insurance_stats,
            hazmat_carriers: totals.get("hazmat"),
            avg_power_units: totals.get("avg_power_units"),
            avg_drivers: totals.get("avg_drivers"),
            computed_at: Utc::now(),
        })
    }

    /// Month-by-month count of active carriers whose liability insurance
    /// expires within the coming `months`. Always computed fresh; the
    /// forecast shifts daily so it never lives in the snapshot.
    pub async fn expiration_forecast(
        &self,
        months: i32,
    ) -> Result<Vec<ExpirationForecastEntry>, AppError> {
        let rows = sqlx::query(
            "SELECT to_char(date_trunc('month', liability_insurance_date), 'YYYY-MM') AS month, \
             count(*) AS expiring FROM carriers \
             WHERE operating_status = 'ACTIVE' \
             AND liability_insurance_date >= CURRENT_DATE \
             AND liability_insurance_date < date_trunc('month', CURRENT_DATE) \
               + make_interval(months => $1) \
             GROUP BY 1 ORDER BY 1",
        )
        .bind(months)
        .fetch_all(&self.pool)
        .await
        .context("compute expiration forecast")?;

        Ok(rows
            .into_iter()
            .map(|row| ExpirationForecastEntry {
                month: row.get("month"),
                expiring: row.get("expiring"),
            })
            .collect())
    }

    /// GROUP BY rollup over one of the fixed dimension columns. The column
    /// name comes from a compile-time literal at every call site, never
    /// from input.
    async fn grouped_counts(
        &self,
        column: &'static str,
        state: Option<&str>,
    ) -> Result<BTreeMap<String, i64>, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {column} AS dim, count(*) AS n FROM carriers WHERE {column} IS NOT NULL"
        ));
        if let Some(state) = state {
            qb.push(" AND physical_state = ")
                .push_bind(state.to_uppercase());
        }
        qb.push(format!(" GROUP BY {column}"));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("dim"), row.get::<i64, _>("n")))
            .collect())
    }
}

fn push_state_filter(qb: &mut QueryBuilder<'_, Postgres>, state: Option<&str>) {
    if let Some(state) = state {
        qb.push(" WHERE physical_state = ")
            .push_bind(state.to_uppercase());
    }
}
