use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::export::ExportService;
use crate::ingest::IngestionPipeline;
use crate::stats::StatsService;
use crate::store::CarrierStore;

/// How far ahead partition maintenance provisions monthly partitions.
const PARTITION_MONTHS_AHEAD: u32 = 3;

/// Point-in-time status of one scheduled job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub schedule: String,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
}

/// Everything the scheduled jobs need to run.
pub struct JobDeps {
    pub pipeline: Arc<IngestionPipeline>,
    pub stats: Arc<StatsService>,
    pub store: CarrierStore,
    pub exports: Arc<ExportService>,
    pub refresh_hour: u32,
}

/// Owns the background task set and a live status table for each job.
/// Every job is registered explicitly with its schedule; there is no
/// ambient scheduler state beyond this registry.
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<String, JobStatus>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub async fn statuses(&self) -> Vec<JobStatus> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Spawns all scheduled jobs. Idempotent only in the sense that the
    /// caller invokes it once at startup.
    pub async fn start(self: Arc<Self>, deps: JobDeps) {
        let JobDeps {
            pipeline,
            stats,
            store,
            exports,
            refresh_hour,
        } = deps;

        // Daily full refresh at the configured UTC hour, followed by a
        // stats snapshot rebuild so the rollup reflects the new data.
        {
            let registry = Arc::clone(&self);
            let stats = Arc::clone(&stats);
            registry
                .register("daily_refresh", format!("daily at {:02}:00 UTC", refresh_hour))
                .await;
            let handle = tokio::spawn({
                let registry = Arc::clone(&self);
                async move {
                    loop {
                        tokio::time::sleep(until_hour(refresh_hour)).await;
                        let pipeline = Arc::clone(&pipeline);
                        let stats = Arc::clone(&stats);
                        registry
                            .run_job("daily_refresh", || async move {
                                let run = pipeline.run_refresh().await?;
                                stats.refresh().await?;
                                Ok(format!(
                                    "{} seen, {} inserted, {} updated",
                                    run.records_seen, run.inserted, run.updated
                                ))
                            })
                            .await;
                    }
                }
            });
            self.handles.lock().await.push(handle);
        }

        // Hourly stats snapshot refresh.
        {
            let registry = Arc::clone(&self);
            registry.register("stats_refresh", "hourly".to_string()).await;
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(3600));
                interval.tick().await; // first tick is immediate
                loop {
                    interval.tick().await;
                    let stats = Arc::clone(&stats);
                    registry
                        .run_job("stats_refresh", || async move {
                            let snapshot = stats.refresh().await?;
                            Ok(format!("{} carriers", snapshot.total_carriers))
                        })
                        .await;
                }
            });
            self.handles.lock().await.push(handle);
        }

        // Daily partition maintenance, run once at startup as well so a
        // fresh deployment has partitions before its first refresh.
        {
            let registry = Arc::clone(&self);
            registry
                .register("partition_maintenance", "daily".to_string())
                .await;
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(86_400));
                loop {
                    interval.tick().await;
                    let store = store.clone();
                    registry
                        .run_job("partition_maintenance", || async move {
                            let ensured = store.ensure_partitions(PARTITION_MONTHS_AHEAD).await?;
                            Ok(format!("{} partitions ensured", ensured))
                        })
                        .await;
                }
            });
            self.handles.lock().await.push(handle);
        }

        // Hourly sweep of expired export artifacts.
        {
            let registry = Arc::clone(&self);
            registry.register("export_sweep", "hourly".to_string()).await;
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(3600));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let exports = Arc::clone(&exports);
                    registry
                        .run_job("export_sweep", || async move {
                            let removed = exports.cleanup_expired().await;
                            Ok(format!("{} artifacts removed", removed))
                        })
                        .await;
                }
            });
            self.handles.lock().await.push(handle);
        }

        tracing::info!("Background jobs started");
    }

    /// Aborts every background task. Used on shutdown.
    pub async fn shutdown(&self) {
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
        tracing::info!("Background jobs stopped");
    }

    async fn register(&self, name: &str, schedule: String) {
        self.jobs.write().await.insert(
            name.to_string(),
            JobStatus {
                name: name.to_string(),
                schedule,
                running: false,
                last_run: None,
                last_result: None,
            },
        );
    }

    /// Runs one job body, maintaining the status table around it.
    async fn run_job<F, Fut>(&self, name: &str, body: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, crate::errors::AppError>>,
    {
        if let Some(job) = self.jobs.write().await.get_mut(name) {
            job.running = true;
        }
        let started = Utc::now();
        let outcome = body().await;

        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(name) {
            job.running = false;
            job.last_run = Some(started);
            job.last_result = Some(match &outcome {
                Ok(summary) => format!("ok: {}", summary),
                Err(e) => format!("error: {}", e),
            });
        }
        match outcome {
            Ok(summary) => tracing::info!(job = name, %summary, "Job finished"),
            Err(e) => tracing::error!(job = name, error = %e, "Job failed"),
        }
    }
}

/// Duration until the next occurrence of `hour`:00 UTC.
fn until_hour(hour: u32) -> Duration {
    let now = Utc::now();
    let today_at = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .unwrap_or_else(|| now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default())
        .and_utc();
    let next = if today_at > now {
        today_at
    } else {
        today_at + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_hour_is_always_within_a_day() {
        for hour in 0..24 {
            let wait = until_hour(hour);
            assert!(wait <= Duration::from_secs(86_400));
        }
    }

    #[tokio::test]
    async fn run_job_records_outcomes() {
        let registry = JobRegistry::new();
        registry.register("demo", "manual".to_string()).await;

        registry
            .run_job("demo", || async { Ok("42 things".to_string()) })
            .await;
        let status = &registry.statuses().await[0];
        assert!(!status.running);
        assert_eq!(status.last_result.as_deref(), Some("ok: 42 things"));

        registry
            .run_job("demo", || async {
                Err(crate::errors::AppError::InternalError("boom".to_string()))
            })
            .await;
        let status = &registry.statuses().await[0];
        assert!(status.last_result.as_deref().unwrap().starts_with("error:"));
    }
}
