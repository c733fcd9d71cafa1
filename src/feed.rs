use failsafe::futures::CircuitBreaker;
use failsafe::{backoff, failure_policy, Config, StateMachine};
use reqwest::StatusCode;
use std::time::Duration;

use crate::errors::AppError;

type FeedBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Fallback refresh-size estimate when the feed cannot answer a count
/// query; roughly the long-run size of the registry.
pub const DEFAULT_ESTIMATED_TOTAL: u64 = 2_200_000;

/// Creates the circuit breaker guarding the upstream registry feed.
///
/// Five consecutive failures open the circuit; recovery probes back off
/// exponentially from 10s to 60s.
fn create_feed_circuit_breaker() -> FeedBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Client for the public carrier registry feed (SODA-style JSON endpoint).
///
/// Pages are pulled with `$limit`/`$offset` in a stable `$order`; the caller
/// knows the feed is exhausted when a page comes back shorter than the
/// requested limit.
pub struct RegistryFeedClient {
    client: reqwest::Client,
    base_url: String,
    app_token: Option<String>,
    page_size: u32,
    max_retries: u32,
    breaker: FeedBreaker,
}

impl RegistryFeedClient {
    pub fn new(
        base_url: String,
        app_token: Option<String>,
        page_size: u32,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create feed client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            app_token,
            page_size,
            max_retries,
            breaker: create_feed_circuit_breaker(),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Estimates the total record count via a SODA count query.
    ///
    /// Best effort: any failure falls back to [`DEFAULT_ESTIMATED_TOTAL`]
    /// so refresh progress percentages stay roughly right.
    pub async fn estimate_total(&self) -> u64 {
        let mut request = self
            .client
            .get(&self.base_url)
            .query(&[("$select", "count(dot_number) AS total")]);
        if let Some(token) = &self.app_token {
            request = request.header("X-App-Token", token);
        }

        let parsed = async {
            let response = request.send().await.ok()?;
            if !response.status().is_success() {
                return None;
            }
            let rows = response.json::<Vec<serde_json::Value>>().await.ok()?;
            let total = rows.first()?.get("total")?;
            total
                .as_str()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .or_else(|| total.as_u64())
        }
        .await;

        match parsed {
            Some(n) if n > 0 => n,
            _ => {
                tracing::warn!("Feed count query failed, using fallback size estimate");
                DEFAULT_ESTIMATED_TOTAL
            }
        }
    }

    /// Fetches one page of raw feed records at the given offset.
    ///
    /// Transient failures (network, 5xx) retry with exponential backoff up
    /// to the configured attempt budget; a 429 honors the `Retry-After`
    /// header instead. Exhausting the budget surfaces an error so the
    /// pipeline can count the page as skipped and move on.
    pub async fn fetch_page(&self, offset: u64) -> Result<Vec<serde_json::Value>, AppError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1u64 << (attempt - 1).min(5));
                tracing::warn!(
                    offset,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Retrying feed page fetch"
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_fetch_page(offset).await {
                Ok(records) => return Ok(records),
                Err(FetchAttemptError::RateLimited(retry_after)) => {
                    tracing::warn!(
                        offset,
                        retry_after_secs = retry_after.as_secs(),
                        "Feed rate limited, honoring Retry-After"
                    );
                    tokio::time::sleep(retry_after).await;
                    last_error =
                        Some(AppError::ExternalApiError("feed rate limited".to_string()));
                }
                Err(FetchAttemptError::Fatal(e)) => return Err(e),
                Err(FetchAttemptError::Transient(e)) => {
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::ExternalApiError("feed page fetch failed".to_string())
        }))
    }

    async fn try_fetch_page(&self, offset: u64) -> Result<Vec<serde_json::Value>, FetchAttemptError> {
        let mut request = self
            .client
            .get(&self.base_url)
            .query(&[
                ("$limit", self.page_size.to_string()),
                ("$offset", offset.to_string()),
                ("$order", "dot_number".to_string()),
            ]);
        if let Some(token) = &self.app_token {
            request = request.header("X-App-Token", token);
        }

        let response = self
            .breaker
            .call(request.send())
            .await
            .map_err(|e| match e {
                failsafe::Error::Inner(e) => FetchAttemptError::Transient(
                    AppError::ExternalApiError(format!("Feed request failed: {}", e)),
                ),
                failsafe::Error::Rejected => FetchAttemptError::Transient(
                    AppError::ExternalApiError("feed circuit breaker open".to_string()),
                ),
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5);
            return Err(FetchAttemptError::RateLimited(Duration::from_secs(
                retry_after,
            )));
        }
        if status.is_server_error() {
            return Err(FetchAttemptError::Transient(AppError::ExternalApiError(
                format!("Feed returned {}", status),
            )));
        }
        if !status.is_success() {
            // 4xx other than 429 will not improve on retry.
            return Err(FetchAttemptError::Fatal(AppError::ExternalApiError(
                format!("Feed returned {}", status),
            )));
        }

        response
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| {
                FetchAttemptError::Transient(AppError::ExternalApiError(format!(
                    "Failed to parse feed response: {}",
                    e
                )))
            })
    }
}

enum FetchAttemptError {
    /// Worth retrying within the attempt budget.
    Transient(AppError),
    /// 429 with a server-directed delay; does not consume backoff schedule.
    RateLimited(Duration),
    /// Will not improve on retry.
    Fatal(AppError),
}
