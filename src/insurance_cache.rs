use hex;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::{AppError, ResultExt};
use crate::models::CachedInsurance;

/// Wrapper for cached insurance rows with integrity validation.
///
/// The cache stores serialized JSON alongside a SHA-256 checksum; a
/// mismatch on read is treated as a miss and falls through to the table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatedCacheEntry {
    pub data: String,
    /// SHA-256 of `data`, hex encoded.
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Returns the payload only when the checksum still matches.
    pub fn deserialize_and_validate(serialized: &str) -> Option<String> {
        let entry: ValidatedCacheEntry = serde_json::from_str(serialized).ok()?;
        if entry.is_valid() {
            Some(entry.data)
        } else {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            None
        }
    }
}

/// Read-through cache over the insurance_cache table.
///
/// The table is populated by an external process; this service only ever
/// reads it, and a missing row must never fail the calling request.
#[derive(Clone)]
pub struct InsuranceCacheService {
    pool: PgPool,
    cache: Cache<i64, String>,
}

impl InsuranceCacheService {
    pub fn new(pool: PgPool) -> Self {
        // 1 hour TTL keeps reads fresh relative to the external refresher.
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(3600))
            .max_capacity(100_000)
            .build();
        Self { pool, cache }
    }

    /// Looks up the cached insurance row for one carrier.
    pub async fn get(&self, usdot_number: i64) -> Result<Option<CachedInsurance>, AppError> {
        if let Some(serialized) = self.cache.get(&usdot_number).await {
            if let Some(data) = ValidatedCacheEntry::deserialize_and_validate(&serialized) {
                if let Ok(row) = serde_json::from_str::<CachedInsurance>(&data) {
                    return Ok(Some(row));
                }
            }
            // Poisoned or stale-format entry: drop and refetch.
            self.cache.invalidate(&usdot_number).await;
        }

        let row = sqlx::query_as::<_, CachedInsurance>(
            "SELECT * FROM insurance_cache WHERE usdot_number = $1",
        )
        .bind(usdot_number)
        .fetch_optional(&self.pool)
        .await
        .context("fetch insurance cache row")?;

        if let Some(row) = &row {
            if let Ok(data) = serde_json::to_string(row) {
                self.cache
                    .insert(usdot_number, ValidatedCacheEntry::new(data).serialize())
                    .await;
            }
        }
        Ok(row)
    }

    /// Batch company lookup for annotating a page of search results.
    /// One round trip; carriers without a row are simply absent.
    pub async fn companies_for(
        &self,
        usdot_numbers: &[i64],
    ) -> Result<HashMap<i64, String>, AppError> {
        if usdot_numbers.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (i64, Option<String>)>(
            "SELECT usdot_number, insurance_company FROM insurance_cache \
             WHERE usdot_number = ANY($1)",
        )
        .bind(usdot_numbers)
        .fetch_all(&self.pool)
        .await
        .context("batch insurance company lookup")?;

        Ok(rows
            .into_iter()
            .filter_map(|(usdot, company)| company.map(|c| (usdot, c)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_entry_round_trips() {
        let data = r#"{"usdot_number": 905413}"#.to_string();
        let entry = ValidatedCacheEntry::new(data.clone());
        assert!(entry.is_valid());
        assert_eq!(
            ValidatedCacheEntry::deserialize_and_validate(&entry.serialize()),
            Some(data)
        );
    }

    #[test]
    fn tampered_entry_is_rejected() {
        let mut entry = ValidatedCacheEntry::new(r#"{"usdot_number": 1}"#.to_string());
        entry.data = r#"{"usdot_number": 2}"#.to_string();
        assert!(!entry.is_valid());
        assert_eq!(
            ValidatedCacheEntry::deserialize_and_validate(&entry.serialize()),
            None
        );
    }
}
