use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};

use crate::errors::AppError;
use crate::feed::RegistryFeedClient;
use crate::models::NewCarrier;
use crate::store::{CarrierStore, SweepCounts, UpsertCounts};

/// Consecutive unrecoverable pages before a refresh run aborts outright.
const MAX_CONSECUTIVE_SKIPPED_PAGES: u32 = 3;

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Loose shape check; real validation happens at send time elsewhere.
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap()
    })
}

fn digits_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9]").unwrap())
}

/// Pulls a field from a raw feed record by any of its known aliases,
/// case-insensitively. Feed exports have renamed columns more than once.
fn field<'a>(record: &'a serde_json::Value, aliases: &[&str]) -> Option<&'a serde_json::Value> {
    let map = record.as_object()?;
    for (key, value) in map {
        let lower = key.to_lowercase();
        if aliases.iter().any(|a| *a == lower) {
            if !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

fn text(record: &serde_json::Value, aliases: &[&str]) -> Option<String> {
    let value = field(record, aliases)?;
    let s = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses dates in the formats the feed has been observed to emit.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    // ISO timestamps come through with a time suffix.
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%d-%b-%y", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(date_part, format) {
            return Some(d);
        }
    }
    None
}

fn clean_state(raw: Option<String>) -> Option<String> {
    let s = raw?.trim().to_uppercase();
    if s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(s)
    } else {
        None
    }
}

fn clean_zip(raw: Option<String>) -> Option<String> {
    let digits = digits_regex().replace_all(&raw?, "").to_string();
    match digits.len() {
        5 => Some(digits),
        9 => Some(format!("{}-{}", &digits[..5], &digits[5..])),
        n if n > 5 => Some(digits[..5].to_string()),
        _ => None,
    }
}

fn clean_phone(raw: Option<String>) -> Option<String> {
    let digits = digits_regex().replace_all(&raw?, "").to_string();
    let digits = match digits.len() {
        11 if digits.starts_with('1') => digits[1..].to_string(),
        10 => digits,
        _ => return None,
    };
    Some(format!(
        "({}) {}-{}",
        &digits[..3],
        &digits[3..6],
        &digits[6..]
    ))
}

fn clean_email(raw: Option<String>) -> Option<String> {
    let s = raw?.trim().to_lowercase();
    if email_regex().is_match(&s) {
        Some(s)
    } else {
        None
    }
}

fn parse_amount(raw: Option<String>) -> Option<BigDecimal> {
    let cleaned: String = raw?
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    BigDecimal::from_str(&cleaned).ok()
}

fn parse_count(raw: Option<String>) -> Option<i32> {
    // Counts sometimes arrive as "12.0".
    let n = raw?.trim().parse::<f64>().ok()?;
    if n.is_finite() && n >= 0.0 && n <= i32::MAX as f64 {
        Some(n as i32)
    } else {
        None
    }
}

fn parse_flag(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::trim).map(str::to_uppercase).as_deref(),
        Some("Y") | Some("YES") | Some("TRUE") | Some("1")
    )
}

fn normalize_entity_type(raw: Option<String>) -> Option<String> {
    let s = raw?.trim().to_uppercase().replace([' ', '-'], "_");
    let mapped = match s.as_str() {
        "C" | "CARRIER" | "MOTOR_CARRIER" => "CARRIER",
        "B" | "BROKER" => "BROKER",
        "FF" | "FREIGHT_FORWARDER" => "FREIGHT_FORWARDER",
        "S" | "SHIPPER" => "SHIPPER",
        _ => "UNKNOWN",
    };
    Some(mapped.to_string())
}

fn normalize_operating_status(raw: Option<String>) -> Option<String> {
    let s = raw?.trim().to_uppercase().replace([' ', '-'], "_");
    let mapped = match s.as_str() {
        "A" | "ACTIVE" | "AUTHORIZED" | "AUTHORIZED_FOR_PROPERTY" => "ACTIVE",
        "I" | "INACTIVE" | "NOT_AUTHORIZED" => "INACTIVE",
        "O" | "OUT_OF_SERVICE" => "OUT_OF_SERVICE",
        _ => "UNKNOWN",
    };
    Some(mapped.to_string())
}

fn normalize_safety_rating(raw: Option<String>) -> Option<String> {
    let s = raw?.trim().to_uppercase();
    match s.as_str() {
        "S" | "SATISFACTORY" => Some("SATISFACTORY".to_string()),
        "C" | "CONDITIONAL" => Some("CONDITIONAL".to_string()),
        "U" | "UNSATISFACTORY" => Some("UNSATISFACTORY".to_string()),
        _ => None,
    }
}

/// Normalizes one raw feed record into a storable carrier.
///
/// Only a missing or invalid USDOT number rejects the record; any other
/// unparseable field degrades to NULL so a bad date never drops a carrier.
/// The raw record is preserved verbatim for reprocessing.
pub fn normalize_record(raw: &serde_json::Value) -> Result<NewCarrier, AppError> {
    let usdot_number = field(raw, &["dot_number", "usdot_number", "usdot"])
        .and_then(|v| match v {
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        })
        .filter(|n| *n > 0)
        .ok_or_else(|| AppError::BadRequest("record has no valid USDOT number".to_string()))?;

    let legal_name = text(raw, &["legal_name", "carrier_name", "name"])
        .map(|s| s.to_uppercase())
        .unwrap_or_else(|| format!("UNKNOWN CARRIER #{}", usdot_number));

    let liability_insurance_date = text(
        raw,
        &["liability_insurance_date", "bipd_insurance_on_file_date", "insurance_date"],
    )
    .and_then(|s| {
        let parsed = parse_date(&s);
        if parsed.is_none() {
            tracing::debug!(usdot_number, value = %s, "Unparseable liability insurance date");
        }
        parsed
    });

    Ok(NewCarrier {
        usdot_number,
        legal_name,
        dba_name: text(raw, &["dba_name"]).map(|s| s.to_uppercase()),
        physical_address: text(raw, &["phy_street", "physical_address", "phy_address"]),
        physical_city: text(raw, &["phy_city", "physical_city"]).map(|s| s.to_uppercase()),
        physical_state: clean_state(text(raw, &["phy_state", "physical_state"])),
        physical_zip: clean_zip(text(raw, &["phy_zip", "physical_zip"])),
        physical_country: text(raw, &["phy_country", "physical_country"])
            .map(|s| s.to_uppercase())
            .or_else(|| Some("US".to_string())),
        mailing_address: text(raw, &["mailing_street", "mailing_address"]),
        mailing_city: text(raw, &["mailing_city"]).map(|s| s.to_uppercase()),
        mailing_state: clean_state(text(raw, &["mailing_state"])),
        mailing_zip: clean_zip(text(raw, &["mailing_zip"])),
        telephone: clean_phone(text(raw, &["telephone", "phone"])),
        email: clean_email(text(raw, &["email_address", "email"])),
        entity_type: normalize_entity_type(text(raw, &["entity_type", "carrier_operation"])),
        operating_status: normalize_operating_status(text(
            raw,
            &["operating_status", "status_code", "authority_status"],
        )),
        power_units: parse_count(text(raw, &["power_units", "nbr_power_unit"])),
        drivers: parse_count(text(raw, &["drivers", "total_drivers", "driver_total"])),
        hazmat_flag: parse_flag(text(raw, &["hm_flag", "hazmat_flag"])),
        safety_rating: normalize_safety_rating(text(raw, &["safety_rating", "rating"])),
        liability_insurance_date,
        liability_insurance_amount: parse_amount(text(
            raw,
            &["liability_insurance_amount", "bipd_insurance_required_amount"],
        )),
        cargo_insurance_date: text(raw, &["cargo_insurance_date", "cargo_insurance_on_file_date"])
            .and_then(|s| parse_date(&s)),
        cargo_insurance_amount: parse_amount(text(raw, &["cargo_insurance_amount"])),
        mcs_150_date: text(raw, &["mcs_150_date", "mcs150_date"]).and_then(|s| parse_date(&s)),
        raw_data: raw.clone(),
    })
}

/// Outcome report for one full refresh run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub pages_skipped: u32,
    /// Feed-reported total at run start, for progress tracking. Falls back
    /// to a long-run constant when the feed cannot answer a count query.
    pub estimated_total: u64,
    pub records_seen: u64,
    pub records_skipped: u64,
    pub inserted: u64,
    pub updated: u64,
    pub missed: u64,
    pub deactivated: u64,
    /// False when skipped pages forced the missing-record sweep to be
    /// withheld for this run.
    pub sweep_ran: bool,
}

/// Orchestrates the full feed refresh: paged fetch, normalization, batched
/// upsert, then the disappearing-record sweep.
pub struct IngestionPipeline {
    feed: Arc<RegistryFeedClient>,
    store: CarrierStore,
    batch_size: usize,
    grace_refreshes: i32,
    run_lock: Arc<Mutex<()>>,
    last_run: RwLock<Option<IngestionStats>>,
}

impl IngestionPipeline {
    pub fn new(
        feed: Arc<RegistryFeedClient>,
        store: CarrierStore,
        batch_size: usize,
        grace_refreshes: i32,
    ) -> Self {
        Self {
            feed,
            store,
            batch_size,
            grace_refreshes,
            run_lock: Arc::new(Mutex::new(())),
            last_run: RwLock::new(None),
        }
    }

    pub async fn last_run(&self) -> Option<IngestionStats> {
        self.last_run.read().await.clone()
    }

    /// Runs one full refresh. Only one run may be in flight; a second
    /// caller gets a `Conflict` immediately rather than queueing.
    pub async fn run_refresh(&self) -> Result<IngestionStats, AppError> {
        let guard = Arc::clone(&self.run_lock)
            .try_lock_owned()
            .map_err(|_| AppError::Conflict("a refresh run is already in progress".to_string()))?;
        self.run_refresh_locked(guard).await
    }

    /// Kicks off a refresh in the background, failing fast with `Conflict`
    /// when one is already in flight. Used by the manual trigger endpoint.
    pub fn spawn_refresh(self: Arc<Self>) -> Result<(), AppError> {
        let guard = Arc::clone(&self.run_lock)
            .try_lock_owned()
            .map_err(|_| AppError::Conflict("a refresh run is already in progress".to_string()))?;
        let pipeline = self;
        tokio::spawn(async move {
            if let Err(e) = pipeline.run_refresh_locked(guard).await {
                tracing::error!(error = %e, "Background refresh run failed");
            }
        });
        Ok(())
    }

    async fn run_refresh_locked(
        &self,
        _guard: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<IngestionStats, AppError> {
        let started_at = Utc::now();
        let page_size = self.feed.page_size() as u64;
        let estimated_total = self.feed.estimate_total().await;
        tracing::info!(page_size, estimated_total, "Starting full registry refresh");

        let mut pages_fetched = 0u32;
        let mut pages_skipped = 0u32;
        let mut consecutive_skips = 0u32;
        let mut records_seen = 0u64;
        let mut records_skipped = 0u64;
        let mut totals = UpsertCounts::default();
        let mut offset = 0u64;
        let mut next_progress_mark = 100_000u64;

        loop {
            let page = match self.feed.fetch_page(offset).await {
                Ok(page) => {
                    consecutive_skips = 0;
                    page
                }
                Err(e) => {
                    pages_skipped += 1;
                    consecutive_skips += 1;
                    tracing::warn!(offset, error = %e, "Skipping unrecoverable feed page");
                    if consecutive_skips >= MAX_CONSECUTIVE_SKIPPED_PAGES {
                        return Err(AppError::ExternalApiError(format!(
                            "aborting refresh after {} consecutive failed pages",
                            consecutive_skips
                        )));
                    }
                    offset += page_size;
                    continue;
                }
            };

            pages_fetched += 1;
            let page_len = page.len() as u64;
            records_seen += page_len;

            let mut batch = Vec::with_capacity(self.batch_size);
            for raw in &page {
                match normalize_record(raw) {
                    Ok(carrier) => batch.push(carrier),
                    Err(e) => {
                        records_skipped += 1;
                        tracing::debug!(error = %e, "Skipping malformed feed record");
                    }
                }
                if batch.len() >= self.batch_size {
                    let counts = self.store.upsert_batch(&batch).await?;
                    totals.inserted += counts.inserted;
                    totals.updated += counts.updated;
                    batch.clear();
                }
            }
            if !batch.is_empty() {
                let counts = self.store.upsert_batch(&batch).await?;
                totals.inserted += counts.inserted;
                totals.updated += counts.updated;
            }

            if records_seen >= next_progress_mark {
                tracing::info!(
                    records_seen,
                    estimated_total,
                    percent = records_seen * 100 / estimated_total.max(1),
                    inserted = totals.inserted,
                    updated = totals.updated,
                    "Refresh progress"
                );
                next_progress_mark += 100_000;
            }

            // A short page means the feed is exhausted.
            if page_len < page_size {
                break;
            }
            offset += page_size;
        }

        // Sweeping after a partial run would penalize records that only
        // "disappeared" because their page failed to download.
        let sweep_ran = pages_skipped == 0;
        let sweep = if sweep_ran {
            self.store
                .sweep_missing(started_at, self.grace_refreshes)
                .await?
        } else {
            tracing::warn!(pages_skipped, "Withholding missing-record sweep after partial run");
            SweepCounts::default()
        };

        let stats = IngestionStats {
            started_at,
            finished_at: Utc::now(),
            pages_fetched,
            pages_skipped,
            estimated_total,
            records_seen,
            records_skipped,
            inserted: totals.inserted,
            updated: totals.updated,
            missed: sweep.missed,
            deactivated: sweep.deactivated,
            sweep_ran,
        };

        tracing::info!(
            records_seen = stats.records_seen,
            inserted = stats.inserted,
            updated = stats.updated,
            deactivated = stats.deactivated,
            duration_secs = (stats.finished_at - stats.started_at).num_seconds(),
            "Refresh complete"
        );

        *self.last_run.write().await = Some(stats.clone());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_a_typical_feed_record() {
        let raw = json!({
            "dot_number": "905413",
            "legal_name": "Acme Trucking llc",
            "dba_name": "Acme Express",
            "phy_street": "100 Main St",
            "phy_city": "Houston",
            "phy_state": "tx",
            "phy_zip": "770019999",
            "telephone": "1-713-555-0142",
            "email_address": "Dispatch@Acme.example.COM",
            "carrier_operation": "C",
            "status_code": "A",
            "power_units": "12.0",
            "total_drivers": "15",
            "hm_flag": "Y",
            "safety_rating": "S",
            "liability_insurance_date": "02/20/2024",
            "liability_insurance_amount": "$1,000,000"
        });

        let c = normalize_record(&raw).unwrap();
        assert_eq!(c.usdot_number, 905413);
        assert_eq!(c.legal_name, "ACME TRUCKING LLC");
        assert_eq!(c.dba_name.as_deref(), Some("ACME EXPRESS"));
        assert_eq!(c.physical_state.as_deref(), Some("TX"));
        assert_eq!(c.physical_zip.as_deref(), Some("77001-9999"));
        assert_eq!(c.telephone.as_deref(), Some("(713) 555-0142"));
        assert_eq!(c.email.as_deref(), Some("dispatch@acme.example.com"));
        assert_eq!(c.entity_type.as_deref(), Some("CARRIER"));
        assert_eq!(c.operating_status.as_deref(), Some("ACTIVE"));
        assert_eq!(c.power_units, Some(12));
        assert_eq!(c.drivers, Some(15));
        assert!(c.hazmat_flag);
        assert_eq!(c.safety_rating.as_deref(), Some("SATISFACTORY"));
        assert_eq!(
            c.liability_insurance_date,
            NaiveDate::from_ymd_opt(2024, 2, 20)
        );
        assert_eq!(
            c.liability_insurance_amount,
            BigDecimal::from_str("1000000").ok()
        );
        assert_eq!(c.raw_data, raw);
    }

    #[test]
    fn missing_usdot_rejects_the_record() {
        assert!(normalize_record(&json!({"legal_name": "NO NUMBER"})).is_err());
        assert!(normalize_record(&json!({"dot_number": "0"})).is_err());
        assert!(normalize_record(&json!({"dot_number": "abc"})).is_err());
    }

    #[test]
    fn bad_fields_degrade_to_null_not_rejection() {
        let raw = json!({
            "dot_number": 42,
            "phy_state": "Texas",
            "phy_zip": "123",
            "telephone": "555",
            "email_address": "not-an-email",
            "liability_insurance_date": "eventually",
            "power_units": "-3"
        });
        let c = normalize_record(&raw).unwrap();
        assert_eq!(c.legal_name, "UNKNOWN CARRIER #42");
        assert!(c.physical_state.is_none());
        assert!(c.physical_zip.is_none());
        assert!(c.telephone.is_none());
        assert!(c.email.is_none());
        assert!(c.liability_insurance_date.is_none());
        assert!(c.power_units.is_none());
    }

    #[test]
    fn field_lookup_is_case_insensitive_across_aliases() {
        let raw = json!({"DOT_Number": "77", "Legal_Name": "X Y"});
        let c = normalize_record(&raw).unwrap();
        assert_eq!(c.usdot_number, 77);
        assert_eq!(c.legal_name, "X Y");
    }

    #[test]
    fn date_formats_from_the_wild() {
        for (input, expected) in [
            ("2024-02-20", Some((2024, 2, 20))),
            ("02/20/2024", Some((2024, 2, 20))),
            ("2024-02-20T00:00:00.000", Some((2024, 2, 20))),
            ("20240220", Some((2024, 2, 20))),
            ("garbage", None),
        ] {
            let expected = expected.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d));
            assert_eq!(parse_date(input), expected, "input {:?}", input);
        }
    }
}
