use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

use crate::scoring::InsuranceStatus;

/// Carrier entity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Carrier,
    Broker,
    FreightForwarder,
    Shipper,
    Unknown,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Carrier => "CARRIER",
            EntityType::Broker => "BROKER",
            EntityType::FreightForwarder => "FREIGHT_FORWARDER",
            EntityType::Shipper => "SHIPPER",
            EntityType::Unknown => "UNKNOWN",
        }
    }
}

/// Carrier operating status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingStatus {
    Active,
    Inactive,
    OutOfService,
    Unknown,
}

impl OperatingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingStatus::Active => "ACTIVE",
            OperatingStatus::Inactive => "INACTIVE",
            OperatingStatus::OutOfService => "OUT_OF_SERVICE",
            OperatingStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parses the stored text form; anything unrecognized is `Unknown`.
    pub fn from_db(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_uppercase()).as_deref() {
            Some("ACTIVE") => OperatingStatus::Active,
            Some("INACTIVE") => OperatingStatus::Inactive,
            Some("OUT_OF_SERVICE") | Some("OUT-OF-SERVICE") => OperatingStatus::OutOfService,
            _ => OperatingStatus::Unknown,
        }
    }
}

/// FMCSA safety rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyRating {
    Satisfactory,
    Conditional,
    Unsatisfactory,
    Unrated,
}

impl SafetyRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyRating::Satisfactory => "SATISFACTORY",
            SafetyRating::Conditional => "CONDITIONAL",
            SafetyRating::Unsatisfactory => "UNSATISFACTORY",
            SafetyRating::Unrated => "UNRATED",
        }
    }

    pub fn from_db(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_uppercase()).as_deref() {
            Some("SATISFACTORY") => SafetyRating::Satisfactory,
            Some("CONDITIONAL") => SafetyRating::Conditional,
            Some("UNSATISFACTORY") => SafetyRating::Unsatisfactory,
            _ => SafetyRating::Unrated,
        }
    }
}

/// A stored carrier record, one row per USDOT number.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Carrier {
    pub usdot_number: i64,
    pub legal_name: String,
    pub dba_name: Option<String>,

    pub physical_address: Option<String>,
    pub physical_city: Option<String>,
    pub physical_state: Option<String>,
    pub physical_zip: Option<String>,
    pub physical_country: Option<String>,
    pub mailing_address: Option<String>,
    pub mailing_city: Option<String>,
    pub mailing_state: Option<String>,
    pub mailing_zip: Option<String>,

    pub telephone: Option<String>,
    pub email: Option<String>,

    pub entity_type: Option<String>,
    pub operating_status: Option<String>,
    pub power_units: Option<i32>,
    pub drivers: Option<i32>,
    pub hazmat_flag: bool,
    pub safety_rating: Option<String>,

    pub liability_insurance_date: Option<NaiveDate>,
    pub liability_insurance_amount: Option<BigDecimal>,
    pub cargo_insurance_date: Option<NaiveDate>,
    pub cargo_insurance_amount: Option<BigDecimal>,
    pub mcs_150_date: Option<NaiveDate>,

    #[serde(skip)]
    pub missed_refreshes: i32,
    pub raw_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized carrier ready for upsert; produced by the ingestion
/// normalizer, never by end-user input.
#[derive(Debug, Clone)]
pub struct NewCarrier {
    pub usdot_number: i64,
    pub legal_name: String,
    pub dba_name: Option<String>,
    pub physical_address: Option<String>,
    pub physical_city: Option<String>,
    pub physical_state: Option<String>,
    pub physical_zip: Option<String>,
    pub physical_country: Option<String>,
    pub mailing_address: Option<String>,
    pub mailing_city: Option<String>,
    pub mailing_state: Option<String>,
    pub mailing_zip: Option<String>,
    pub telephone: Option<String>,
    pub email: Option<String>,
    pub entity_type: Option<String>,
    pub operating_status: Option<String>,
    pub power_units: Option<i32>,
    pub drivers: Option<i32>,
    pub hazmat_flag: bool,
    pub safety_rating: Option<String>,
    pub liability_insurance_date: Option<NaiveDate>,
    pub liability_insurance_amount: Option<BigDecimal>,
    pub cargo_insurance_date: Option<NaiveDate>,
    pub cargo_insurance_amount: Option<BigDecimal>,
    pub mcs_150_date: Option<NaiveDate>,
    pub raw_data: serde_json::Value,
}

/// List-view projection with insurance status computed at read time.
#[derive(Debug, Clone, Serialize)]
pub struct CarrierSummary {
    pub usdot_number: i64,
    pub legal_name: String,
    pub dba_name: Option<String>,
    pub physical_city: Option<String>,
    pub physical_state: Option<String>,
    pub telephone: Option<String>,
    pub email: Option<String>,
    pub entity_type: Option<String>,
    pub operating_status: Option<String>,
    pub power_units: Option<i32>,
    pub drivers: Option<i32>,
    pub hazmat_flag: bool,
    pub safety_rating: Option<String>,
    pub liability_insurance_date: Option<NaiveDate>,
    pub liability_insurance_amount: Option<BigDecimal>,
    pub insurance_status: InsuranceStatus,
    pub days_until_insurance_expiration: Option<i64>,
    /// From the read-only side channel when a cache entry exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insurance_company: Option<String>,
}

impl Carrier {
    /// Projects the row into a list view, computing insurance status
    /// relative to `today`. Status is never stored, so it can never go
    /// stale between refreshes.
    pub fn summarize(&self, today: NaiveDate) -> CarrierSummary {
        let days_until = self
            .liability_insurance_date
            .map(|d| (d - today).num_days());
        CarrierSummary {
            usdot_number: self.usdot_number,
            legal_name: self.legal_name.clone(),
            dba_name: self.dba_name.clone(),
            physical_city: self.physical_city.clone(),
            physical_state: self.physical_state.clone(),
            telephone: self.telephone.clone(),
            email: self.email.clone(),
            entity_type: self.entity_type.clone(),
            operating_status: self.operating_status.clone(),
            power_units: self.power_units,
            drivers: self.drivers,
            hazmat_flag: self.hazmat_flag,
            safety_rating: self.safety_rating.clone(),
            liability_insurance_date: self.liability_insurance_date,
            liability_insurance_amount: self.liability_insurance_amount.clone(),
            insurance_status: InsuranceStatus::classify(self.liability_insurance_date, today),
            days_until_insurance_expiration: days_until,
            insurance_company: None,
        }
    }
}

/// Client-supplied search filters; the only query surface over the store.
/// Every field maps 1:1 to a whitelisted predicate in the filter compiler.
/// Unknown field names are a client error, not something to ignore.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchFilters {
    pub usdot_number: Option<i64>,
    /// 2-letter state code, exact match.
    pub state: Option<String>,
    /// Exact match; a trailing `*` switches to prefix matching.
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
    /// Insurance date between today and today+N; negative N means already
    /// expired by up to |N| days.
    pub insurance_expiring_days: Option<i32>,
    /// Set membership against the side-channel insurance company field.
    #[serde(default, deserialize_with = "de_string_list")]
    pub insurance_companies: Option<Vec<String>>,
    /// Fuzzy match over legal and DBA names, ranked by similarity.
    pub text_search: Option<String>,
}

/// Accepts either a JSON array or a comma-separated string, so the same
/// filter struct works for query strings and export request bodies.
fn de_string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match Option::<ListOrCsv>::deserialize(deserializer)? {
        None => None,
        Some(ListOrCsv::List(v)) if v.is_empty() => None,
        Some(ListOrCsv::List(v)) => Some(v),
        Some(ListOrCsv::Csv(s)) => {
            let items: Vec<String> = s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if items.is_empty() {
                None
            } else {
                Some(items)
            }
        }
    })
}

/// 1-based pagination with a server-enforced page size cap.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    100
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 100,
        }
    }
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.per_page as i64
    }

    pub fn limit(&self) -> i64 {
        self.per_page as i64
    }
}

/// Paginated search response with query latency.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
    pub query_time_ms: u64,
}

impl<T> SearchResponse<T> {
    pub fn new(data: Vec<T>, total: i64, pagination: Pagination, query_time_ms: u64) -> Self {
        let total_pages = if total <= 0 {
            0
        } else {
            ((total as u64).div_ceil(pagination.per_page.max(1) as u64)) as u32
        };
        Self {
            data,
            total,
            page: pagination.page,
            per_page: pagination.per_page,
            total_pages,
            query_time_ms,
        }
    }
}

/// Export output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }
}

/// Export request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportRequest {
    pub format: ExportFormat,
    #[serde(default)]
    pub filters: SearchFilters,
    /// Explicit output columns; unknown names are rejected, never dropped.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub include_raw_data: bool,
}

/// Export response with download information.
#[derive(Debug, Clone, Serialize)]
pub struct ExportResponse {
    pub file_id: uuid::Uuid,
    pub filename: String,
    pub format: ExportFormat,
    pub size_bytes: u64,
    pub row_count: u64,
    /// Set when the spreadsheet row cap stopped the export early.
    pub truncated: bool,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Parameters for the expiring-insurance lead view.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpiringLeadsQuery {
    #[serde(default = "default_days_ahead")]
    pub days_ahead: i32,
    pub state: Option<String>,
    pub min_power_units: Option<i32>,
    #[serde(default = "default_lead_limit")]
    pub limit: u32,
}

/// Parameters for the already-expired lead view.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpiredLeadsQuery {
    #[serde(default = "default_max_days_expired")]
    pub max_days_expired: i32,
    pub state: Option<String>,
    pub min_power_units: Option<i32>,
    #[serde(default = "default_lead_limit")]
    pub limit: u32,
}

/// Parameters for the high-value lead view: large fleets with insurance
/// coming due.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HighValueLeadsQuery {
    #[serde(default = "default_high_value_fleet")]
    pub min_power_units: i32,
    #[serde(default = "default_days_ahead")]
    pub days_ahead: i32,
    pub state: Option<String>,
    #[serde(default = "default_lead_limit")]
    pub limit: u32,
}

fn default_high_value_fleet() -> i32 {
    20
}

fn default_days_ahead() -> i32 {
    90
}

fn default_max_days_expired() -> i32 {
    30
}

fn default_lead_limit() -> u32 {
    100
}

/// A scored outreach lead.
#[derive(Debug, Clone, Serialize)]
pub struct Lead {
    #[serde(flatten)]
    pub carrier: CarrierSummary,
    pub score: u8,
    pub score_reasons: Vec<String>,
    /// 1-5 contact priority, 1 highest.
    pub priority: u8,
    pub best_contact_method: &'static str,
}

/// Insurance bucket counts for active carriers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsuranceBuckets {
    pub expired: i64,
    pub expiring_30_days: i64,
    pub expiring_60_days: i64,
    pub expiring_90_days: i64,
    pub valid: i64,
    pub unknown: i64,
}

/// Precomputed rollup served by the statistics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CarrierStatistics {
    pub total_carriers: i64,
    pub active_carriers: i64,
    pub inactive_carriers: i64,
    pub by_state: BTreeMap<String, i64>,
    pub by_entity_type: BTreeMap<String, i64>,
    pub by_operating_status: BTreeMap<String, i64>,
    pub insurance_stats: InsuranceBuckets,
    pub hazmat_carriers: i64,
    pub avg_power_units: f64,
    pub avg_drivers: f64,
    pub computed_at: DateTime<Utc>,
}

/// One month of the insurance-expiration forecast.
#[derive(Debug, Clone, Serialize)]
pub struct ExpirationForecastEntry {
    /// Calendar month in `YYYY-MM` form.
    pub month: String,
    pub expiring: i64,
}

impl CarrierStatistics {
    /// The `limit` states with the most carriers, largest first; ties break
    /// alphabetically.
    pub fn top_states(&self, limit: usize) -> Vec<(String, i64)> {
        let mut states: Vec<(String, i64)> = self
            .by_state
            .iter()
            .map(|(s, n)| (s.clone(), *n))
            .collect();
        states.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        states.truncate(limit);
        states
    }
}

/// A side-channel insurance cache entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CachedInsurance {
    pub usdot_number: i64,
    pub insurance_company: Option<String>,
    pub policy_number: Option<String>,
    pub coverage_amount: Option<BigDecimal>,
    pub expiry_date: Option<NaiveDate>,
    pub source: Option<String>,
    pub cached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insurance_companies_accepts_csv_and_list() {
        let q: SearchFilters =
            serde_json::from_str(r#"{"insurance_companies": "Acme Mutual, Integral Risk"}"#)
                .unwrap();
        assert_eq!(
            q.insurance_companies.unwrap(),
            vec!["Acme Mutual".to_string(), "Integral Risk".to_string()]
        );

        let q: SearchFilters =
            serde_json::from_str(r#"{"insurance_companies": ["Acme Mutual"]}"#).unwrap();
        assert_eq!(q.insurance_companies.unwrap().len(), 1);

        let q: SearchFilters = serde_json::from_str(r#"{"insurance_companies": ""}"#).unwrap();
        assert!(q.insurance_companies.is_none());
    }

    #[test]
    fn unknown_filter_fields_are_rejected() {
        let err = serde_json::from_str::<SearchFilters>(r#"{"favorite_color": "red"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn pagination_offset_is_zero_based() {
        let p = Pagination {
            page: 3,
            per_page: 50,
        };
        assert_eq!(p.offset(), 100);
        assert_eq!(p.limit(), 50);
    }

    #[test]
    fn search_response_computes_total_pages() {
        let resp = SearchResponse::<i32>::new(vec![], 1001, Pagination::default(), 5);
        assert_eq!(resp.total_pages, 11);
        let resp = SearchResponse::<i32>::new(vec![], 0, Pagination::default(), 5);
        assert_eq!(resp.total_pages, 0);
    }

    #[test]
    fn top_states_orders_by_count_then_name() {
        let stats = CarrierStatistics {
            total_carriers: 60,
            active_carriers: 60,
            inactive_carriers: 0,
            by_state: [
                ("TX".to_string(), 30i64),
                ("CA".to_string(), 20),
                ("OK".to_string(), 20),
                ("VT".to_string(), 5),
            ]
            .into_iter()
            .collect(),
            by_entity_type: BTreeMap::new(),
            by_operating_status: BTreeMap::new(),
            insurance_stats: InsuranceBuckets::default(),
            hazmat_carriers: 0,
            avg_power_units: 0.0,
            avg_drivers: 0.0,
            computed_at: Utc::now(),
        };
        let top = stats.top_states(3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0], ("TX".to_string(), 30));
        assert_eq!(top[1], ("CA".to_string(), 20));
        assert_eq!(top[2], ("OK".to_string(), 20));
    }

    #[test]
    fn operating_status_parses_stored_forms() {
        assert_eq!(
            OperatingStatus::from_db(Some("ACTIVE")),
            OperatingStatus::Active
        );
        assert_eq!(
            OperatingStatus::from_db(Some("out_of_service")),
            OperatingStatus::OutOfService
        );
        assert_eq!(OperatingStatus::from_db(None), OperatingStatus::Unknown);
        assert_eq!(
            OperatingStatus::from_db(Some("garbage")),
            OperatingStatus::Unknown
        );
    }
}
