use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::AppError;
use crate::filters::FilterPlan;
use crate::models::{Carrier, ExportFormat, ExportResponse};
use crate::scoring::InsuranceStatus;
use crate::store::CarrierStore;

/// Hard row ceiling of the xlsx format, header included.
const XLSX_MAX_ROWS: u64 = 1_048_576;

/// Columns an export may request. Unknown names are rejected, never
/// silently dropped.
pub const EXPORTABLE_COLUMNS: &[&str] = &[
    "usdot_number",
    "legal_name",
    "dba_name",
    "physical_address",
    "physical_city",
    "physical_state",
    "physical_zip",
    "telephone",
    "email",
    "entity_type",
    "operating_status",
    "power_units",
    "drivers",
    "hazmat_flag",
    "safety_rating",
    "liability_insurance_date",
    "liability_insurance_amount",
    "cargo_insurance_date",
    "cargo_insurance_amount",
    "mcs_150_date",
    "insurance_status",
    "days_until_insurance_expiration",
    "created_at",
    "updated_at",
];

/// Default column set when a request names none.
const DEFAULT_COLUMNS: &[&str] = &[
    "usdot_number",
    "legal_name",
    "dba_name",
    "physical_city",
    "physical_state",
    "telephone",
    "email",
    "entity_type",
    "operating_status",
    "power_units",
    "drivers",
    "liability_insurance_date",
    "insurance_status",
];

/// Source of carrier pages for an export run. The production source pages
/// through the store with a compiled plan; tests substitute an in-memory
/// one.
#[allow(async_fn_in_trait)]
pub trait CarrierPages {
    async fn total(&self) -> Result<i64, AppError>;
    async fn fetch(&self, offset: i64, limit: i64) -> Result<Vec<Carrier>, AppError>;
}

/// Store-backed page source for a compiled filter plan.
pub struct StorePages<'a> {
    store: &'a CarrierStore,
    plan: &'a FilterPlan,
}

impl<'a> StorePages<'a> {
    pub fn new(store: &'a CarrierStore, plan: &'a FilterPlan) -> Self {
        Self { store, plan }
    }
}

impl CarrierPages for StorePages<'_> {
    async fn total(&self) -> Result<i64, AppError> {
        self.store.count(self.plan).await
    }

    async fn fetch(&self, offset: i64, limit: i64) -> Result<Vec<Carrier>, AppError> {
        self.store.query_rows(self.plan, limit, offset).await
    }
}

/// A finished export file awaiting download.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub file_id: Uuid,
    pub path: PathBuf,
    pub filename: String,
    pub format: ExportFormat,
    pub size_bytes: u64,
    pub row_count: u64,
    pub truncated: bool,
    pub expires_at: DateTime<Utc>,
}

/// Streams filtered carriers into CSV or XLSX files on local disk and
/// tracks them until expiry.
pub struct ExportService {
    dir: PathBuf,
    chunk_size: u32,
    max_rows_csv: u64,
    xlsx_row_cap: u64,
    ttl_hours: i64,
    artifacts: RwLock<HashMap<Uuid, ExportArtifact>>,
}

impl ExportService {
    pub fn new(
        dir: impl Into<PathBuf>,
        chunk_size: u32,
        max_rows_csv: u64,
        ttl_hours: i64,
    ) -> Result<Self, AppError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::InternalError(format!("cannot create export dir {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            chunk_size,
            max_rows_csv,
            xlsx_row_cap: XLSX_MAX_ROWS,
            ttl_hours,
            artifacts: RwLock::new(HashMap::new()),
        })
    }

    /// Overrides the spreadsheet row cap, header row included. The format
    /// limit is the default; tests lower it to exercise truncation.
    pub fn with_xlsx_row_cap(mut self, rows: u64) -> Self {
        self.xlsx_row_cap = rows;
        self
    }

    /// Validates a requested column list, or returns the defaults.
    pub fn resolve_columns(requested: &[String]) -> Result<Vec<String>, AppError> {
        if requested.is_empty() {
            return Ok(DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect());
        }
        for col in requested {
            if !EXPORTABLE_COLUMNS.contains(&col.as_str()) {
                return Err(AppError::BadRequest(format!(
                    "unknown export column '{}'",
                    col
                )));
            }
        }
        Ok(requested.to_vec())
    }

    /// Runs one export. CSV requests over the configured row ceiling are
    /// rejected before any file is written; XLSX exports truncate at the
    /// format's hard row limit and flag it in the response.
    pub async fn run<P: CarrierPages>(
        &self,
        source: &P,
        format: ExportFormat,
        columns: &[String],
        include_raw_data: bool,
        today: NaiveDate,
    ) -> Result<ExportResponse, AppError> {
        let columns = Self::resolve_columns(columns)?;
        let total = source.total().await?;

        let row_cap = match format {
            ExportFormat::Csv => {
                if total as u64 > self.max_rows_csv {
                    return Err(AppError::ExportCapacity(format!(
                        "{} rows exceed the CSV export limit of {}",
                        total, self.max_rows_csv
                    )));
                }
                u64::MAX
            }
            ExportFormat::Xlsx => self.xlsx_row_cap.saturating_sub(1), // header takes a row
        };

        let file_id = Uuid::new_v4();
        let filename = format!("carriers_export_{}.{}", file_id, format.extension());
        let path = self.dir.join(&filename);

        let result = match format {
            ExportFormat::Csv => {
                self.write_csv(source, &path, &columns, include_raw_data, row_cap, today)
                    .await
            }
            ExportFormat::Xlsx => {
                self.write_xlsx(source, &path, &columns, include_raw_data, row_cap, today)
                    .await
            }
        };
        let (row_count, truncated) = match result {
            Ok(r) => r,
            Err(e) => {
                // Half-written files are useless; drop them.
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };

        let size_bytes = std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| AppError::InternalError(format!("stat export file: {}", e)))?;
        let expires_at = Utc::now() + chrono::Duration::hours(self.ttl_hours);

        let artifact = ExportArtifact {
            file_id,
            path,
            filename: filename.clone(),
            format,
            size_bytes,
            row_count,
            truncated,
            expires_at,
        };
        self.artifacts.write().await.insert(file_id, artifact);

        tracing::info!(%file_id, row_count, truncated, "Export complete");

        Ok(ExportResponse {
            file_id,
            filename,
            format,
            size_bytes,
            row_count,
            truncated,
            download_url: format!("/api/export/download/{}", file_id),
            expires_at,
        })
    }

    async fn write_csv<P: CarrierPages>(
        &self,
        source: &P,
        path: &Path,
        columns: &[String],
        include_raw_data: bool,
        row_cap: u64,
        today: NaiveDate,
    ) -> Result<(u64, bool), AppError> {
        let file = File::create(path)
            .map_err(|e| AppError::InternalError(format!("create export file: {}", e)))?;
        let mut writer = csv::Writer::from_writer(file);

        let mut header: Vec<&str> = columns.iter().map(String::as_str).collect();
        if include_raw_data {
            header.push("raw_data");
        }
        writer
            .write_record(&header)
            .map_err(|e| AppError::InternalError(format!("write export header: {}", e)))?;

        let mut written = 0u64;
        let truncated = self
            .for_each_row(source, row_cap, |carrier| {
                let mut record: Vec<String> = columns
                    .iter()
                    .map(|col| render_cell(carrier, col, today))
                    .collect();
                if include_raw_data {
                    record.push(carrier.raw_data.to_string());
                }
                writer
                    .write_record(&record)
                    .map_err(|e| AppError::InternalError(format!("write export row: {}", e)))?;
                written += 1;
                Ok(())
            })
            .await?;

        writer
            .flush()
            .map_err(|e| AppError::InternalError(format!("flush export file: {}", e)))?;
        Ok((written, truncated))
    }

    async fn write_xlsx<P: CarrierPages>(
        &self,
        source: &P,
        path: &Path,
        columns: &[String],
        include_raw_data: bool,
        row_cap: u64,
        today: NaiveDate,
    ) -> Result<(u64, bool), AppError> {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        // Constant-memory mode spills each finished row to disk instead of
        // holding the whole sheet in RAM, so memory stays bounded by the
        // chunk size even at the format's row limit. Rows must be written
        // strictly in order, which the chunked pager already guarantees.
        let worksheet = workbook.add_worksheet_with_constant_memory();

        let xlsx_err = |e: rust_xlsxwriter::XlsxError| {
            AppError::InternalError(format!("write xlsx: {}", e))
        };

        let mut header: Vec<&str> = columns.iter().map(String::as_str).collect();
        if include_raw_data {
            header.push("raw_data");
        }
        for (col_idx, name) in header.iter().enumerate() {
            worksheet
                .write_string(0, col_idx as u16, *name)
                .map_err(xlsx_err)?;
        }

        let mut written = 0u64;
        let truncated = self
            .for_each_row(source, row_cap, |carrier| {
                let row = (written + 1) as u32;
                for (col_idx, col) in columns.iter().enumerate() {
                    worksheet
                        .write_string(row, col_idx as u16, render_cell(carrier, col, today))
                        .map_err(xlsx_err)?;
                }
                if include_raw_data {
                    worksheet
                        .write_string(row, columns.len() as u16, carrier.raw_data.to_string())
                        .map_err(xlsx_err)?;
                }
                written += 1;
                Ok(())
            })
            .await?;

        workbook.save(path).map_err(xlsx_err)?;
        Ok((written, truncated))
    }

    /// Pages through the source in chunks, invoking `f` per row until the
    /// source is exhausted or the cap is hit. Returns whether the cap
    /// truncated the run.
    async fn for_each_row<P: CarrierPages>(
        &self,
        source: &P,
        row_cap: u64,
        mut f: impl FnMut(&Carrier) -> Result<(), AppError>,
    ) -> Result<bool, AppError> {
        let chunk = self.chunk_size as i64;
        let mut offset = 0i64;
        let mut written = 0u64;
        loop {
            let page = source.fetch(offset, chunk).await?;
            let page_len = page.len() as i64;
            for carrier in &page {
                if written >= row_cap {
                    return Ok(true);
                }
                f(carrier)?;
                written += 1;
            }
            if page_len < chunk {
                return Ok(false);
            }
            offset += chunk;
        }
    }

    /// Looks up a live artifact for download.
    pub async fn artifact(&self, file_id: Uuid) -> Result<ExportArtifact, AppError> {
        let artifacts = self.artifacts.read().await;
        let artifact = artifacts
            .get(&file_id)
            .ok_or_else(|| AppError::NotFound(format!("export {} not found", file_id)))?;
        if artifact.expires_at <= Utc::now() {
            return Err(AppError::NotFound(format!("export {} has expired", file_id)));
        }
        Ok(artifact.clone())
    }

    /// Deletes expired artifacts and their files, then removes orphaned
    /// export files with no registry entry (a run whose request was
    /// dropped mid-write leaves one behind). Returns how many were
    /// removed.
    pub async fn cleanup_expired(&self) -> u64 {
        let now = Utc::now();
        let mut artifacts = self.artifacts.write().await;
        let expired: Vec<Uuid> = artifacts
            .iter()
            .filter(|(_, a)| a.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut removed = 0;
        for id in expired {
            if let Some(artifact) = artifacts.remove(&id) {
                if let Err(e) = std::fs::remove_file(&artifact.path) {
                    tracing::warn!(%id, error = %e, "Failed to delete expired export file");
                }
                removed += 1;
            }
        }
        removed += self.sweep_orphans(&artifacts);
        removed
    }

    /// Removes export-named files in the directory that no live artifact
    /// claims. A minimum age of one hour keeps in-flight writes safe even
    /// when the configured TTL is shorter.
    fn sweep_orphans(&self, artifacts: &HashMap<Uuid, ExportArtifact>) -> u64 {
        let max_age = std::time::Duration::from_secs(
            (self.ttl_hours.max(1) as u64) * 3600,
        );
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read export dir during sweep");
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("carriers_export_") {
                continue;
            }
            if artifacts.values().any(|a| a.path == path) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if !old_enough {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(file = name, error = %e, "Failed to delete orphaned export file");
            } else {
                tracing::info!(file = name, "Removed orphaned export file");
                removed += 1;
            }
        }
        removed
    }
}

/// Renders one cell. Every column here must appear in EXPORTABLE_COLUMNS.
fn render_cell(c: &Carrier, column: &str, today: NaiveDate) -> String {
    fn opt<T: ToString>(v: &Option<T>) -> String {
        v.as_ref().map(|x| x.to_string()).unwrap_or_default()
    }
    match column {
        "usdot_number" => c.usdot_number.to_string(),
        "legal_name" => c.legal_name.clone(),
        "dba_name" => opt(&c.dba_name),
        "physical_address" => opt(&c.physical_address),
        "physical_city" => opt(&c.physical_city),
        "physical_state" => opt(&c.physical_state),
        "physical_zip" => opt(&c.physical_zip),
        "telephone" => opt(&c.telephone),
        "email" => opt(&c.email),
        "entity_type" => opt(&c.entity_type),
        "operating_status" => opt(&c.operating_status),
        "power_units" => opt(&c.power_units),
        "drivers" => opt(&c.drivers),
        "hazmat_flag" => c.hazmat_flag.to_string(),
        "safety_rating" => opt(&c.safety_rating),
        "liability_insurance_date" => opt(&c.liability_insurance_date),
        "liability_insurance_amount" => opt(&c.liability_insurance_amount),
        "cargo_insurance_date" => opt(&c.cargo_insurance_date),
        "cargo_insurance_amount" => opt(&c.cargo_insurance_amount),
        "mcs_150_date" => opt(&c.mcs_150_date),
        "insurance_status" => InsuranceStatus::classify(c.liability_insurance_date, today)
            .as_str()
            .to_string(),
        "days_until_insurance_expiration" => c
            .liability_insurance_date
            .map(|d| (d - today).num_days().to_string())
            .unwrap_or_default(),
        "created_at" => c.created_at.to_rfc3339(),
        "updated_at" => c.updated_at.to_rfc3339(),
        _ => String::new(),
    }
}
