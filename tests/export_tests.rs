/// Export engine tests against an in-memory page source.
/// No database required; the fake source stands in for the store.
use chrono::{NaiveDate, Utc};
use fmcsa_carrier_api::errors::AppError;
use fmcsa_carrier_api::export::{CarrierPages, ExportService};
use fmcsa_carrier_api::models::{Carrier, ExportFormat};

struct FakePages {
    rows: Vec<Carrier>,
}

impl CarrierPages for FakePages {
    async fn total(&self) -> Result<i64, AppError> {
        Ok(self.rows.len() as i64)
    }

    async fn fetch(&self, offset: i64, limit: i64) -> Result<Vec<Carrier>, AppError> {
        let start = (offset as usize).min(self.rows.len());
        let end = (start + limit as usize).min(self.rows.len());
        Ok(self.rows[start..end].to_vec())
    }
}

fn carrier(usdot: i64) -> Carrier {
    Carrier {
        usdot_number: usdot,
        legal_name: format!("CARRIER {}", usdot),
        dba_name: None,
        physical_address: None,
        physical_city: Some("AUSTIN".to_string()),
        physical_state: Some("TX".to_string()),
        physical_zip: None,
        physical_country: Some("US".to_string()),
        mailing_address: None,
        mailing_city: None,
        mailing_state: None,
        mailing_zip: None,
        telephone: None,
        email: None,
        entity_type: Some("CARRIER".to_string()),
        operating_status: Some("ACTIVE".to_string()),
        power_units: Some(usdot as i32 % 40),
        drivers: None,
        hazmat_flag: false,
        safety_rating: None,
        liability_insurance_date: NaiveDate::from_ymd_opt(2024, 3, 1),
        liability_insurance_amount: None,
        cargo_insurance_date: None,
        cargo_insurance_amount: None,
        mcs_150_date: None,
        missed_refreshes: 0,
        raw_data: serde_json::json!({"dot_number": usdot.to_string()}),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn source(n: i64) -> FakePages {
    FakePages {
        rows: (1..=n).map(carrier).collect(),
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()
}

#[tokio::test]
async fn csv_export_writes_every_filtered_row() {
    let dir = tempfile::tempdir().unwrap();
    // Chunk size of 10 forces several fetch round trips.
    let service = ExportService::new(dir.path(), 10, 1_000, 24).unwrap();

    let response = service
        .run(&source(25), ExportFormat::Csv, &[], false, today())
        .await
        .unwrap();

    assert_eq!(response.row_count, 25);
    assert!(!response.truncated);
    assert!(response.size_bytes > 0);

    let artifact = service.artifact(response.file_id).await.unwrap();
    let mut reader = csv::Reader::from_path(&artifact.path).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "usdot_number");
    assert!(headers.iter().any(|h| h == "insurance_status"));

    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 25);
    assert_eq!(&records[0][0], "1");
    // 2024-03-01 is 20 days past 2024-02-10.
    let status_col = headers.iter().position(|h| h == "insurance_status").unwrap();
    assert_eq!(&records[0][status_col], "expiring_soon");
}

#[tokio::test]
async fn csv_over_the_row_ceiling_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let service = ExportService::new(dir.path(), 10, 20, 24).unwrap();

    let err = service
        .run(&source(21), ExportFormat::Csv, &[], false, today())
        .await
        .expect_err("over the ceiling");
    assert!(matches!(err, AppError::ExportCapacity(_)));

    // Nothing should have been written.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn unknown_columns_are_rejected_not_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let service = ExportService::new(dir.path(), 10, 1_000, 24).unwrap();

    let columns = vec!["usdot_number".to_string(), "favorite_color".to_string()];
    let err = service
        .run(&source(3), ExportFormat::Csv, &columns, false, today())
        .await
        .expect_err("unknown column");
    match err {
        AppError::BadRequest(msg) => assert!(msg.contains("favorite_color")),
        other => panic!("expected BadRequest, got {}", other),
    }
}

#[tokio::test]
async fn raw_data_column_is_appended_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let service = ExportService::new(dir.path(), 10, 1_000, 24).unwrap();

    let columns = vec!["usdot_number".to_string()];
    let response = service
        .run(&source(2), ExportFormat::Csv, &columns, true, today())
        .await
        .unwrap();

    let artifact = service.artifact(response.file_id).await.unwrap();
    let mut reader = csv::Reader::from_path(&artifact.path).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.len(), 2);
    assert_eq!(&headers[1], "raw_data");

    let first = reader.records().next().unwrap().unwrap();
    assert!(first[1].contains("dot_number"));
}

#[tokio::test]
async fn xlsx_export_produces_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let service = ExportService::new(dir.path(), 10, 1_000, 24).unwrap();

    let response = service
        .run(&source(12), ExportFormat::Xlsx, &[], false, today())
        .await
        .unwrap();

    assert_eq!(response.row_count, 12);
    assert!(!response.truncated);
    assert!(response.filename.ends_with(".xlsx"));
    let artifact = service.artifact(response.file_id).await.unwrap();
    assert!(artifact.path.exists());
}

#[tokio::test]
async fn xlsx_truncates_at_the_sheet_row_cap() {
    let dir = tempfile::tempdir().unwrap();
    // Sheet cap of 11 rows leaves 10 data rows after the header.
    let service = ExportService::new(dir.path(), 4, 1_000, 24)
        .unwrap()
        .with_xlsx_row_cap(11);

    let response = service
        .run(&source(30), ExportFormat::Xlsx, &[], false, today())
        .await
        .unwrap();

    assert!(response.truncated);
    assert_eq!(response.row_count, 10);
    let artifact = service.artifact(response.file_id).await.unwrap();
    assert!(artifact.path.exists());
}

#[tokio::test]
async fn expired_artifacts_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    // Zero TTL: artifacts are born expired.
    let service = ExportService::new(dir.path(), 10, 1_000, 0).unwrap();

    let response = service
        .run(&source(3), ExportFormat::Csv, &[], false, today())
        .await
        .unwrap();

    let err = service.artifact(response.file_id).await.expect_err("expired");
    assert!(matches!(err, AppError::NotFound(_)));

    let removed = service.cleanup_expired().await;
    assert_eq!(removed, 1);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
