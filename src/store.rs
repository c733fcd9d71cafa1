use bigdecimal::BigDecimal;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Instant;

use crate::errors::{AppError, ResultExt};
use crate::filters::FilterPlan;
use crate::models::{Carrier, NewCarrier};

/// Result of a batched upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// Result of the post-refresh disappearing-record sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepCounts {
    pub missed: u64,
    pub deactivated: u64,
}

/// Persistence layer over the partitioned carriers table. All reads go
/// through a compiled [`FilterPlan`]; there is no free-form query path.
#[derive(Debug, Clone)]
pub struct CarrierStore {
    pool: PgPool,
}

impl CarrierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upserts a normalized batch in one transaction.
    ///
    /// The table is range-partitioned on created_at, so usdot_number alone
    /// cannot carry a unique constraint. Instead the batch runs as an
    /// UPDATE-from-UNNEST over existing rows followed by an insert of the
    /// remainder; each statement's row count gives the updated/inserted
    /// split for the run report.
    pub async fn upsert_batch(&self, batch: &[NewCarrier]) -> Result<UpsertCounts, AppError> {
        if batch.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let batch = dedupe_by_usdot(batch);
        let cols = BatchColumns::from_batch(&batch);
        let mut tx = self.pool.begin().await.context("begin upsert batch")?;

        let updated = sqlx::query(UPDATE_FROM_UNNEST_SQL)
            .bind(&cols.usdot_number)
            .bind(&cols.legal_name)
            .bind(&cols.dba_name)
            .bind(&cols.physical_address)
            .bind(&cols.physical_city)
            .bind(&cols.physical_state)
            .bind(&cols.physical_zip)
            .bind(&cols.physical_country)
            .bind(&cols.mailing_address)
            .bind(&cols.mailing_city)
            .bind(&cols.mailing_state)
            .bind(&cols.mailing_zip)
            .bind(&cols.telephone)
            .bind(&cols.email)
            .bind(&cols.entity_type)
            .bind(&cols.operating_status)
            .bind(&cols.power_units)
            .bind(&cols.drivers)
            .bind(&cols.hazmat_flag)
            .bind(&cols.safety_rating)
            .bind(&cols.liability_insurance_date)
            .bind(&cols.liability_insurance_amount)
            .bind(&cols.cargo_insurance_date)
            .bind(&cols.cargo_insurance_amount)
            .bind(&cols.mcs_150_date)
            .bind(&cols.raw_data)
            .execute(&mut *tx)
            .await
            .context("update phase of upsert batch")?
            .rows_affected();

        let inserted = sqlx::query(INSERT_MISSING_SQL)
            .bind(&cols.usdot_number)
            .bind(&cols.legal_name)
            .bind(&cols.dba_name)
            .bind(&cols.physical_address)
            .bind(&cols.physical_city)
            .bind(&cols.physical_state)
            .bind(&cols.physical_zip)
            .bind(&cols.physical_country)
            .bind(&cols.mailing_address)
            .bind(&cols.mailing_city)
            .bind(&cols.mailing_state)
            .bind(&cols.mailing_zip)
            .bind(&cols.telephone)
            .bind(&cols.email)
            .bind(&cols.entity_type)
            .bind(&cols.operating_status)
            .bind(&cols.power_units)
            .bind(&cols.drivers)
            .bind(&cols.hazmat_flag)
            .bind(&cols.safety_rating)
            .bind(&cols.liability_insurance_date)
            .bind(&cols.liability_insurance_amount)
            .bind(&cols.cargo_insurance_date)
            .bind(&cols.cargo_insurance_amount)
            .bind(&cols.mcs_150_date)
            .bind(&cols.raw_data)
            .execute(&mut *tx)
            .await
            .context("insert phase of upsert batch")?
            .rows_affected();

        tx.commit().await.context("commit upsert batch")?;

        Ok(UpsertCounts { inserted, updated })
    }

    /// Fetches a single carrier by USDOT number.
    pub async fn get(&self, usdot_number: i64) -> Result<Option<Carrier>, AppError> {
        let carrier = sqlx::query_as::<_, Carrier>(
            "SELECT * FROM carriers WHERE usdot_number = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(usdot_number)
        .fetch_optional(&self.pool)
        .await
        .context("fetch carrier by usdot")?;
        Ok(carrier)
    }

    /// Runs a compiled plan with pagination, returning rows, the total
    /// match count, and elapsed milliseconds.
    pub async fn query(
        &self,
        plan: &FilterPlan,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Carrier>, i64, u64), AppError> {
        let started = Instant::now();
        let total = self.count(plan).await?;
        let rows = self.query_rows(plan, limit, offset).await?;
        Ok((rows, total, started.elapsed().as_millis() as u64))
    }

    /// Counts rows matching a plan.
    pub async fn count(&self, plan: &FilterPlan) -> Result<i64, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT count(*) FROM carriers");
        plan.push_where(&mut qb);
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .context("count carriers")?;
        Ok(row.get::<i64, _>(0))
    }

    /// Fetches one page of rows for a plan without counting; the export
    /// path pages through results with this.
    pub async fn query_rows(
        &self,
        plan: &FilterPlan,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Carrier>, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM carriers");
        plan.push_where(&mut qb);
        plan.push_order_by(&mut qb);
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);
        let rows = qb
            .build_query_as::<Carrier>()
            .fetch_all(&self.pool)
            .await
            .context("query carriers")?;
        Ok(rows)
    }

    /// Creates monthly partitions covering now through `months_ahead`.
    /// Safe to run repeatedly and concurrently.
    pub async fn ensure_partitions(&self, months_ahead: u32) -> Result<u32, AppError> {
        let today = Utc::now().date_naive();
        let mut created = 0;
        for offset in 0..=months_ahead {
            let start = add_months(first_of_month(today), offset);
            let end = add_months(start, 1);
            let name = format!("carriers_y{}m{:02}", start.year(), start.month());
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF carriers \
                 FOR VALUES FROM ('{start}') TO ('{end}')"
            );
            match sqlx::query(&ddl).execute(&self.pool).await {
                Ok(_) => created += 1,
                // Lost a concurrent-creation race; the partition exists.
                Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P07") => {}
                Err(e) => {
                    return Err(AppError::from(e))
                        .with_context(|| format!("create partition {}", name));
                }
            }
        }
        Ok(created)
    }

    /// Post-refresh sweep: any record a completed full refresh did not
    /// touch accrues a missed count; past the grace threshold an active
    /// record flips to INACTIVE. Records are never deleted.
    pub async fn sweep_missing(
        &self,
        run_started_at: DateTime<Utc>,
        grace_refreshes: i32,
    ) -> Result<SweepCounts, AppError> {
        let mut tx = self.pool.begin().await.context("begin missing sweep")?;

        let missed = sqlx::query(
            "UPDATE carriers SET missed_refreshes = missed_refreshes + 1 \
             WHERE updated_at < $1",
        )
        .bind(run_started_at)
        .execute(&mut *tx)
        .await
        .context("increment missed refreshes")?
        .rows_affected();

        let deactivated = sqlx::query(
            "UPDATE carriers SET operating_status = 'INACTIVE' \
             WHERE missed_refreshes >= $1 AND operating_status = 'ACTIVE'",
        )
        .bind(grace_refreshes)
        .execute(&mut *tx)
        .await
        .context("deactivate missing carriers")?
        .rows_affected();

        tx.commit().await.context("commit missing sweep")?;

        Ok(SweepCounts {
            missed,
            deactivated,
        })
    }
}

/// Keeps the last occurrence of each USDOT number, preserving feed order
/// otherwise. A feed page can repeat a number; both copies would pass the
/// insert statement's NOT EXISTS check (evaluated against the snapshot at
/// statement start) and collide on the primary key.
fn dedupe_by_usdot(batch: &[NewCarrier]) -> Vec<&NewCarrier> {
    let mut last = std::collections::HashMap::with_capacity(batch.len());
    for (i, c) in batch.iter().enumerate() {
        last.insert(c.usdot_number, i);
    }
    batch
        .iter()
        .enumerate()
        .filter(|(i, c)| last[&c.usdot_number] == *i)
        .map(|(_, c)| c)
        .collect()
}

fn first_of_month(d: NaiveDate) -> NaiveDate {
    // Day 1 always exists.
    d.with_day(1).unwrap_or(d)
}

fn add_months(d: NaiveDate, months: u32) -> NaiveDate {
    let total = d.year() * 12 + d.month0() as i32 + months as i32;
    let (year, month0) = (total.div_euclid(12), total.rem_euclid(12));
    NaiveDate::from_ymd_opt(year, month0 as u32 + 1, 1).unwrap_or(d)
}

/// Column-major projection of a batch, one Postgres array per column.
struct BatchColumns {
    usdot_number: Vec<i64>,
    legal_name: Vec<String>,
    dba_name: Vec<Option<String>>,
    physical_address: Vec<Option<String>>,
    physical_city: Vec<Option<String>>,
    physical_state: Vec<Option<String>>,
    physical_zip: Vec<Option<String>>,
    physical_country: Vec<Option<String>>,
    mailing_address: Vec<Option<String>>,
    mailing_city: Vec<Option<String>>,
    mailing_state: Vec<Option<String>>,
    mailing_zip: Vec<Option<String>>,
    telephone: Vec<Option<String>>,
    email: Vec<Option<String>>,
    entity_type: Vec<Option<String>>,
    operating_status: Vec<Option<String>>,
    power_units: Vec<Option<i32>>,
    drivers: Vec<Option<i32>>,
    hazmat_flag: Vec<bool>,
    safety_rating: Vec<Option<String>>,
    liability_insurance_date: Vec<Option<NaiveDate>>,
    liability_insurance_amount: Vec<Option<BigDecimal>>,
    cargo_insurance_date: Vec<Option<NaiveDate>>,
    cargo_insurance_amount: Vec<Option<BigDecimal>>,
    mcs_150_date: Vec<Option<NaiveDate>>,
    raw_data: Vec<serde_json::Value>,
}

impl BatchColumns {
    fn from_batch(batch: &[&NewCarrier]) -> Self {
        let mut cols = Self {
            usdot_number: Vec::with_capacity(batch.len()),
            legal_name: Vec::with_capacity(batch.len()),
            dba_name: Vec::with_capacity(batch.len()),
            physical_address: Vec::with_capacity(batch.len()),
            physical_city: Vec::with_capacity(batch.len()),
            physical_state: Vec::with_capacity(batch.len()),
            physical_zip: Vec::with_capacity(batch.len()),
            physical_country: Vec::with_capacity(batch.len()),
            mailing_address: Vec::with_capacity(batch.len()),
            mailing_city: Vec::with_capacity(batch.len()),
            mailing_state: Vec::with_capacity(batch.len()),
            mailing_zip: Vec::with_capacity(batch.len()),
            telephone: Vec::with_capacity(batch.len()),
            email: Vec::with_capacity(batch.len()),
            entity_type: Vec::with_capacity(batch.len()),
            operating_status: Vec::with_capacity(batch.len()),
            power_units: Vec::with_capacity(batch.len()),
            drivers: Vec::with_capacity(batch.len()),
            hazmat_flag: Vec::with_capacity(batch.len()),
            safety_rating: Vec::with_capacity(batch.len()),
            liability_insurance_date: Vec::with_capacity(batch.len()),
            liability_insurance_amount: Vec::with_capacity(batch.len()),
            cargo_insurance_date: Vec::with_capacity(batch.len()),
            cargo_insurance_amount: Vec::with_capacity(batch.len()),
            mcs_150_date: Vec::with_capacity(batch.len()),
            raw_data: Vec::with_capacity(batch.len()),
        };
        for c in batch {
            cols.usdot_number.push(c.usdot_number);
            cols.legal_name.push(c.legal_name.clone());
            cols.dba_name.push(c.dba_name.clone());
            cols.physical_address.push(c.physical_address.clone());
            cols.physical_city.push(c.physical_city.clone());
            cols.physical_state.push(c.physical_state.clone());
            cols.physical_zip.push(c.physical_zip.clone());
            cols.physical_country.push(c.physical_country.clone());
            cols.mailing_address.push(c.mailing_address.clone());
            cols.mailing_city.push(c.mailing_city.clone());
            cols.mailing_state.push(c.mailing_state.clone());
            cols.mailing_zip.push(c.mailing_zip.clone());
            cols.telephone.push(c.telephone.clone());
            cols.email.push(c.email.clone());
            cols.entity_type.push(c.entity_type.clone());
            cols.operating_status.push(c.operating_status.clone());
            cols.power_units.push(c.power_units);
            cols.drivers.push(c.drivers);
            cols.hazmat_flag.push(c.hazmat_flag);
            cols.safety_rating.push(c.safety_rating.clone());
            cols.liability_insurance_date.push(c.liability_insurance_date);
            cols.liability_insurance_amount
                .push(c.liability_insurance_amount.clone());
            cols.cargo_insurance_date.push(c.cargo_insurance_date);
            cols.cargo_insurance_amount
                .push(c.cargo_insurance_amount.clone());
            cols.mcs_150_date.push(c.mcs_150_date);
            cols.raw_data.push(c.raw_data.clone());
        }
        cols
    }
}

// The two upsert statements read the batch through the same UNNEST source;
// the $n array order must match BatchColumns::from_batch exactly.
const UPDATE_FROM_UNNEST_SQL: &str = "\
    UPDATE carriers c SET \
    legal_name = v.legal_name, dba_name = v.dba_name, \
    physical_address = v.physical_address, physical_city = v.physical_city, \
    physical_state = v.physical_state, physical_zip = v.physical_zip, \
    physical_country = v.physical_country, mailing_address = v.mailing_address, \
    mailing_city = v.mailing_city, mailing_state = v.mailing_state, \
    mailing_zip = v.mailing_zip, telephone = v.telephone, email = v.email, \
    entity_type = v.entity_type, operating_status = v.operating_status, \
    power_units = v.power_units, drivers = v.drivers, \
    hazmat_flag = v.hazmat_flag, safety_rating = v.safety_rating, \
    liability_insurance_date = v.liability_insurance_date, \
    liability_insurance_amount = v.liability_insurance_amount, \
    cargo_insurance_date = v.cargo_insurance_date, \
    cargo_insurance_amount = v.cargo_insurance_amount, \
    mcs_150_date = v.mcs_150_date, raw_data = v.raw_data, \
    missed_refreshes = 0, updated_at = now() \
    FROM UNNEST(\
    $1::bigint[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[], \
    $7::text[], $8::text[], $9::text[], $10::text[], $11::text[], $12::text[], \
    $13::text[], $14::text[], $15::text[], $16::text[], $17::int[], $18::int[], \
    $19::bool[], $20::text[], $21::date[], $22::numeric[], $23::date[], \
    $24::numeric[], $25::date[], $26::jsonb[]\
    ) AS v(\
    usdot_number, legal_name, dba_name, physical_address, physical_city, \
    physical_state, physical_zip, physical_country, mailing_address, \
    mailing_city, mailing_state, mailing_zip, telephone, email, entity_type, \
    operating_status, power_units, drivers, hazmat_flag, safety_rating, \
    liability_insurance_date, liability_insurance_amount, cargo_insurance_date, \
    cargo_insurance_amount, mcs_150_date, raw_data) \
    WHERE c.usdot_number = v.usdot_number";

const INSERT_MISSING_SQL: &str = "\
    INSERT INTO carriers (\
    usdot_number, legal_name, dba_name, physical_address, physical_city, \
    physical_state, physical_zip, physical_country, mailing_address, \
    mailing_city, mailing_state, mailing_zip, telephone, email, entity_type, \
    operating_status, power_units, drivers, hazmat_flag, safety_rating, \
    liability_insurance_date, liability_insurance_amount, cargo_insurance_date, \
    cargo_insurance_amount, mcs_150_date, raw_data) \
    SELECT v.* FROM UNNEST(\
    $1::bigint[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[], \
    $7::text[], $8::text[], $9::text[], $10::text[], $11::text[], $12::text[], \
    $13::text[], $14::text[], $15::text[], $16::text[], $17::int[], $18::int[], \
    $19::bool[], $20::text[], $21::date[], $22::numeric[], $23::date[], \
    $24::numeric[], $25::date[], $26::jsonb[]\
    ) AS v(\
    usdot_number, legal_name, dba_name, physical_address, physical_city, \
    physical_state, physical_zip, physical_country, mailing_address, \
    mailing_city, mailing_state, mailing_zip, telephone, email, entity_type, \
    operating_status, power_units, drivers, hazmat_flag, safety_rating, \
    liability_insurance_date, liability_insurance_amount, cargo_insurance_date, \
    cargo_insurance_amount, mcs_150_date, raw_data) \
    WHERE NOT EXISTS \
    (SELECT 1 FROM carriers c WHERE c.usdot_number = v.usdot_number)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_arithmetic_rolls_over_years() {
        let d = NaiveDate::from_ymd_opt(2024, 11, 15).unwrap();
        assert_eq!(
            add_months(first_of_month(d), 3),
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()
        );
        assert_eq!(
            add_months(first_of_month(d), 0),
            NaiveDate::from_ymd_opt(2024, 11, 1).unwrap()
        );
    }

    fn new_carrier(usdot: i64, name: &str) -> NewCarrier {
        NewCarrier {
            usdot_number: usdot,
            legal_name: name.to_string(),
            dba_name: None,
            physical_address: None,
            physical_city: None,
            physical_state: None,
            physical_zip: None,
            physical_country: None,
            mailing_address: None,
            mailing_city: None,
            mailing_state: None,
            mailing_zip: None,
            telephone: None,
            email: None,
            entity_type: None,
            operating_status: None,
            power_units: None,
            drivers: None,
            hazmat_flag: false,
            safety_rating: None,
            liability_insurance_date: None,
            liability_insurance_amount: None,
            cargo_insurance_date: None,
            cargo_insurance_amount: None,
            mcs_150_date: None,
            raw_data: serde_json::json!({}),
        }
    }

    #[test]
    fn duplicate_usdot_numbers_collapse_to_the_last_row() {
        let batch = vec![
            new_carrier(100, "FIRST COPY"),
            new_carrier(200, "OTHER"),
            new_carrier(100, "SECOND COPY"),
        ];
        let deduped = dedupe_by_usdot(&batch);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].usdot_number, 200);
        assert_eq!(deduped[1].usdot_number, 100);
        assert_eq!(deduped[1].legal_name, "SECOND COPY");
    }

    #[test]
    fn upsert_statements_agree_on_column_order() {
        // Both statements must bind the same 26 arrays in the same order.
        for sql in [UPDATE_FROM_UNNEST_SQL, INSERT_MISSING_SQL] {
            assert!(sql.contains("$26::jsonb[]"));
            assert!(!sql.contains("$27"));
        }
        assert!(UPDATE_FROM_UNNEST_SQL.contains("missed_refreshes = 0"));
        assert!(INSERT_MISSING_SQL.contains("WHERE NOT EXISTS"));
    }
}
