use chrono::{Duration, NaiveDate};
use sqlx::{Postgres, QueryBuilder};

use crate::errors::AppError;
use crate::models::{Pagination, SearchFilters};

/// How a result set is ordered. Similarity ordering is only available when
/// a text search term is present.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOrder {
    /// Stable insertion order (created_at, then usdot_number).
    Insertion,
    /// Soonest liability insurance expiration first, NULLs last.
    InsuranceDate,
    /// Trigram similarity against the text search term, best match first.
    Similarity(String),
}

/// A validated filter set ready to be lowered into SQL. Construction is the
/// only validation gate; once a plan exists every predicate is whitelisted
/// and every value is bound as a parameter.
#[derive(Debug, Clone)]
pub struct FilterPlan {
    filters: SearchFilters,
    today: NaiveDate,
    order: SearchOrder,
}

impl FilterPlan {
    /// Validates raw client filters into an executable plan.
    pub fn compile(filters: SearchFilters, today: NaiveDate) -> Result<Self, AppError> {
        if let Some(usdot) = filters.usdot_number {
            if usdot <= 0 {
                return Err(AppError::BadRequest(
                    "usdot_number must be positive".to_string(),
                ));
            }
        }

        if let Some(state) = &filters.state {
            let state = state.trim();
            if state.len() != 2 || !state.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(AppError::BadRequest(
                    "state must be a 2-letter code".to_string(),
                ));
            }
        }

        if let (Some(min), Some(max)) = (filters.min_power_units, filters.max_power_units) {
            if min > max {
                return Err(AppError::BadRequest(
                    "min_power_units exceeds max_power_units".to_string(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (filters.min_drivers, filters.max_drivers) {
            if min > max {
                return Err(AppError::BadRequest(
                    "min_drivers exceeds max_drivers".to_string(),
                ));
            }
        }
        for bound in [
            filters.min_power_units,
            filters.max_power_units,
            filters.min_drivers,
            filters.max_drivers,
        ]
        .into_iter()
        .flatten()
        {
            if bound < 0 {
                return Err(AppError::BadRequest(
                    "fleet size bounds must be non-negative".to_string(),
                ));
            }
        }

        if let Some(days) = filters.insurance_expiring_days {
            if !(-365..=365).contains(&days) {
                return Err(AppError::BadRequest(
                    "insurance_expiring_days must be between -365 and 365".to_string(),
                ));
            }
        }

        let order = match filters.text_search.as_deref().map(str::trim) {
            Some(term) if term.len() < 3 => {
                return Err(AppError::BadRequest(
                    "text_search requires at least 3 characters".to_string(),
                ));
            }
            Some(term) => SearchOrder::Similarity(term.to_string()),
            None => match filters.insurance_expiring_days {
                Some(_) => SearchOrder::InsuranceDate,
                None => SearchOrder::Insertion,
            },
        };

        Ok(Self {
            filters,
            today,
            order,
        })
    }

    pub fn order(&self) -> &SearchOrder {
        &self.order
    }

    /// Appends `WHERE ...` to the builder. Always emits at least one clause
    /// so callers can append further `AND`s unconditionally.
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        let f = &self.filters;
        qb.push(" WHERE 1=1");

        if let Some(usdot) = f.usdot_number {
            qb.push(" AND usdot_number = ").push_bind(usdot);
        }
        if let Some(state) = &f.state {
            qb.push(" AND physical_state = ")
                .push_bind(state.trim().to_uppercase());
        }
        if let Some(city) = &f.city {
            let city = city.trim();
            if let Some(prefix) = city.strip_suffix('*') {
                qb.push(" AND physical_city ILIKE ")
                    .push_bind(format!("{}%", escape_like(prefix)));
            } else {
                qb.push(" AND upper(physical_city) = ")
                    .push_bind(city.to_uppercase());
            }
        }
        if let Some(entity) = f.entity_type {
            qb.push(" AND entity_type = ").push_bind(entity.as_str());
        }
        if let Some(status) = f.operating_status {
            qb.push(" AND operating_status = ").push_bind(status.as_str());
        }
        if let Some(rating) = f.safety_rating {
            qb.push(" AND safety_rating = ").push_bind(rating.as_str());
        }
        if let Some(min) = f.min_power_units {
            qb.push(" AND power_units >= ").push_bind(min);
        }
        if let Some(max) = f.max_power_units {
            qb.push(" AND power_units <= ").push_bind(max);
        }
        if let Some(min) = f.min_drivers {
            qb.push(" AND drivers >= ").push_bind(min);
        }
        if let Some(max) = f.max_drivers {
            qb.push(" AND drivers <= ").push_bind(max);
        }
        if f.hazmat_only {
            qb.push(" AND hazmat_flag = TRUE");
        }
        if let Some(days) = f.insurance_expiring_days {
            // Positive window looks forward from today; negative looks at
            // records already expired by up to |days| days.
            let (low, high) = if days >= 0 {
                (self.today, self.today + Duration::days(days as i64))
            } else {
                (
                    self.today + Duration::days(days as i64),
                    self.today - Duration::days(1),
                )
            };
            qb.push(" AND liability_insurance_date BETWEEN ")
                .push_bind(low)
                .push(" AND ")
                .push_bind(high);
        }
        if let Some(companies) = &f.insurance_companies {
            qb.push(
                " AND usdot_number IN (SELECT usdot_number FROM insurance_cache \
                 WHERE insurance_company = ANY(",
            )
            .push_bind(companies.clone())
            .push("))");
        }
        if let SearchOrder::Similarity(term) = &self.order {
            qb.push(" AND (legal_name % ")
                .push_bind(term.clone())
                .push(" OR dba_name % ")
                .push_bind(term.clone())
                .push(")");
        }
    }

    /// Appends the `ORDER BY` clause matching the plan's ordering mode.
    pub fn push_order_by(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match &self.order {
            SearchOrder::Insertion => {
                qb.push(" ORDER BY created_at ASC, usdot_number ASC");
            }
            SearchOrder::InsuranceDate => {
                qb.push(" ORDER BY liability_insurance_date ASC NULLS LAST, usdot_number ASC");
            }
            SearchOrder::Similarity(term) => {
                qb.push(" ORDER BY GREATEST(similarity(legal_name, ")
                    .push_bind(term.clone())
                    .push("), similarity(coalesce(dba_name, ''), ")
                    .push_bind(term.clone())
                    .push(")) DESC, usdot_number ASC");
            }
        }
    }
}

/// Checks pagination against the server cap.
pub fn validate_pagination(pagination: &Pagination, max_page_size: u32) -> Result<(), AppError> {
    if pagination.page == 0 {
        return Err(AppError::BadRequest("page is 1-based".to_string()));
    }
    if pagination.per_page == 0 || pagination.per_page > max_page_size {
        return Err(AppError::BadRequest(format!(
            "per_page must be between 1 and {}",
            max_page_size
        )));
    }
    Ok(())
}

/// Escapes LIKE metacharacters in user-supplied prefixes.
fn escape_like(input: &str) -> String {
    input.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperatingStatus;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()
    }

    fn sql_of(plan: &FilterPlan) -> String {
        let mut qb = QueryBuilder::new("SELECT count(*) FROM carriers");
        plan.push_where(&mut qb);
        plan.push_order_by(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn rejects_bad_state_and_short_search() {
        let err = FilterPlan::compile(
            SearchFilters {
                state: Some("TEX".to_string()),
                ..Default::default()
            },
            today(),
        );
        assert!(matches!(err, Err(AppError::BadRequest(_))));

        let err = FilterPlan::compile(
            SearchFilters {
                text_search: Some("ab".to_string()),
                ..Default::default()
            },
            today(),
        );
        assert!(matches!(err, Err(AppError::BadRequest(_))));
    }

    #[test]
    fn rejects_inverted_ranges() {
        let err = FilterPlan::compile(
            SearchFilters {
                min_power_units: Some(50),
                max_power_units: Some(10),
                ..Default::default()
            },
            today(),
        );
        assert!(matches!(err, Err(AppError::BadRequest(_))));
    }

    #[test]
    fn every_value_is_parameterized() {
        let plan = FilterPlan::compile(
            SearchFilters {
                state: Some("tx".to_string()),
                city: Some("Hou*".to_string()),
                operating_status: Some(OperatingStatus::Active),
                min_power_units: Some(5),
                insurance_expiring_days: Some(30),
                insurance_companies: Some(vec!["Acme Mutual".to_string()]),
                text_search: Some("trucking'; DROP TABLE carriers; --".to_string()),
                ..Default::default()
            },
            today(),
        )
        .unwrap();

        let sql = sql_of(&plan);
        // Values never appear inline; only placeholders.
        assert!(!sql.contains("TX"));
        assert!(!sql.contains("Hou"));
        assert!(!sql.contains("DROP TABLE"));
        assert!(sql.contains("$1"));
        assert!(sql.contains("liability_insurance_date BETWEEN"));
        assert!(sql.contains("insurance_cache"));
    }

    #[test]
    fn ordering_follows_filters() {
        let plan = FilterPlan::compile(SearchFilters::default(), today()).unwrap();
        assert_eq!(plan.order(), &SearchOrder::Insertion);
        assert!(sql_of(&plan).contains("ORDER BY created_at ASC, usdot_number ASC"));

        let plan = FilterPlan::compile(
            SearchFilters {
                insurance_expiring_days: Some(60),
                ..Default::default()
            },
            today(),
        )
        .unwrap();
        assert_eq!(plan.order(), &SearchOrder::InsuranceDate);

        let plan = FilterPlan::compile(
            SearchFilters {
                text_search: Some("acme trucking".to_string()),
                insurance_expiring_days: Some(60),
                ..Default::default()
            },
            today(),
        )
        .unwrap();
        // Text search wins the ordering mode.
        assert!(matches!(plan.order(), SearchOrder::Similarity(_)));
        assert!(sql_of(&plan).contains("similarity"));
    }

    #[test]
    fn negative_expiry_window_looks_backward() {
        let plan = FilterPlan::compile(
            SearchFilters {
                insurance_expiring_days: Some(-30),
                ..Default::default()
            },
            today(),
        )
        .unwrap();
        assert!(sql_of(&plan).contains("BETWEEN"));
    }

    #[test]
    fn pagination_cap_is_enforced() {
        let p = Pagination {
            page: 1,
            per_page: 5000,
        };
        assert!(validate_pagination(&p, 1000).is_err());
        let p = Pagination {
            page: 0,
            per_page: 10,
        };
        assert!(validate_pagination(&p, 1000).is_err());
        let p = Pagination {
            page: 2,
            per_page: 1000,
        };
        assert!(validate_pagination(&p, 1000).is_ok());
    }
}
