use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::errors::AppError;
use crate::models::{Carrier, CarrierSummary, Lead, SafetyRating};

/// Insurance standing relative to a reference date. Computed at read time
/// from the liability insurance date, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsuranceStatus {
    Valid,
    ExpiringSoon,
    Expiring60Days,
    Expiring90Days,
    Expired,
    Unknown,
}

impl InsuranceStatus {
    /// Buckets by days until expiration, boundaries inclusive on the low
    /// side: 0-30 expiring_soon, 31-60, 61-90, >90 valid, <0 expired.
    pub fn classify(insurance_date: Option<NaiveDate>, today: NaiveDate) -> Self {
        let Some(date) = insurance_date else {
            return InsuranceStatus::Unknown;
        };
        let days = (date - today).num_days();
        if days < 0 {
            InsuranceStatus::Expired
        } else if days <= 30 {
            InsuranceStatus::ExpiringSoon
        } else if days <= 60 {
            InsuranceStatus::Expiring60Days
        } else if days <= 90 {
            InsuranceStatus::Expiring90Days
        } else {
            InsuranceStatus::Valid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InsuranceStatus::Valid => "valid",
            InsuranceStatus::ExpiringSoon => "expiring_soon",
            InsuranceStatus::Expiring60Days => "expiring_60_days",
            InsuranceStatus::Expiring90Days => "expiring_90_days",
            InsuranceStatus::Expired => "expired",
            InsuranceStatus::Unknown => "unknown",
        }
    }
}

/// Lead score weight table. Defaults mirror the production tuning; an
/// operator can override the whole table from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub base: i32,
    pub insurance_expired: i32,
    pub insurance_within_30: i32,
    pub insurance_within_60: i32,
    pub insurance_within_90: i32,
    pub fleet_large: i32,
    pub fleet_medium: i32,
    pub fleet_small: i32,
    pub many_drivers: i32,
    pub rating_satisfactory: i32,
    pub rating_problem: i32,
    pub hazmat: i32,
    pub has_phone: i32,
    pub has_email: i32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            base: 50,
            insurance_expired: 30,
            insurance_within_30: 40,
            insurance_within_60: 25,
            insurance_within_90: 15,
            fleet_large: 15,
            fleet_medium: 10,
            fleet_small: 5,
            many_drivers: 5,
            rating_satisfactory: 5,
            rating_problem: -10,
            hazmat: 5,
            has_phone: 3,
            has_email: 2,
        }
    }
}

impl ScoreWeights {
    /// Loads an override table from a JSON file; fields not present fall
    /// back to the defaults via `#[serde(default)]`.
    pub fn from_file(path: &str) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::InternalError(format!("cannot read score weights {}: {}", path, e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::InternalError(format!("invalid score weights {}: {}", path, e))
        })
    }
}

/// Stateless lead scorer.
#[derive(Debug, Clone, Default)]
pub struct LeadScorer {
    weights: ScoreWeights,
}

impl LeadScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    /// Scores a carrier for outreach priority. Returns the clamped 0-100
    /// score together with human-readable reasons for each contribution.
    pub fn score(&self, carrier: &Carrier, today: NaiveDate) -> (u8, Vec<String>) {
        let w = &self.weights;
        let mut score = w.base;
        let mut reasons = Vec::new();

        match InsuranceStatus::classify(carrier.liability_insurance_date, today) {
            InsuranceStatus::Expired => {
                score += w.insurance_expired;
                reasons.push("Insurance expired - immediate need".to_string());
            }
            InsuranceStatus::ExpiringSoon => {
                score += w.insurance_within_30;
                reasons.push("Insurance expires within 30 days".to_string());
            }
            InsuranceStatus::Expiring60Days => {
                score += w.insurance_within_60;
                reasons.push("Insurance expires within 60 days".to_string());
            }
            InsuranceStatus::Expiring90Days => {
                score += w.insurance_within_90;
                reasons.push("Insurance expires within 90 days".to_string());
            }
            InsuranceStatus::Valid | InsuranceStatus::Unknown => {}
        }

        let power_units = carrier.power_units.unwrap_or(0);
        if power_units >= 50 {
            score += w.fleet_large;
            reasons.push(format!("Large fleet ({} power units)", power_units));
        } else if power_units >= 20 {
            score += w.fleet_medium;
            reasons.push(format!("Medium fleet ({} power units)", power_units));
        } else if power_units >= 5 {
            score += w.fleet_small;
            reasons.push(format!("Small fleet ({} power units)", power_units));
        }

        if carrier.drivers.unwrap_or(0) >= 50 {
            score += w.many_drivers;
            reasons.push("50+ drivers".to_string());
        }

        match SafetyRating::from_db(carrier.safety_rating.as_deref()) {
            SafetyRating::Satisfactory => {
                score += w.rating_satisfactory;
                reasons.push("Satisfactory safety rating".to_string());
            }
            SafetyRating::Conditional | SafetyRating::Unsatisfactory => {
                score += w.rating_problem;
                reasons.push("Safety rating needs attention".to_string());
            }
            SafetyRating::Unrated => {}
        }

        if carrier.hazmat_flag {
            score += w.hazmat;
            reasons.push("Hazmat certified - specialty coverage".to_string());
        }

        if carrier.telephone.is_some() {
            score += w.has_phone;
            reasons.push("Phone contact on file".to_string());
        }
        if carrier.email.is_some() {
            score += w.has_email;
            reasons.push("Email contact on file".to_string());
        }

        (score.clamp(0, 100) as u8, reasons)
    }

    /// Builds a full lead from a carrier row.
    pub fn build_lead(&self, carrier: &Carrier, today: NaiveDate) -> Lead {
        let (score, score_reasons) = self.score(carrier, today);
        let priority = match score {
            90..=100 => 1,
            75..=89 => 2,
            60..=74 => 3,
            45..=59 => 4,
            _ => 5,
        };
        let best_contact_method = if carrier.email.is_some() {
            "email"
        } else if carrier.telephone.is_some() {
            "phone"
        } else {
            "mail"
        };
        Lead {
            carrier: carrier.summarize(today),
            score,
            score_reasons,
            priority,
            best_contact_method,
        }
    }
}

/// Deterministic lead ordering: score descending, then soonest insurance
/// expiration, then USDOT number ascending as the final tiebreak.
pub fn compare_leads(a: &Lead, b: &Lead) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| {
            date_rank(&a.carrier).cmp(&date_rank(&b.carrier))
        })
        .then_with(|| a.carrier.usdot_number.cmp(&b.carrier.usdot_number))
}

fn date_rank(c: &CarrierSummary) -> (bool, NaiveDate) {
    match c.liability_insurance_date {
        Some(d) => (false, d),
        // Unknown dates sort after every known one.
        None => (true, NaiveDate::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn carrier(usdot: i64) -> Carrier {
        Carrier {
            usdot_number: usdot,
            legal_name: format!("CARRIER {}", usdot),
            dba_name: None,
            physical_address: None,
            physical_city: None,
            physical_state: None,
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
            power_units: None,
            drivers: None,
            hazmat_flag: false,
            safety_rating: None,
            liability_insurance_date: None,
            liability_insurance_amount: None,
            cargo_insurance_date: None,
            cargo_insurance_amount: None,
            mcs_150_date: None,
            missed_refreshes: 0,
            raw_data: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn classify_boundaries_are_inclusive() {
        let today = d("2024-06-01");
        assert_eq!(
            InsuranceStatus::classify(None, today),
            InsuranceStatus::Unknown
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-05-31")), today),
            InsuranceStatus::Expired
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-06-01")), today),
            InsuranceStatus::ExpiringSoon
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-07-01")), today),
            InsuranceStatus::ExpiringSoon
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-07-02")), today),
            InsuranceStatus::Expiring60Days
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-07-31")), today),
            InsuranceStatus::Expiring60Days
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-08-01")), today),
            InsuranceStatus::Expiring90Days
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-08-30")), today),
            InsuranceStatus::Expiring90Days
        );
        assert_eq!(
            InsuranceStatus::classify(Some(d("2024-08-31")), today),
            InsuranceStatus::Valid
        );
    }

    #[test]
    fn scores_expiring_small_fleet() {
        // 12 power units, insurance 10 days out: 50 base + 40 + 5 = 95.
        let mut c = carrier(905413);
        c.power_units = Some(12);
        c.liability_insurance_date = Some(d("2024-02-20"));
        let scorer = LeadScorer::default();
        let (score, reasons) = scorer.score(&c, d("2024-02-10"));
        assert_eq!(score, 95);
        assert!(reasons.iter().any(|r| r.contains("within 30 days")));
        assert!(reasons.iter().any(|r| r.contains("Small fleet")));
        assert_eq!(
            InsuranceStatus::classify(c.liability_insurance_date, d("2024-02-10")),
            InsuranceStatus::ExpiringSoon
        );
    }

    #[test]
    fn score_is_clamped_to_100() {
        let mut c = carrier(1);
        c.power_units = Some(120);
        c.drivers = Some(200);
        c.hazmat_flag = true;
        c.safety_rating = Some("SATISFACTORY".to_string());
        c.liability_insurance_date = Some(d("2024-02-15"));
        let (score, _) = LeadScorer::default().score(&c, d("2024-02-10"));
        assert_eq!(score, 100);
    }

    #[test]
    fn contact_presence_adds_bonuses() {
        let mut c = carrier(3);
        c.telephone = Some("5551234567".to_string());
        c.email = Some("ops@example.com".to_string());
        let (score, reasons) = LeadScorer::default().score(&c, d("2024-02-10"));
        // base 50 + phone 3 + email 2
        assert_eq!(score, 55);
        assert!(reasons.iter().any(|r| r.contains("Phone")));
        assert!(reasons.iter().any(|r| r.contains("Email")));
    }

    #[test]
    fn problem_rating_subtracts() {
        let mut c = carrier(2);
        c.safety_rating = Some("CONDITIONAL".to_string());
        let (score, reasons) = LeadScorer::default().score(&c, d("2024-02-10"));
        assert_eq!(score, 40);
        assert_eq!(reasons.len(), 1);
    }

    #[test]
    fn lead_ordering_breaks_ties_deterministically() {
        let scorer = LeadScorer::default();
        let today = d("2024-02-10");

        let mut a = carrier(200);
        a.liability_insurance_date = Some(d("2024-02-20"));
        let mut b = carrier(100);
        b.liability_insurance_date = Some(d("2024-02-20"));
        let mut c = carrier(300);
        c.liability_insurance_date = Some(d("2024-02-15"));

        let mut leads = vec![
            scorer.build_lead(&a, today),
            scorer.build_lead(&b, today),
            scorer.build_lead(&c, today),
        ];
        leads.sort_by(compare_leads);

        // Same score throughout: soonest date first, then lower USDOT.
        assert_eq!(leads[0].carrier.usdot_number, 300);
        assert_eq!(leads[1].carrier.usdot_number, 100);
        assert_eq!(leads[2].carrier.usdot_number, 200);
    }
}
