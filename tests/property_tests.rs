/// Property-based tests using proptest
use chrono::{Duration, NaiveDate, Utc};
use fmcsa_carrier_api::models::Carrier;
use fmcsa_carrier_api::scoring::{InsuranceStatus, LeadScorer, ScoreWeights};
use proptest::prelude::*;

fn carrier_with(
    power_units: Option<i32>,
    drivers: Option<i32>,
    hazmat: bool,
    rating: Option<String>,
    insurance_offset_days: Option<i64>,
    today: NaiveDate,
) -> Carrier {
    Carrier {
        usdot_number: 1,
        legal_name: "PROP CARRIER".to_string(),
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
        power_units,
        drivers,
        hazmat_flag: hazmat,
        safety_rating: rating,
        liability_insurance_date: insurance_offset_days.map(|d| today + Duration::days(d)),
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

fn rating_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("SATISFACTORY".to_string())),
        Just(Some("CONDITIONAL".to_string())),
        Just(Some("UNSATISFACTORY".to_string())),
        Just(Some("GIBBERISH".to_string())),
    ]
}

proptest! {
    #[test]
    fn score_is_always_within_bounds(
        power_units in proptest::option::of(0i32..5000),
        drivers in proptest::option::of(0i32..5000),
        hazmat in proptest::bool::ANY,
        rating in rating_strategy(),
        offset in proptest::option::of(-400i64..400),
    ) {
        let today = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        let carrier = carrier_with(power_units, drivers, hazmat, rating, offset, today);
        let (score, reasons) = LeadScorer::default().score(&carrier, today);
        prop_assert!(score <= 100);
        // Every reason corresponds to a real contribution; an empty-reason
        // carrier must sit at exactly the base score.
        if reasons.is_empty() {
            prop_assert_eq!(score, 50);
        }
    }

    #[test]
    fn classification_covers_every_offset(offset in -1000i64..1000) {
        let today = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        let date = today + Duration::days(offset);
        let status = InsuranceStatus::classify(Some(date), today);
        let expected = if offset < 0 {
            InsuranceStatus::Expired
        } else if offset <= 30 {
            InsuranceStatus::ExpiringSoon
        } else if offset <= 60 {
            InsuranceStatus::Expiring60Days
        } else if offset <= 90 {
            InsuranceStatus::Expiring90Days
        } else {
            InsuranceStatus::Valid
        };
        prop_assert_eq!(status, expected);
    }

    #[test]
    fn custom_weights_never_escape_the_clamp(
        base in -200i32..200,
        bump in -200i32..200,
    ) {
        let today = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        let weights = ScoreWeights {
            base,
            insurance_within_30: bump,
            ..ScoreWeights::default()
        };
        let carrier = carrier_with(Some(10), None, false, None, Some(5), today);
        let (score, _) = LeadScorer::new(weights).score(&carrier, today);
        prop_assert!(score <= 100);
    }
}
