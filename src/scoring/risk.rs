//! Risk probability calculator.
//!
//! Produces the probability of each payment risk actually occurring (not an
//! adjustment). Which risks are active depends on the event tense; base
//! values come from the historical fact table when a sample exists, with
//! product-type-aware defaults otherwise.

use chrono::NaiveDate;
use tracing::debug;

use crate::models::{CaseState, EventTense, ProductType, RiskProbabilities};
use crate::propensity::PropensityStore;

const DEFAULT_RETRO_DENIAL_RISK: f64 = 0.10;
const DEFAULT_PAYER_ERROR_RISK: f64 = 0.05;
const DEFAULT_PROVIDER_ERROR_RISK: f64 = 0.03;

fn default_coverage_loss_risk(product_type: ProductType) -> f64 {
    match product_type {
        ProductType::Medicaid => 0.15,
        ProductType::Dsnp => 0.12,
        ProductType::Medicare => 0.08,
        ProductType::Commercial => 0.05,
        ProductType::Other | ProductType::Unknown => 0.10,
    }
}

/// Compute the active risk set for the case.
pub fn compute_risk_probabilities(
    case: &CaseState,
    propensity: &PropensityStore,
    today: NaiveDate,
) -> RiskProbabilities {
    match case.timing.event_tense {
        EventTense::Future => RiskProbabilities {
            coverage_loss: Some(coverage_loss_risk(case, propensity, today)),
            payer_error: Some(payer_error_risk(case, propensity)),
            provider_error: Some(provider_error_risk(case, propensity)),
            retrospective_denial: None,
        },
        EventTense::Past => RiskProbabilities {
            retrospective_denial: Some(retro_denial_risk(case, propensity, today)),
            payer_error: Some(payer_error_risk(case, propensity)),
            provider_error: Some(provider_error_risk(case, propensity)),
            coverage_loss: None,
        },
        EventTense::Unknown => RiskProbabilities::default(),
    }
}

/// Probability of losing coverage before the DOS.
fn coverage_loss_risk(case: &CaseState, propensity: &PropensityStore, today: NaiveDate) -> f64 {
    let Some(dos) = case.timing.dos_date else {
        return 0.0;
    };
    let days_until_dos = (dos - today).num_days();
    if days_until_dos <= 0 {
        return 0.0;
    }

    let product_type = case.health_plan.product_type;
    match propensity.coverage_loss_rate(product_type.as_str(), days_until_dos) {
        Some(rate) => rate,
        None => {
            debug!(
                "no coverage-loss sample for {} at {} days; using default",
                product_type.as_str(),
                days_until_dos
            );
            default_coverage_loss_risk(product_type)
        }
    }
}

/// Probability of a retrospective payment denial after a past DOS.
fn retro_denial_risk(case: &CaseState, propensity: &PropensityStore, today: NaiveDate) -> f64 {
    let Some(dos) = case.timing.dos_date else {
        return 0.0;
    };
    let days_since_visit = (today - dos).num_days();
    if days_since_visit <= 0 {
        return 0.0;
    }

    propensity
        .retro_denial_rate(days_since_visit)
        .unwrap_or(DEFAULT_RETRO_DENIAL_RISK)
}

/// Probability of a payer system error, per-payer when history exists.
fn payer_error_risk(case: &CaseState, propensity: &PropensityStore) -> f64 {
    let Some(payer_id) = case.health_plan.payer_id.as_deref() else {
        return DEFAULT_PAYER_ERROR_RISK;
    };
    propensity
        .payer_error_rate(payer_id)
        .unwrap_or(DEFAULT_PAYER_ERROR_RISK)
}

/// Probability of a provider data error; keyed by the first related visit's
/// provider when history exists.
fn provider_error_risk(case: &CaseState, propensity: &PropensityStore) -> f64 {
    let provider = case
        .timing
        .related_visits
        .first()
        .and_then(|v| v.provider.as_deref());
    match provider {
        Some(provider) => propensity
            .provider_error_rate(provider)
            .unwrap_or(DEFAULT_PROVIDER_ERROR_RISK),
        None => DEFAULT_PROVIDER_ERROR_RISK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propensity::TransactionRow;
    use chrono::Duration;

    fn store() -> PropensityStore {
        PropensityStore::new(":memory:").expect("in-memory store")
    }

    fn future_case(days_ahead: i64, today: NaiveDate) -> CaseState {
        let mut case = CaseState::default();
        case.timing.dos_date = Some(today + Duration::days(days_ahead));
        case.timing.event_tense = EventTense::Future;
        case
    }

    #[test]
    fn test_unknown_tense_has_no_risks() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let case = CaseState::default();
        let risks = compute_risk_probabilities(&case, &store(), today);
        assert!(risks.is_empty());
    }

    #[test]
    fn test_future_risk_set_with_defaults() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let mut case = future_case(30, today);
        case.health_plan.product_type = ProductType::Commercial;

        let risks = compute_risk_probabilities(&case, &store(), today);
        assert_eq!(risks.coverage_loss, Some(0.05));
        assert_eq!(risks.payer_error, Some(0.05));
        assert_eq!(risks.provider_error, Some(0.03));
        assert!(risks.retrospective_denial.is_none());
    }

    #[test]
    fn test_coverage_loss_defaults_vary_by_product() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let store = store();
        for (product, expected) in [
            (ProductType::Medicaid, 0.15),
            (ProductType::Dsnp, 0.12),
            (ProductType::Medicare, 0.08),
            (ProductType::Commercial, 0.05),
            (ProductType::Unknown, 0.10),
        ] {
            let mut case = future_case(14, today);
            case.health_plan.product_type = product;
            let risks = compute_risk_probabilities(&case, &store, today);
            assert_eq!(risks.coverage_loss, Some(expected), "{:?}", product);
        }
    }

    #[test]
    fn test_past_risk_set() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let mut case = CaseState::default();
        case.timing.dos_date = Some(today - Duration::days(20));
        case.timing.event_tense = EventTense::Past;

        let risks = compute_risk_probabilities(&case, &store(), today);
        assert_eq!(risks.retrospective_denial, Some(0.10));
        assert!(risks.coverage_loss.is_none());
    }

    #[test]
    fn test_historical_payer_error_rate_overrides_default() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let store = store();
        for i in 0..10 {
            store
                .insert_transaction(&TransactionRow {
                    payer_id: Some("AET001".to_string()),
                    eligibility_status: "YES".to_string(),
                    error_type: (i < 2).then(|| "edi_reject".to_string()),
                    ..Default::default()
                })
                .unwrap();
        }

        let mut case = future_case(10, today);
        case.health_plan.payer_id = Some("AET001".to_string());
        let risks = compute_risk_probabilities(&case, &store, today);
        assert!((risks.payer_error.unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_zero_gap_means_no_coverage_loss() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let case = future_case(0, today);
        let risks = compute_risk_probabilities(&case, &store(), today);
        assert_eq!(risks.coverage_loss, Some(0.0));
    }
}
