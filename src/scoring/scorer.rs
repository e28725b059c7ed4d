//! Eligibility scorer.
//!
//! Wires the base calculator, risk calculator, time function, and combiner
//! into a single deterministic `ScoreState` for a case as of a given day.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use crate::events::ProgressSink;
use crate::models::{CaseState, ScoreState};
use crate::propensity::{PropensityDims, PropensityStore};
use crate::scoring::{base, combiner, risk, time};

pub const SCORING_VERSION: &str = "v1";

pub struct Scorer {
    propensity: Arc<PropensityStore>,
}

impl Scorer {
    pub fn new(propensity: Arc<PropensityStore>) -> Self {
        Self { propensity }
    }

    /// Score one case deterministically as of `today`.
    ///
    /// Same case state + same day always produces the same `ScoreState`.
    pub fn score(&self, case: &CaseState, today: NaiveDate, sink: &dyn ProgressSink) -> ScoreState {
        let (base_dist, base_source) = base::compute_base_probability(case, &self.propensity);
        sink.thinking(
            "scoring",
            &format!(
                "[Calculation: base_probability] source={}, P(YES)={:.1}%",
                base_source,
                base_dist.yes * 100.0
            ),
            Some(serde_json::json!({
                "calculation_step": "base_probability",
                "source": base_source,
                "probabilities": base_dist,
            })),
        );

        let risks = risk::compute_risk_probabilities(case, &self.propensity, today);
        if !risks.is_empty() {
            sink.thinking(
                "scoring",
                &format!(
                    "[Calculation: risk_probabilities] {} event risks computed",
                    case.timing.event_tense.as_str()
                ),
                Some(serde_json::json!({
                    "calculation_step": "risk_probabilities",
                    "event_tense": case.timing.event_tense.as_str(),
                    "risks": risks,
                })),
            );
        }

        let time_gap_days = case
            .timing
            .dos_date
            .map(|dos| (dos - today).num_days().abs())
            .unwrap_or(0);
        let adjusted = time::apply_time_function(&risks, case.timing.event_tense, time_gap_days);
        if adjusted != risks {
            sink.thinking(
                "scoring",
                &format!(
                    "[Calculation: time_adjustment] risks adjusted for {}-day gap",
                    time_gap_days
                ),
                Some(serde_json::json!({
                    "calculation_step": "time_adjustment",
                    "time_gap_days": time_gap_days,
                    "adjusted_risks": adjusted,
                })),
            );
        }

        let final_dist = combiner::combine(&base_dist, &adjusted);

        let stratum = self.propensity.best_stratum(&PropensityDims::from_case(case));
        let base_confidence = if base_source == base::SOURCE_DIRECT_EVIDENCE {
            1.0
        } else {
            stratum.combined_confidence
        };

        debug!(
            "scored case: P(YES)={:.3} source={} backoff_level={} n={}",
            final_dist.yes, base_source, stratum.backoff_level, stratum.sample_size
        );

        ScoreState {
            base_probability: final_dist.yes,
            base_confidence,
            base_source: base_source.to_string(),
            state_probabilities: final_dist,
            risk_probabilities: risks,
            adjusted_risks: adjusted,
            probability_interval: stratum.probability_interval,
            backoff_level: Some(stratum.backoff_level),
            backoff_dims: stratum.backoff_dims,
            sample_size: stratum.sample_size,
            scoring_version: SCORING_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::models::{EligibilityStatus, EventTense, ProductType};
    use chrono::Duration;

    fn scorer() -> Scorer {
        Scorer::new(Arc::new(PropensityStore::new(":memory:").unwrap()))
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    }

    fn checked_yes_case(days_ahead: i64) -> CaseState {
        let mut case = CaseState::default();
        case.eligibility_check.checked = true;
        case.eligibility_truth.status = EligibilityStatus::Yes;
        case.health_plan.product_type = ProductType::Commercial;
        case.timing.dos_date = Some(today() + Duration::days(days_ahead));
        case.timing.event_tense = EventTense::Future;
        case
    }

    #[test]
    fn test_distribution_invariants_hold() {
        let score = scorer().score(&checked_yes_case(30), today(), &NullSink);
        let dist = score.state_probabilities;
        assert!((dist.sum() - 1.0).abs() < 1e-6);
        for status in EligibilityStatus::ALL {
            let p = dist.get(status);
            assert!(p.is_finite() && (0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn test_direct_evidence_confidence_is_one() {
        let score = scorer().score(&checked_yes_case(30), today(), &NullSink);
        assert_eq!(score.base_source, "direct_evidence");
        assert!((score.base_confidence - 1.0).abs() < 1e-9);
        assert_eq!(score.scoring_version, "v1");
    }

    #[test]
    fn test_future_commercial_case_headline() {
        // P(YES) after coverage loss and error drains for a 30-day-out
        // COMMERCIAL case with direct YES evidence.
        let score = scorer().score(&checked_yes_case(30), today(), &NullSink);
        let loss = 0.05 * (0.001f64 * 30.0).exp();
        let error = 0.05 * (0.0005f64 * 30.0).exp() + 0.03 * (0.0005f64 * 30.0).exp();
        let expected_yes = (1.0 - loss) * (1.0 - error);
        assert!(
            (score.base_probability - expected_yes).abs() < 1e-9,
            "got {}, expected {}",
            score.base_probability,
            expected_yes
        );
    }

    #[test]
    fn test_determinism() {
        let case = checked_yes_case(12);
        let scorer = scorer();
        let a = scorer.score(&case, today(), &NullSink);
        let b = scorer.score(&case, today(), &NullSink);
        assert_eq!(a.base_probability, b.base_probability);
        assert_eq!(a.state_probabilities, b.state_probabilities);
        assert_eq!(a.adjusted_risks, b.adjusted_risks);
        assert_eq!(a.sample_size, b.sample_size);
    }

    #[test]
    fn test_no_dos_means_zero_gap() {
        let mut case = CaseState::default();
        case.eligibility_check.checked = true;
        case.eligibility_truth.status = EligibilityStatus::Yes;
        // tense UNKNOWN, no dos: no risks active, score stays deterministic
        let score = scorer().score(&case, today(), &NullSink);
        assert!((score.base_probability - 1.0).abs() < 1e-9);
        assert!(score.risk_probabilities.is_empty());
    }
}
