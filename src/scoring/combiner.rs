//! Probabilistic combiner.
//!
//! Applies time-adjusted risks to the base distribution in a fixed order:
//! coverage loss, then retrospective denial (both move mass from YES to NO),
//! then the combined payer/provider error mass (moves mass from every state
//! into UNKNOWN, which here represents "unresolvable due to error").

use crate::models::{RiskProbabilities, StateDistribution};

/// Combine base probabilities with time-adjusted risks and normalize.
pub fn combine(base: &StateDistribution, risks: &RiskProbabilities) -> StateDistribution {
    let mut out = *base;

    // Coverage loss: P(YES) × (1 − r) → P(NO) += P(YES) × r
    if let Some(loss) = risks.coverage_loss {
        let yes_before = out.yes;
        out.yes = yes_before * (1.0 - loss);
        out.no += yes_before * loss;
    }

    // Retrospective denial: same transformation with its own probability.
    if let Some(denial) = risks.retrospective_denial {
        let yes_before = out.yes;
        out.yes = yes_before * (1.0 - denial);
        out.no += yes_before * denial;
    }

    // Payer + provider errors: drain the combined mass proportionally from
    // every state into UNKNOWN.
    let error_mass = risks.payer_error.unwrap_or(0.0) + risks.provider_error.unwrap_or(0.0);
    if error_mass > 0.0 {
        let total = out.sum();
        if total > 0.0 {
            let drained = total * error_mass;
            out.scale(1.0 - error_mass);
            out.unknown += drained;
        }
    }

    normalize(&mut out);
    out
}

/// Normalize in place; residual round-off goes to the largest entry so the
/// four states sum to exactly 1.
fn normalize(dist: &mut StateDistribution) {
    let total = dist.sum();
    if total > 0.0 {
        dist.scale(1.0 / total);
    }
    let residual = 1.0 - dist.sum();
    if residual != 0.0 {
        let target = dist.argmax();
        dist.set(target, dist.get(target) + residual);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EligibilityStatus, StateDistribution};

    const EPS: f64 = 1e-6;

    #[test]
    fn test_coverage_loss_moves_mass_from_yes_to_no() {
        let base = StateDistribution::one_hot(EligibilityStatus::Yes);
        let risks = RiskProbabilities {
            coverage_loss: Some(0.15),
            ..Default::default()
        };
        let out = combine(&base, &risks);
        assert!((out.yes - 0.85).abs() < EPS);
        assert!((out.no - 0.15).abs() < EPS);
        assert!((out.sum() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_no_mass_to_move_when_yes_is_zero() {
        // Direct-evidence NO case: risks cannot resurrect the YES state.
        let base = StateDistribution::one_hot(EligibilityStatus::No);
        let risks = RiskProbabilities {
            coverage_loss: Some(0.15),
            retrospective_denial: Some(0.10),
            ..Default::default()
        };
        let out = combine(&base, &risks);
        assert!(out.yes.abs() < EPS);
        assert!((out.no - 1.0).abs() < EPS);
    }

    #[test]
    fn test_error_mass_sinks_into_unknown() {
        let base = StateDistribution::one_hot(EligibilityStatus::Yes);
        let risks = RiskProbabilities {
            payer_error: Some(0.05),
            provider_error: Some(0.03),
            ..Default::default()
        };
        let out = combine(&base, &risks);
        assert!((out.yes - 0.92).abs() < EPS);
        assert!((out.unknown - 0.08).abs() < EPS);
        assert!((out.sum() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_application_order_coverage_then_denial() {
        let base = StateDistribution::one_hot(EligibilityStatus::Yes);
        let risks = RiskProbabilities {
            coverage_loss: Some(0.2),
            retrospective_denial: Some(0.1),
            ..Default::default()
        };
        let out = combine(&base, &risks);
        // YES = 1 × 0.8 × 0.9, NO = 0.2 + 0.8 × 0.1
        assert!((out.yes - 0.72).abs() < EPS);
        assert!((out.no - 0.28).abs() < EPS);
    }

    #[test]
    fn test_result_always_normalized() {
        let base = StateDistribution {
            yes: 0.4,
            no: 0.3,
            not_established: 0.2,
            unknown: 0.1,
        };
        let risks = RiskProbabilities {
            coverage_loss: Some(0.3),
            retrospective_denial: Some(0.2),
            payer_error: Some(0.07),
            provider_error: Some(0.02),
        };
        let out = combine(&base, &risks);
        assert!((out.sum() - 1.0).abs() < 1e-9);
        for status in EligibilityStatus::ALL {
            let p = out.get(status);
            assert!((0.0..=1.0).contains(&p), "{:?} out of range: {}", status, p);
        }
    }

    #[test]
    fn test_empty_risks_is_identity() {
        let base = StateDistribution {
            yes: 0.5,
            no: 0.25,
            not_established: 0.15,
            unknown: 0.1,
        };
        let out = combine(&base, &RiskProbabilities::default());
        assert!((out.yes - 0.5).abs() < EPS);
        assert!((out.no - 0.25).abs() < EPS);
    }
}
