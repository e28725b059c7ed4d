//! Base probability calculator.
//!
//! Purist approach: a completed coverage check with a YES/NO determination
//! is deterministic (one-hot); anything else falls back to the historical
//! propensity distribution.

use crate::models::{CaseState, EligibilityStatus, StateDistribution};
use crate::propensity::{PropensityDims, PropensityStore};

pub const SOURCE_DIRECT_EVIDENCE: &str = "direct_evidence";
pub const SOURCE_HISTORICAL_FALLBACK: &str = "historical_fallback";

/// Base distribution over the four states plus its source tag.
pub fn compute_base_probability(
    case: &CaseState,
    propensity: &PropensityStore,
) -> (StateDistribution, &'static str) {
    if case.eligibility_check.checked {
        match case.eligibility_truth.status {
            EligibilityStatus::Yes => {
                return (
                    StateDistribution::one_hot(EligibilityStatus::Yes),
                    SOURCE_DIRECT_EVIDENCE,
                );
            }
            EligibilityStatus::No => {
                return (
                    StateDistribution::one_hot(EligibilityStatus::No),
                    SOURCE_DIRECT_EVIDENCE,
                );
            }
            _ => {}
        }
    }

    let dims = PropensityDims::from_case(case);
    (propensity.state_distribution(&dims), SOURCE_HISTORICAL_FALLBACK)
}
