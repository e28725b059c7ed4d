//! Time function: amplifies (future) or decays (past) risk probabilities
//! by the gap between the date of service and today.
//!
//! Retrospective denial follows a special linear rule: it decays to zero
//! over 60 days and stays there.

use crate::models::{EventTense, RiskProbabilities};

/// Days after which a retrospective denial can no longer occur.
const RETRO_DENIAL_HORIZON_DAYS: f64 = 60.0;

/// Per-day amplification factor for future events.
fn amplification_alpha(risk_name: &str) -> f64 {
    match risk_name {
        "coverage_loss" => 0.001,
        "payer_error" => 0.0005,
        "provider_error" => 0.0005,
        _ => 0.0005,
    }
}

/// Per-day decay factor for past events.
fn deterioration_alpha(risk_name: &str) -> f64 {
    match risk_name {
        "payer_error" => 0.001,
        "provider_error" => 0.001,
        _ => 0.0005,
    }
}

/// Adjust a single risk probability for the event tense and time gap.
pub fn adjust_risk(
    risk_name: &str,
    base_prob: f64,
    event_tense: EventTense,
    time_gap_days: i64,
) -> f64 {
    let t = time_gap_days.max(0) as f64;
    match event_tense {
        EventTense::Future => {
            let alpha = amplification_alpha(risk_name);
            (base_prob * (alpha * t).exp()).min(1.0)
        }
        EventTense::Past => {
            if risk_name == "retrospective_denial" {
                if t <= RETRO_DENIAL_HORIZON_DAYS {
                    (base_prob * (1.0 - t / RETRO_DENIAL_HORIZON_DAYS)).max(0.0)
                } else {
                    0.0
                }
            } else {
                let alpha = deterioration_alpha(risk_name);
                (base_prob * (-alpha * t).exp()).max(0.0)
            }
        }
        EventTense::Unknown => base_prob,
    }
}

/// Adjust every active risk in the set.
pub fn apply_time_function(
    risks: &RiskProbabilities,
    event_tense: EventTense,
    time_gap_days: i64,
) -> RiskProbabilities {
    RiskProbabilities {
        coverage_loss: risks
            .coverage_loss
            .map(|p| adjust_risk("coverage_loss", p, event_tense, time_gap_days)),
        retrospective_denial: risks
            .retrospective_denial
            .map(|p| adjust_risk("retrospective_denial", p, event_tense, time_gap_days)),
        payer_error: risks
            .payer_error
            .map(|p| adjust_risk("payer_error", p, event_tense, time_gap_days)),
        provider_error: risks
            .provider_error
            .map(|p| adjust_risk("provider_error", p, event_tense, time_gap_days)),
    }
}
