//! Deterministic case-state updater.
//!
//! The only path through which `CaseState` changes. Takes a value, applies
//! one payload from one source under the precedence rules, and returns the
//! updated value:
//!
//! - PAYER overwrites the eligibility truth and check bookkeeping.
//! - INTERPRETER may only touch the patient / health-plan / timing buckets
//!   and never the eligibility truth once a check is on record.
//! - TOOL fills fields that are still unset and rebuilds the visit list.
//! - SCORING is reserved and currently a no-op.
//!
//! Invalid categorical values and malformed dates are dropped field-by-field
//! with a log line; they are never fatal.

use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    derive_event_tense, parse_iso_date, CaseState, CheckSource, ContractStatus, EligibilityStatus,
    EventTense, EvidenceStrength, ProductType, Sex, SuggestedUpdates, VisitInfo, VisitStatus,
};
use crate::tools::{CoverageResult, CoverageWindow, Demographics, InsuranceProfile, VisitRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Tool,
    Payer,
    Interpreter,
    Scoring,
}

#[derive(Debug, Clone)]
pub enum UpdatePayload {
    Demographics(Demographics),
    Insurance(InsuranceProfile),
    Visits(Vec<VisitRecord>),
    Coverage(CoverageResult),
    Suggestions(SuggestedUpdates),
}

/// Apply one update deterministically. Mismatched source/payload pairs are
/// logged and ignored.
pub fn apply_update(
    mut case: CaseState,
    source: UpdateSource,
    payload: &UpdatePayload,
    today: NaiveDate,
) -> CaseState {
    match (source, payload) {
        (UpdateSource::Tool, UpdatePayload::Demographics(demographics)) => {
            apply_demographics(&mut case, demographics);
        }
        (UpdateSource::Tool, UpdatePayload::Insurance(insurance)) => {
            apply_insurance(&mut case, insurance);
        }
        (UpdateSource::Tool, UpdatePayload::Visits(visits)) => {
            apply_visits(&mut case, visits, today);
        }
        (UpdateSource::Payer, UpdatePayload::Coverage(result)) => {
            apply_coverage_result(&mut case, result, today);
        }
        (UpdateSource::Interpreter, UpdatePayload::Suggestions(suggestions)) => {
            apply_suggestions(&mut case, suggestions);
        }
        (UpdateSource::Scoring, _) => {}
        (source, payload) => {
            warn!("ignoring mismatched update: {:?} with {:?}", source, payload);
        }
    }

    derive_fields(&mut case, today);
    case
}

/// The first window that is both marked active and contains today.
pub fn first_active_window<'a>(
    windows: &'a [CoverageWindow],
    today: NaiveDate,
) -> Option<&'a CoverageWindow> {
    windows.iter().find(|window| {
        if window.status != "active" {
            return false;
        }
        let (Some(start), Some(end)) = (
            parse_iso_date(&window.effective_date),
            parse_iso_date(&window.end_date),
        ) else {
            return false;
        };
        start <= today && today <= end
    })
}

fn apply_coverage_result(case: &mut CaseState, result: &CoverageResult, today: NaiveDate) {
    match first_active_window(&result.eligibility_windows, today) {
        Some(window) => {
            case.eligibility_truth.status = EligibilityStatus::Yes;
            case.eligibility_truth.coverage_window_start = parse_iso_date(&window.effective_date);
            case.eligibility_truth.coverage_window_end = parse_iso_date(&window.end_date);
            case.eligibility_truth.evidence_strength = EvidenceStrength::High;

            if case.health_plan.product_type == ProductType::Unknown {
                case.health_plan.product_type =
                    infer_product_type(window.plan_name.as_deref(), case.health_plan.payer_name.as_deref());
            }

            let plan_missing = case
                .health_plan
                .plan_name
                .as_deref()
                .map(|p| p.is_empty() || p == "UNKNOWN")
                .unwrap_or(true);
            if plan_missing {
                case.health_plan.plan_name = window.plan_name.clone();
            }
        }
        None => {
            case.eligibility_truth.status = EligibilityStatus::No;
            case.eligibility_truth.evidence_strength = EvidenceStrength::High;
            case.eligibility_truth.coverage_window_start = None;
            case.eligibility_truth.coverage_window_end = None;
        }
    }

    case.eligibility_check.checked = true;
    case.eligibility_check.check_date = Some(today);
    case.eligibility_check.source = CheckSource::Clearinghouse;
    case.eligibility_check.result_raw = serde_json::to_value(result).ok();
}

/// Case-insensitive substring inference, in fixed order; commercial is the
/// default for payer results with no recognizable product marker.
fn infer_product_type(plan_name: Option<&str>, payer_name: Option<&str>) -> ProductType {
    let plan = plan_name.unwrap_or("").to_lowercase();
    let payer = payer_name.unwrap_or("").to_lowercase();

    if plan.contains("medicaid") || payer.contains("medicaid") {
        ProductType::Medicaid
    } else if plan.contains("medicare") || payer.contains("medicare") {
        ProductType::Medicare
    } else if plan.contains("dsnp") {
        ProductType::Dsnp
    } else if ["commercial", "ppo", "hmo", "epo"]
        .iter()
        .any(|term| plan.contains(term))
    {
        ProductType::Commercial
    } else {
        ProductType::Commercial
    }
}

fn fill_string(target: &mut Option<String>, value: Option<&str>) {
    if target.as_deref().map(|s| !s.is_empty()).unwrap_or(false) {
        return;
    }
    if let Some(value) = value {
        if !value.trim().is_empty() {
            *target = Some(value.trim().to_string());
        }
    }
}

fn apply_demographics(case: &mut CaseState, demographics: &Demographics) {
    fill_string(&mut case.patient.member_id, demographics.member_id.as_deref());
    fill_string(&mut case.patient.first_name, demographics.first_name.as_deref());
    fill_string(&mut case.patient.last_name, demographics.last_name.as_deref());

    if case.patient.date_of_birth.is_none() {
        if let Some(dob) = demographics.date_of_birth.as_deref() {
            case.patient.date_of_birth = parse_iso_date(dob);
        }
    }
    if case.patient.sex == Sex::Unknown {
        if let Some(sex) = demographics.sex.as_deref() {
            match Sex::parse(sex) {
                Some(parsed) => case.patient.sex = parsed,
                None => debug!("dropping invalid sex value from demographics: {:?}", sex),
            }
        }
    }
}

fn apply_insurance(case: &mut CaseState, insurance: &InsuranceProfile) {
    fill_string(&mut case.health_plan.payer_name, insurance.payer_name.as_deref());
    fill_string(&mut case.health_plan.payer_id, insurance.payer_id.as_deref());
    fill_string(&mut case.health_plan.plan_name, insurance.plan_name.as_deref());
    fill_string(&mut case.patient.member_id, insurance.member_id.as_deref());
}

fn apply_visits(case: &mut CaseState, records: &[VisitRecord], today: NaiveDate) {
    let mut visits: Vec<VisitInfo> = Vec::with_capacity(records.len());
    for record in records {
        let Some(visit_date) = parse_iso_date(&record.visit_date) else {
            debug!("dropping visit with unparseable date: {:?}", record.visit_date);
            continue;
        };
        let status = record.status.as_deref().and_then(|s| {
            let parsed = VisitStatus::parse(s);
            if parsed.is_none() {
                debug!("dropping invalid visit status: {:?}", s);
            }
            parsed
        });
        let mut visit = VisitInfo::new(visit_date);
        visit.visit_id = record.visit_id.clone();
        visit.visit_type = record.visit_type.clone();
        visit.status = status;
        visit.provider = record.provider.clone();
        visit.location = record.location.clone();
        visit.event_tense = Some(derive_event_tense(visit_date, today));
        visits.push(visit);
    }
    visits.sort_by_key(|v| v.visit_date);

    // Infer the DOS from the visit set when nothing has established one yet.
    if case.timing.dos_date.is_none() && !visits.is_empty() {
        let future_scheduled = visits
            .iter()
            .filter(|v| v.status == Some(VisitStatus::Scheduled) && v.visit_date >= today)
            .max_by_key(|v| v.visit_date);
        let past_completed = visits
            .iter()
            .filter(|v| v.status == Some(VisitStatus::Completed) && v.visit_date < today)
            .max_by_key(|v| v.visit_date);

        let chosen = future_scheduled
            .or(past_completed)
            .or_else(|| visits.iter().max_by_key(|v| v.visit_date));
        if let Some(visit) = chosen {
            case.timing.dos_date = Some(visit.visit_date);
            case.timing.event_tense = derive_event_tense(visit.visit_date, today);
            debug!(
                "inferred dos_date {} from visits ({:?})",
                visit.visit_date, visit.status
            );
        }
    }

    case.timing.related_visits = visits;
}

fn apply_suggestions(case: &mut CaseState, suggestions: &SuggestedUpdates) {
    apply_patient_suggestions(case, &suggestions.patient_updates);
    apply_health_plan_suggestions(case, &suggestions.health_plan_updates);
    apply_timing_suggestions(case, &suggestions.timing_updates);
}

fn suggestion_str<'a>(updates: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    updates
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn apply_patient_suggestions(case: &mut CaseState, updates: &serde_json::Map<String, Value>) {
    if let Some(first_name) = suggestion_str(updates, "first_name") {
        case.patient.first_name = Some(first_name.to_string());
    }
    if let Some(last_name) = suggestion_str(updates, "last_name") {
        case.patient.last_name = Some(last_name.to_string());
    }
    if let Some(member_id) = suggestion_str(updates, "member_id") {
        case.patient.member_id = Some(member_id.to_string());
    }
    if let Some(dob) = suggestion_str(updates, "date_of_birth") {
        match parse_iso_date(dob) {
            Some(parsed) => case.patient.date_of_birth = Some(parsed),
            None => warn!("invalid date_of_birth in interpreter updates: {:?}", dob),
        }
    }
    if let Some(sex) = suggestion_str(updates, "sex") {
        match Sex::parse(sex) {
            Some(parsed) => case.patient.sex = parsed,
            None => warn!("invalid sex value: {:?}", sex),
        }
    }
}

fn apply_health_plan_suggestions(case: &mut CaseState, updates: &serde_json::Map<String, Value>) {
    if let Some(payer_name) = suggestion_str(updates, "payer_name") {
        case.health_plan.payer_name = Some(payer_name.to_string());
    }
    if let Some(payer_id) = suggestion_str(updates, "payer_id") {
        case.health_plan.payer_id = Some(payer_id.to_string());
    }
    if let Some(plan_name) = suggestion_str(updates, "plan_name") {
        case.health_plan.plan_name = Some(plan_name.to_string());
    }
    if let Some(product_type) = suggestion_str(updates, "product_type") {
        match ProductType::parse(product_type) {
            Some(parsed) => case.health_plan.product_type = parsed,
            None => warn!("invalid product_type: {:?}", product_type),
        }
    }
    if let Some(contract_status) = suggestion_str(updates, "contract_status") {
        match ContractStatus::parse(contract_status) {
            Some(parsed) => case.health_plan.contract_status = parsed,
            None => warn!("invalid contract_status: {:?}", contract_status),
        }
    }
}

fn apply_timing_suggestions(case: &mut CaseState, updates: &serde_json::Map<String, Value>) {
    if let Some(dos) = suggestion_str(updates, "dos_date") {
        match parse_iso_date(dos) {
            Some(parsed) => {
                case.timing.dos_date = Some(parsed);
                // Tense is re-derived in derive_fields below.
                case.timing.event_tense = EventTense::Unknown;
            }
            None => warn!("invalid dos_date in interpreter updates: {:?}", dos),
        }
    }
}

/// Derived fields after every update: a set DOS always has an agreeing
/// event tense.
fn derive_fields(case: &mut CaseState, today: NaiveDate) {
    if let Some(dos) = case.timing.dos_date {
        if case.timing.event_tense == EventTense::Unknown {
            case.timing.event_tense = derive_event_tense(dos, today);
        }
    }
}
