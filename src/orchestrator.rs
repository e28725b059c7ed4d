//! Turn orchestrator.
//!
//! Processes one turn per case: load → tools → interpret → coverage check →
//! score (case, then every visit, then recency-weighted aggregation) → plan
//! → persist. Each phase boundary emits a progress event; tool failures are
//! logged and surfaced as error events while the turn continues with
//! whatever fields are available.
//!
//! A case is held for the duration of its turn by a per-case async lock, so
//! concurrent turns on the same case serialize instead of last-writer-wins.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::events::{EventLog, EventStatus, NullSink, ProgressSink, SessionSink};
use crate::interpret::{check_completion, Interpreter};
use crate::models::{
    derive_event_tense, CaseState, EligibilityStatus, ScoreState, SuggestedUpdates, TurnResult,
    UiEvent, VisitInfo,
};
use crate::plan::Planner;
use crate::scoring::aggregate::weighted_average_probability;
use crate::scoring::Scorer;
use crate::store::CaseStore;
use crate::tools::{CoverageResult, ToolSet};
use crate::updater::{apply_update, UpdatePayload, UpdateSource};

/// Visit lookback/lookahead window (±6 months).
const VISIT_WINDOW_DAYS: i64 = 180;
/// Bounded fan-out for per-visit scoring tasks.
const VISIT_SCORING_CONCURRENCY: usize = 8;

pub struct Orchestrator {
    store: Arc<CaseStore>,
    events: Arc<EventLog>,
    scorer: Arc<Scorer>,
    tools: ToolSet,
    interpreter: Arc<dyn Interpreter>,
    planner: Arc<dyn Planner>,
    case_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<CaseStore>,
        events: Arc<EventLog>,
        scorer: Arc<Scorer>,
        tools: ToolSet,
        interpreter: Arc<dyn Interpreter>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        Self {
            store,
            events,
            scorer,
            tools,
            interpreter,
            planner,
            case_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<CaseStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    fn lock_for_case(&self, case_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.case_locks.lock();
        locks
            .entry(case_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Process a single turn (user message or form submission).
    pub async fn process_turn(
        &self,
        case_id: &str,
        ui_event: &UiEvent,
        session_id: Option<i64>,
        patient_id: Option<&str>,
    ) -> Result<TurnResult> {
        info!("Processing turn for case {}", case_id);
        let today = Utc::now().date_naive();

        let case_lock = self.lock_for_case(case_id);
        let _turn_guard = case_lock.lock().await;

        let sink = SessionSink::new(self.events.clone(), session_id);

        // 1. Load or create the case
        let case_pk = self
            .store
            .get_or_create_case(case_id, session_id)
            .context("failed to get or create case")?;
        let mut case_state = self
            .store
            .get_case_state(case_pk)
            .context("failed to load case state")?
            .unwrap_or_default();

        // 2. Fresh patient data when a patient id is on the turn
        if let Some(patient_id) = patient_id {
            sink.process(
                "patient_loading",
                EventStatus::InProgress,
                "Loading patient record...",
                None,
            );
            case_state = self.load_patient_data(case_state, patient_id, &sink, today).await;
        }

        // 3. Interpret the utterance into suggestions and apply them
        sink.process(
            "interpretation",
            EventStatus::InProgress,
            "Interpreting user input - extracting information from message...",
            None,
        );
        let suggestions = match self.interpreter.interpret(&case_state, ui_event, case_pk).await {
            Ok(suggestions) => suggestions,
            Err(e) => {
                warn!("interpreter failed, continuing with empty suggestions: {}", e);
                SuggestedUpdates::default()
            }
        };
        case_state = apply_update(
            case_state,
            UpdateSource::Interpreter,
            &UpdatePayload::Suggestions(suggestions),
            today,
        );

        let mut completion = check_completion(&case_state);
        let mut interpretation_message = "Interpretation complete".to_string();
        if !completion.missing_fields.is_empty() {
            interpretation_message = format!(
                "Interpretation complete - Missing fields: {}",
                completion.missing_fields.join(", ")
            );
        }
        sink.process(
            "interpretation",
            EventStatus::Complete,
            &interpretation_message,
            None,
        );

        // 4. Coverage check (reuses the cached transaction when possible)
        if let Some(result) = self.perform_coverage_check(&case_state, &sink, today).await {
            case_state = apply_update(
                case_state,
                UpdateSource::Payer,
                &UpdatePayload::Coverage(result),
                today,
            );
            completion = check_completion(&case_state);
        }

        // 5. Primary scoring
        sink.process(
            "scoring",
            EventStatus::InProgress,
            "Scoring engine initiated - calculating eligibility probability...",
            None,
        );
        let mut score_state = self.scorer.score(&case_state, today, &sink);

        // 6. Per-visit scoring with bounded fan-out; each task sees a copy
        // of the case.
        if !case_state.timing.related_visits.is_empty() {
            let visits = case_state.timing.related_visits.clone();
            let scored = self.score_visits(&case_state, visits, today).await;
            case_state.timing.related_visits = scored;
        }

        // 7. Recency-weighted aggregation replaces the headline probability
        if let Some(weighted) =
            weighted_average_probability(&case_state.timing.related_visits, today)
        {
            info!(
                "Updated case-level probability to weighted average {:.2}% from {} visits",
                weighted * 100.0,
                case_state.timing.related_visits.len()
            );
            score_state.base_probability = weighted;
        }

        let visits_summary: Vec<_> = case_state
            .timing
            .related_visits
            .iter()
            .map(|v| {
                json!({
                    "visit_date": v.visit_date,
                    "visit_type": v.visit_type,
                    "status": v.status,
                    "probability": v.eligibility_probability,
                    "eligibility_status": v.eligibility_status,
                    "event_tense": v.event_tense,
                })
            })
            .collect();
        sink.process(
            "scoring",
            EventStatus::Complete,
            &format!(
                "Scoring complete - Overall Likelihood: {:.1}%",
                score_state.base_probability * 100.0
            ),
            Some(json!({
                "overall_probability": score_state.base_probability,
                "confidence": score_state.base_confidence,
                "visits": visits_summary,
            })),
        );

        // 8. Plan questions and summary
        sink.process(
            "planning",
            EventStatus::InProgress,
            "Planning phase initiated - generating questions and improvement plan...",
            None,
        );
        let plan = self
            .planner
            .plan(&case_state, &score_state, &completion, case_pk)
            .await;
        sink.process(
            "planning",
            EventStatus::Complete,
            &format!(
                "Planning complete\nGenerated {} question(s)\nCreated {} improvement action(s)",
                plan.next_questions.len(),
                plan.improvement_plan.len()
            ),
            None,
        );

        // 9. Persist the snapshot and the new score run
        self.store
            .update_case_state(case_pk, &case_state)
            .context("failed to persist case state")?;
        let turn_id = self
            .store
            .create_turn(case_pk, &plan)
            .context("failed to persist turn")?;
        self.store
            .create_score_run(
                case_pk,
                Some(turn_id),
                &score_state,
                &json!({
                    "event_type": ui_event.event_type,
                    "patient_id": patient_id,
                }),
            )
            .context("failed to persist score run")?;

        Ok(TurnResult {
            case_id: case_id.to_string(),
            case_pk,
            status: "COMPLETE".to_string(),
            case_state,
            score_state,
            next_questions: plan.next_questions,
            improvement_plan: plan.improvement_plan,
            presentation_summary: plan.presentation_summary,
            completion,
        })
    }

    /// Fetch demographics, insurance, and visits; apply through the updater
    /// with TOOL precedence. Failures degrade to error events.
    async fn load_patient_data(
        &self,
        mut case_state: CaseState,
        patient_id: &str,
        sink: &dyn ProgressSink,
        today: NaiveDate,
    ) -> CaseState {
        match self.tools.demographics.fetch(patient_id).await {
            Ok(Some(demographics)) => {
                let mut summary = format!(
                    "Retrieved demographics: {} {}",
                    demographics.first_name.as_deref().unwrap_or(""),
                    demographics.last_name.as_deref().unwrap_or("")
                );
                if let Some(dob) = demographics.date_of_birth.as_deref() {
                    summary.push_str(&format!(", DOB: {}", dob));
                }
                if let Some(member_id) = demographics.member_id.as_deref() {
                    summary.push_str(&format!(", Member ID: {}", member_id));
                }
                let mut metadata = serde_json::to_value(&demographics).unwrap_or_default();
                metadata["data_type"] = json!("demographics");
                sink.thinking("patient_loading", &summary, Some(metadata));

                case_state = apply_update(
                    case_state,
                    UpdateSource::Tool,
                    &UpdatePayload::Demographics(demographics),
                    today,
                );
            }
            Ok(None) => {
                sink.thinking("patient_loading", "No demographics on file", None);
            }
            Err(e) => {
                warn!("Failed to load demographics for {}: {}", patient_id, e);
                sink.process(
                    "patient_loading",
                    EventStatus::Error,
                    &format!("Failed to load demographics: {}", e),
                    None,
                );
            }
        }

        match self.tools.insurance.fetch(patient_id).await {
            Ok(Some(insurance)) => {
                let mut summary = format!(
                    "Retrieved insurance: {}",
                    insurance.payer_name.as_deref().unwrap_or("(unknown payer)")
                );
                if let Some(plan) = insurance.plan_name.as_deref() {
                    summary.push_str(&format!(", Plan: {}", plan));
                }
                if let Some(member_id) = insurance.member_id.as_deref() {
                    summary.push_str(&format!(", Member ID: {}", member_id));
                }
                let mut metadata = serde_json::to_value(&insurance).unwrap_or_default();
                metadata["data_type"] = json!("insurance");
                sink.thinking("patient_loading", &summary, Some(metadata));

                case_state = apply_update(
                    case_state,
                    UpdateSource::Tool,
                    &UpdatePayload::Insurance(insurance),
                    today,
                );
            }
            Ok(None) => {
                sink.thinking("patient_loading", "No insurance on file", None);
            }
            Err(e) => {
                warn!("Failed to load insurance for {}: {}", patient_id, e);
                sink.process(
                    "patient_loading",
                    EventStatus::Error,
                    &format!("Failed to load insurance: {}", e),
                    None,
                );
            }
        }

        match self
            .tools
            .visits
            .fetch(patient_id, VISIT_WINDOW_DAYS, VISIT_WINDOW_DAYS)
            .await
        {
            Ok(visits) => {
                case_state = apply_update(
                    case_state,
                    UpdateSource::Tool,
                    &UpdatePayload::Visits(visits),
                    today,
                );

                let upcoming = case_state
                    .timing
                    .related_visits
                    .iter()
                    .filter(|v| v.visit_date >= today)
                    .count();
                let past = case_state.timing.related_visits.len() - upcoming;
                sink.thinking(
                    "patient_loading",
                    &format!(
                        "Retrieved {} visit(s)/appointment(s) ({} upcoming, {} past)",
                        case_state.timing.related_visits.len(),
                        upcoming,
                        past
                    ),
                    Some(json!({
                        "data_type": "visits",
                        "visits": case_state.timing.related_visits.iter().map(|v| json!({
                            "visit_date": v.visit_date,
                            "visit_type": v.visit_type,
                            "status": v.status,
                        })).collect::<Vec<_>>(),
                    })),
                );
            }
            Err(e) => {
                warn!("Failed to load visits for {}: {}", patient_id, e);
                sink.process(
                    "patient_loading",
                    EventStatus::Error,
                    &format!("Failed to load visits: {}", e),
                    None,
                );
            }
        }

        sink.process(
            "patient_loading",
            EventStatus::Complete,
            &format!(
                "Patient details loaded - Found {} visits/appointments",
                case_state.timing.related_visits.len()
            ),
            Some(json!({
                "patient_summary": {
                    "name": format!(
                        "{} {}",
                        case_state.patient.first_name.as_deref().unwrap_or(""),
                        case_state.patient.last_name.as_deref().unwrap_or("")
                    ),
                    "dob": case_state.patient.date_of_birth,
                    "insurance": case_state.health_plan.payer_name,
                    "member_id": case_state.patient.member_id,
                },
            })),
        );

        case_state
    }

    /// Run the coverage transaction if insurance details are on the case;
    /// a prior result for the same member is reused verbatim.
    async fn perform_coverage_check(
        &self,
        case_state: &CaseState,
        sink: &dyn ProgressSink,
        today: NaiveDate,
    ) -> Option<CoverageResult> {
        let member_id = case_state.patient.member_id.as_deref()?;
        let payer_name = case_state.health_plan.payer_name.as_deref()?;

        if case_state.eligibility_check.checked {
            if let Some(raw) = case_state.eligibility_check.result_raw.as_ref() {
                if let Ok(cached) = serde_json::from_value::<CoverageResult>(raw.clone()) {
                    if cached.member_id.as_deref() == Some(member_id) {
                        let active = crate::updater::first_active_window(
                            &cached.eligibility_windows,
                            today,
                        );
                        let status = if active.is_some() {
                            EligibilityStatus::Yes
                        } else {
                            EligibilityStatus::No
                        };
                        sink.thinking(
                            "patient_loading",
                            &format!("Eligibility check (cached): {}", status.as_str()),
                            Some(json!({
                                "data_type": "eligibility",
                                "status": status.as_str(),
                                "coverage_start": active.map(|w| w.effective_date.clone()),
                                "coverage_end": active.map(|w| w.end_date.clone()),
                                "member_id": member_id,
                                "cached": true,
                            })),
                        );
                        sink.process(
                            "eligibility_check",
                            EventStatus::Complete,
                            &format!(
                                "Using cached eligibility check for member {}: {}",
                                member_id,
                                status.as_str()
                            ),
                            Some(json!({ "status": status.as_str(), "cached": true })),
                        );
                        return Some(cached);
                    }
                }
            }
        }

        sink.process(
            "eligibility_check",
            EventStatus::InProgress,
            "Checking eligibility with payer...",
            None,
        );

        match self.tools.coverage.check(member_id, payer_name).await {
            Ok(result) => {
                let active = crate::updater::first_active_window(&result.eligibility_windows, today);
                let (status, summary) = match active {
                    Some(window) => (
                        EligibilityStatus::Yes,
                        format!(
                            "Member {} is ELIGIBLE. Coverage period: {} to {}.",
                            member_id, window.effective_date, window.end_date
                        ),
                    ),
                    None => (
                        EligibilityStatus::No,
                        format!("Member {} is NOT ELIGIBLE.", member_id),
                    ),
                };
                sink.thinking(
                    "patient_loading",
                    &format!("Eligibility check: {}", status.as_str()),
                    Some(json!({
                        "data_type": "eligibility",
                        "status": status.as_str(),
                        "coverage_start": active.map(|w| w.effective_date.clone()),
                        "coverage_end": active.map(|w| w.end_date.clone()),
                        "member_id": member_id,
                        "payer_name": payer_name,
                        "cached": false,
                    })),
                );
                sink.process(
                    "eligibility_check",
                    EventStatus::Complete,
                    &format!("Eligibility check complete: {}. {}", status.as_str(), summary),
                    Some(json!({
                        "status": status.as_str(),
                        "coverage_start": active.map(|w| w.effective_date.clone()),
                        "coverage_end": active.map(|w| w.end_date.clone()),
                        "member_id": member_id,
                        "payer_name": payer_name,
                    })),
                );
                Some(result)
            }
            Err(e) => {
                warn!("Failed to perform eligibility check: {}", e);
                sink.process(
                    "eligibility_check",
                    EventStatus::Error,
                    &format!("Eligibility check failed: {}", e),
                    None,
                );
                None
            }
        }
    }

    /// Score every visit independently under the shared coverage
    /// determination. Order of the visit list is preserved.
    async fn score_visits(
        &self,
        case_state: &CaseState,
        visits: Vec<VisitInfo>,
        today: NaiveDate,
    ) -> Vec<VisitInfo> {
        stream::iter(visits.into_iter().map(|visit| {
            let scorer = self.scorer.clone();
            let case = case_state.clone();
            let fallback = visit.clone();
            async move {
                match tokio::task::spawn_blocking(move || score_visit(&scorer, &case, visit, today))
                    .await
                {
                    Ok(scored) => scored,
                    Err(e) => {
                        warn!("visit scoring task failed: {}", e);
                        fallback
                    }
                }
            }
        }))
        .buffered(VISIT_SCORING_CONCURRENCY)
        .collect()
        .await
    }
}

/// Visit-level eligibility status from the coverage window bounds.
pub fn visit_window_status(
    visit_date: NaiveDate,
    coverage_start: Option<NaiveDate>,
    coverage_end: Option<NaiveDate>,
) -> EligibilityStatus {
    match (coverage_start, coverage_end) {
        (Some(start), Some(end)) => {
            if start <= visit_date && visit_date <= end {
                EligibilityStatus::Yes
            } else {
                EligibilityStatus::No
            }
        }
        _ => EligibilityStatus::NotEstablished,
    }
}

/// Score one visit against a copy of the case pinned to the visit's date.
fn score_visit(
    scorer: &Scorer,
    case_state: &CaseState,
    mut visit: VisitInfo,
    today: NaiveDate,
) -> VisitInfo {
    let tense = derive_event_tense(visit.visit_date, today);
    visit.event_tense = Some(tense);
    visit.eligibility_status = Some(visit_window_status(
        visit.visit_date,
        case_state.eligibility_truth.coverage_window_start,
        case_state.eligibility_truth.coverage_window_end,
    ));

    let mut temp = case_state.clone();
    temp.timing.dos_date = Some(visit.visit_date);
    temp.timing.event_tense = tense;

    let score: ScoreState = scorer.score(&temp, today, &NullSink);
    visit.eligibility_probability = Some(score.base_probability);
    visit.score_state = Some(Box::new(score));
    visit
}
