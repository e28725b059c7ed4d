//! End-to-end turn-pipeline integration tests.
//!
//! Drives the orchestrator directly against in-memory stores and the
//! deterministic scenario tools, the same wiring the binary uses.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use parking_lot::Mutex;

use paysight_backend::events::EventLog;
use paysight_backend::interpret::Interpreter;
use paysight_backend::models::{
    CaseState, EligibilityStatus, EventTense, ProductType, SuggestedUpdates, TurnResult, UiEvent,
};
use paysight_backend::orchestrator::Orchestrator;
use paysight_backend::plan::TemplatePlanner;
use paysight_backend::propensity::PropensityStore;
use paysight_backend::scoring::aggregate::weighted_average_probability;
use paysight_backend::scoring::Scorer;
use paysight_backend::store::CaseStore;
use paysight_backend::tools::ToolSet;

/// Interpreter double that replays a scripted queue of suggestion sets;
/// empty once the queue drains.
struct ScriptedInterpreter {
    queue: Mutex<VecDeque<SuggestedUpdates>>,
}

impl ScriptedInterpreter {
    fn new(scripted: Vec<SuggestedUpdates>) -> Self {
        Self {
            queue: Mutex::new(scripted.into()),
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn interpret(
        &self,
        _case: &CaseState,
        _event: &UiEvent,
        _case_pk: i64,
    ) -> Result<SuggestedUpdates> {
        Ok(self.queue.lock().pop_front().unwrap_or_default())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    _tmp: tempfile::TempDir,
}

fn harness(interpreter: Arc<dyn Interpreter>) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let events_db = tmp.path().join("events.db");

    let store = Arc::new(CaseStore::new(":memory:").unwrap());
    let events = Arc::new(EventLog::new(events_db.to_str().unwrap()).unwrap());
    let propensity = Arc::new(PropensityStore::new(":memory:").unwrap());
    let scorer = Arc::new(Scorer::new(propensity));

    let orchestrator = Orchestrator::new(
        store,
        events,
        scorer,
        ToolSet::scenario_backed(),
        interpreter,
        Arc::new(TemplatePlanner),
    );
    Harness {
        orchestrator,
        _tmp: tmp,
    }
}

fn suggestions(json: serde_json::Value) -> SuggestedUpdates {
    serde_json::from_value(json).unwrap()
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn assert_distribution_valid(result: &TurnResult) {
    let dist = &result.score_state.state_probabilities;
    assert!(
        (dist.sum() - 1.0).abs() < 1e-6,
        "state probabilities must sum to 1, got {}",
        dist.sum()
    );
    for status in EligibilityStatus::ALL {
        let p = dist.get(status);
        assert!(p.is_finite() && (0.0..=1.0).contains(&p), "{:?}: {}", status, p);
    }
}

const EPS: f64 = 1e-9;

#[tokio::test]
async fn test_active_coverage_future_dos() {
    let h = harness(Arc::new(ScriptedInterpreter::empty()));
    let result = h
        .orchestrator
        .process_turn(
            "case-active",
            &UiEvent::user_message("check eligibility for MRN100"),
            None,
            Some("MRN100"),
        )
        .await
        .unwrap();

    assert_distribution_valid(&result);
    let case = &result.case_state;

    // Payer evidence: active window, YES, high strength, clearinghouse check
    assert_eq!(case.eligibility_truth.status, EligibilityStatus::Yes);
    assert!(case.eligibility_check.checked);
    assert!(case.eligibility_truth.coverage_window_start.is_some());
    assert!(case.eligibility_truth.coverage_window_end.is_some());
    assert_eq!(result.score_state.base_source, "direct_evidence");
    assert!((result.score_state.base_confidence - 1.0).abs() < EPS);

    // DOS inferred from the most-future scheduled visit (today + 30)
    assert_eq!(case.timing.dos_date, Some(today() + Duration::days(30)));
    assert_eq!(case.timing.event_tense, EventTense::Future);
    // Plan name carries a PPO marker, so the payer path pins COMMERCIAL
    assert_eq!(case.health_plan.product_type, ProductType::Commercial);

    // Case-level distribution: YES reduced by amplified coverage loss and
    // the payer/provider error drain
    let loss = 0.05 * (0.001f64 * 30.0).exp();
    let errors = (0.05 + 0.03) * (0.0005f64 * 30.0).exp();
    let expected_yes = (1.0 - loss) * (1.0 - errors);
    assert!(
        (result.score_state.state_probabilities.yes - expected_yes).abs() < EPS,
        "got {}, expected {}",
        result.score_state.state_probabilities.yes,
        expected_yes
    );

    // Every visit inside the coverage window scores YES with a probability
    let visits = &case.timing.related_visits;
    assert_eq!(visits.len(), 3);
    for visit in visits {
        assert_eq!(visit.eligibility_status, Some(EligibilityStatus::Yes));
        assert!(visit.eligibility_probability.is_some());
        assert!(visit.score_state.is_some());
    }

    // Headline probability is the recency-weighted mean over the visits
    let expected_weighted = weighted_average_probability(visits, today()).unwrap();
    assert!((result.score_state.base_probability - expected_weighted).abs() < EPS);
}

#[tokio::test]
async fn test_no_active_window() {
    let h = harness(Arc::new(ScriptedInterpreter::empty()));
    let result = h
        .orchestrator
        .process_turn(
            "case-noactive",
            &UiEvent::user_message("check MRN200"),
            None,
            Some("MRN200"),
        )
        .await
        .unwrap();

    assert_distribution_valid(&result);
    let case = &result.case_state;

    assert_eq!(case.eligibility_truth.status, EligibilityStatus::No);
    assert!(case.eligibility_truth.coverage_window_start.is_none());
    assert!(case.eligibility_truth.coverage_window_end.is_none());
    assert_eq!(result.score_state.base_source, "direct_evidence");

    // No mass to move out of YES: it stays at zero through the combiner
    assert!(result.score_state.state_probabilities.yes.abs() < EPS);
    assert!(result.score_state.base_probability.abs() < EPS);

    // Without window bounds, visits cannot be placed
    for visit in &case.timing.related_visits {
        assert_eq!(
            visit.eligibility_status,
            Some(EligibilityStatus::NotEstablished)
        );
    }
}

#[tokio::test]
async fn test_expired_active_status_window_is_not_eligible() {
    // Window marked "active" but ended 30 days ago must not count.
    let h = harness(Arc::new(ScriptedInterpreter::empty()));
    let result = h
        .orchestrator
        .process_turn(
            "case-expired",
            &UiEvent::user_message("check MRN202"),
            None,
            Some("MRN202"),
        )
        .await
        .unwrap();

    assert_eq!(result.case_state.eligibility_truth.status, EligibilityStatus::No);
    assert!(result.case_state.eligibility_check.checked);
}

#[tokio::test]
async fn test_retro_denial_decays_to_zero_past_sixty_days() {
    // MRN210 has active coverage and no visits; the user pins the DOS to 90
    // days ago.
    let dos = today() - Duration::days(90);
    let interpreter = ScriptedInterpreter::new(vec![suggestions(serde_json::json!({
        "timing_updates": { "dos_date": dos.format("%Y-%m-%d").to_string() }
    }))]);

    let h = harness(Arc::new(interpreter));
    let result = h
        .orchestrator
        .process_turn(
            "case-retro",
            &UiEvent::user_message("the service already happened"),
            None,
            Some("MRN210"),
        )
        .await
        .unwrap();

    assert_distribution_valid(&result);
    let case = &result.case_state;
    assert_eq!(case.timing.dos_date, Some(dos));
    assert_eq!(case.timing.event_tense, EventTense::Past);
    assert_eq!(case.eligibility_truth.status, EligibilityStatus::Yes);

    // Retrospective denial is fully decayed at t = 90
    assert_eq!(result.score_state.adjusted_risks.retrospective_denial, Some(0.0));

    // Only the decayed error mass pulls YES below 1
    let errors = (0.05 + 0.03) * (-0.001f64 * 90.0).exp();
    let expected_yes = 1.0 - errors;
    assert!(
        (result.score_state.state_probabilities.yes - expected_yes).abs() < EPS,
        "got {}, expected {}",
        result.score_state.state_probabilities.yes,
        expected_yes
    );
    // No visits: no aggregation, headline equals the case-level YES mass
    assert!(case.timing.related_visits.is_empty());
    assert!((result.score_state.base_probability - expected_yes).abs() < EPS);
}

#[tokio::test]
async fn test_interpreter_preserves_payer_truth_across_turns() {
    let interpreter = ScriptedInterpreter::new(vec![
        SuggestedUpdates::default(),
        suggestions(serde_json::json!({
            "health_plan_updates": { "product_type": "MEDICARE" }
        })),
    ]);
    let h = harness(Arc::new(interpreter));

    let first = h
        .orchestrator
        .process_turn(
            "case-preserve",
            &UiEvent::user_message("check MRN100"),
            Some(1),
            Some("MRN100"),
        )
        .await
        .unwrap();
    let truth_before = first.case_state.eligibility_truth.clone();
    assert_eq!(truth_before.status, EligibilityStatus::Yes);

    // Second turn: no patient load, user reclassifies the product type.
    let second = h
        .orchestrator
        .process_turn(
            "case-preserve",
            &UiEvent::user_message("the product type is MEDICARE"),
            Some(1),
            None,
        )
        .await
        .unwrap();

    let case = &second.case_state;
    assert_eq!(case.health_plan.product_type, ProductType::Medicare);
    assert_eq!(case.eligibility_truth.status, truth_before.status);
    assert_eq!(
        case.eligibility_truth.coverage_window_start,
        truth_before.coverage_window_start
    );
    assert_eq!(
        case.eligibility_truth.coverage_window_end,
        truth_before.coverage_window_end
    );
    assert_eq!(
        case.eligibility_truth.evidence_strength,
        truth_before.evidence_strength
    );

    // The cached coverage transaction was reused rather than re-run.
    assert!(case.eligibility_check.checked);

    // Both turns recorded a score run; the latest is exposed.
    let pk = second.case_pk;
    assert_eq!(h.orchestrator.store().score_run_count(pk).unwrap(), 2);
    let latest = h.orchestrator.store().latest_score(pk).unwrap().unwrap();
    assert!((latest.base_probability - second.score_state.base_probability).abs() < EPS);
}

#[tokio::test]
async fn test_event_stream_grouping_across_turns() {
    let h = harness(Arc::new(ScriptedInterpreter::empty()));
    let session = Some(42);

    h.orchestrator
        .process_turn("case-events", &UiEvent::user_message("check MRN100"), session, Some("MRN100"))
        .await
        .unwrap();
    h.orchestrator
        .process_turn("case-events", &UiEvent::user_message("anything new?"), session, Some("MRN100"))
        .await
        .unwrap();

    let grouped = h.orchestrator.events().grouped_process_events(42).unwrap();
    assert!(!grouped.is_empty());

    // All patient_loading thinking messages ride on the most recent
    // patient_loading process event; earlier ones carry none.
    let loading_events: Vec<_> = grouped.iter().filter(|e| e.phase == "patient_loading").collect();
    assert!(loading_events.len() >= 2);
    let (with_thinking, without_thinking): (Vec<&&_>, Vec<&&_>) = loading_events
        .iter()
        .partition(|e| !e.thinking_messages.is_empty());
    assert_eq!(with_thinking.len(), 1);
    assert!(!without_thinking.is_empty());
    let last_loading = loading_events.last().unwrap();
    assert!(!last_loading.thinking_messages.is_empty());

    // Pipeline order within each turn: interpretation before scoring before
    // planning.
    let phase_order: Vec<&str> = grouped.iter().map(|e| e.phase.as_str()).collect();
    let first_interpretation = phase_order.iter().position(|p| *p == "interpretation").unwrap();
    let first_scoring = phase_order.iter().position(|p| *p == "scoring").unwrap();
    let first_planning = phase_order.iter().position(|p| *p == "planning").unwrap();
    assert!(first_interpretation < first_scoring);
    assert!(first_scoring < first_planning);
}

#[tokio::test]
async fn test_tool_failure_degrades_gracefully() {
    // MRN500: the demographics system errors out; the turn still completes
    // with the remaining fields and surfaces an error event.
    let h = harness(Arc::new(ScriptedInterpreter::empty()));
    let result = h
        .orchestrator
        .process_turn(
            "case-degraded",
            &UiEvent::user_message("check MRN500"),
            Some(9),
            Some("MRN500"),
        )
        .await
        .unwrap();

    assert_distribution_valid(&result);
    // Insurance and coverage still landed
    assert_eq!(result.case_state.eligibility_truth.status, EligibilityStatus::Yes);
    assert!(result.case_state.patient.first_name.is_none());

    let raw = h.orchestrator.events().raw_events(9).unwrap();
    let error_event = raw.iter().any(|(bucket, payload)| {
        bucket == "ELIGIBILITY_PROCESS"
            && payload["phase"] == "patient_loading"
            && payload["status"] == "error"
    });
    assert!(error_event, "expected an error-status patient_loading event");
}

#[tokio::test]
async fn test_missing_data_yields_questions() {
    // MRN207: no insurance on file → no coverage check is possible.
    let h = harness(Arc::new(ScriptedInterpreter::empty()));
    let result = h
        .orchestrator
        .process_turn(
            "case-missing",
            &UiEvent::user_message("check MRN207"),
            None,
            Some("MRN207"),
        )
        .await
        .unwrap();

    assert_distribution_valid(&result);
    assert!(!result.case_state.eligibility_check.checked);
    assert_eq!(result.score_state.base_source, "historical_fallback");
    assert!(!result.completion.missing_fields.is_empty());
    assert!(!result.next_questions.is_empty());
    assert!(!result.presentation_summary.is_empty());
}

#[tokio::test]
async fn test_turn_is_idempotent_against_stable_state() {
    // Same case, same inputs, same day: the second turn reproduces the same
    // score from the cached coverage determination.
    let h = harness(Arc::new(ScriptedInterpreter::empty()));
    let first = h
        .orchestrator
        .process_turn("case-idem", &UiEvent::user_message("check MRN100"), None, Some("MRN100"))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .process_turn("case-idem", &UiEvent::user_message("check MRN100"), None, Some("MRN100"))
        .await
        .unwrap();

    assert!(
        (first.score_state.base_probability - second.score_state.base_probability).abs() < EPS
    );
    assert_eq!(
        first.score_state.state_probabilities,
        second.score_state.state_probabilities
    );
}
