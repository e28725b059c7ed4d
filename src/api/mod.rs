//! HTTP surface for the eligibility pipeline.
//!
//! Endpoints:
//! - `POST /api/eligibility/session/start`
//! - `POST /api/eligibility/cases/:case_id/turn`
//! - `GET  /api/eligibility/cases/:case_id/view`
//! - `GET  /api/eligibility/cases/:case_id/process-events`
//! - `GET  /health`

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::events::ProcessEventView;
use crate::models::{TurnResult, UiEvent};
use crate::orchestrator::Orchestrator;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/session/start", post(start_session))
        .route("/cases/:case_id/turn", post(submit_turn))
        .route("/cases/:case_id/view", get(get_case_view))
        .route("/cases/:case_id/process-events", get(get_process_events))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/eligibility", api)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SessionStartRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStartResponse {
    pub session_id: i64,
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<SessionStartRequest>,
) -> Result<Json<SessionStartResponse>, StatusCode> {
    let session_id = state
        .orchestrator
        .store()
        .create_session(&request.user_id)
        .map_err(|e| {
            error!("Failed to create session: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(SessionStartResponse { session_id }))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Pull an MRN token out of a free-text message ("check MRN100 for me").
pub fn extract_mrn(message: &str) -> Option<String> {
    static MRN_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = MRN_RE.get_or_init(|| Regex::new(r"(?i)\bMRN\s*(\w+)").expect("valid MRN regex"));
    re.captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("MRN{}", m.as_str()))
}

async fn submit_turn(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
    Json(ui_event): Json<UiEvent>,
) -> Result<Json<TurnResult>, StatusCode> {
    let session_id = header_value(&headers, "X-Session-ID").and_then(|v| v.parse::<i64>().ok());

    // Patient id from the header, else extracted from the message text.
    let patient_id = header_value(&headers, "X-Patient-ID").or_else(|| {
        if ui_event.event_type == "user_message" {
            ui_event.message_text().and_then(extract_mrn)
        } else {
            None
        }
    });

    // Transcript: record the user message before processing.
    if let (Some(session_id), "user_message") = (session_id, ui_event.event_type.as_str()) {
        let payload = json!({
            "role": "user",
            "content": ui_event.message_text().unwrap_or(""),
            "timestamp": ui_event.timestamp.clone().unwrap_or_else(|| Utc::now().to_rfc3339()),
        });
        if let Err(e) = state.orchestrator.events().append_output(session_id, &payload) {
            warn!("Failed to store user message: {}", e);
        }
    }

    let result = state
        .orchestrator
        .process_turn(&case_id, &ui_event, session_id, patient_id.as_deref())
        .await
        .map_err(|e| {
            error!("Turn failed for case {}: {:#}", case_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    // Transcript: record the assistant response for replay.
    if let Some(session_id) = session_id {
        let payload = json!({
            "role": "assistant",
            "content": &result.presentation_summary,
            "presentation_summary": &result.presentation_summary,
            "next_questions": &result.next_questions,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = state.orchestrator.events().append_output(session_id, &payload) {
            warn!("Failed to store assistant response: {}", e);
        }
    }

    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct CaseViewResponse {
    pub case_id: String,
    pub case_pk: i64,
    pub session_id: Option<i64>,
    pub status: String,
    pub case_state: Value,
    pub score_state: Option<Value>,
    pub next_questions: Value,
    pub improvement_plan: Value,
    pub presentation_summary: String,
}

async fn get_case_view(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> Result<Json<CaseViewResponse>, StatusCode> {
    let store = state.orchestrator.store();

    let case_pk = store
        .find_case_pk(&case_id)
        .map_err(|e| {
            error!("Failed to look up case {}: {}", case_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let record = store
        .get_case(case_pk)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let case_state = store
        .get_case_state(case_pk)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let latest_score = store
        .latest_score(case_pk)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let latest_plan = store
        .latest_plan(case_pk)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(CaseViewResponse {
        case_id,
        case_pk,
        session_id: record.session_id,
        status: record.status,
        case_state: case_state
            .map(|s| serde_json::to_value(s).unwrap_or_default())
            .unwrap_or_else(|| json!({})),
        score_state: latest_score.map(|s| serde_json::to_value(s).unwrap_or_default()),
        next_questions: latest_plan
            .as_ref()
            .map(|p| serde_json::to_value(&p.next_questions).unwrap_or_default())
            .unwrap_or_else(|| json!([])),
        improvement_plan: latest_plan
            .as_ref()
            .map(|p| serde_json::to_value(&p.improvement_plan).unwrap_or_default())
            .unwrap_or_else(|| json!([])),
        presentation_summary: latest_plan
            .map(|p| p.presentation_summary)
            .unwrap_or_default(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ProcessEventsResponse {
    pub events: Vec<ProcessEventView>,
}

async fn get_process_events(
    State(state): State<AppState>,
    Path(_case_id): Path<String>,
    headers: HeaderMap,
) -> Json<ProcessEventsResponse> {
    let Some(session_id) =
        header_value(&headers, "X-Session-ID").and_then(|v| v.parse::<i64>().ok())
    else {
        return Json(ProcessEventsResponse { events: vec![] });
    };

    match state.orchestrator.events().grouped_process_events(session_id) {
        Ok(events) => Json(ProcessEventsResponse { events }),
        Err(e) => {
            error!("Failed to get process events: {}", e);
            Json(ProcessEventsResponse { events: vec![] })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_mrn_variants() {
        assert_eq!(extract_mrn("check MRN100 please"), Some("MRN100".to_string()));
        assert_eq!(extract_mrn("for patient mrn 205"), Some("MRN205".to_string()));
        assert_eq!(
            extract_mrn("eligibility for MRN135 on 2026-09-01"),
            Some("MRN135".to_string())
        );
        assert_eq!(extract_mrn("no identifier here"), None);
    }
}
