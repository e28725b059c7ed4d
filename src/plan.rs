//! Planner seam.
//!
//! The planner is an external collaborator that turns the case + score into
//! next questions, an improvement plan, and a presentation summary. When the
//! external service is unreachable or returns garbage, templated fallbacks
//! keep the envelope populated: one question per missing field, and a
//! summary sentence derived from the latest known payment probability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::interpret::hash_prompt;
use crate::models::{
    CaseState, CompletionStatus, ImprovementAction, NextQuestion, PlanResponse, ScoreState,
};
use crate::store::CaseStore;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        case: &CaseState,
        score: &ScoreState,
        completion: &CompletionStatus,
        case_pk: i64,
    ) -> PlanResponse;
}

/// Deterministic template planner; also serves as the fallback layer for the
/// HTTP planner.
pub struct TemplatePlanner;

impl TemplatePlanner {
    pub fn generate(score: &ScoreState, completion: &CompletionStatus) -> PlanResponse {
        let missing = &completion.missing_fields;
        PlanResponse {
            next_questions: fallback_questions(missing),
            improvement_plan: fallback_improvements(missing),
            presentation_summary: fallback_summary(score, missing),
        }
    }
}

#[async_trait]
impl Planner for TemplatePlanner {
    async fn plan(
        &self,
        _case: &CaseState,
        score: &ScoreState,
        completion: &CompletionStatus,
        _case_pk: i64,
    ) -> PlanResponse {
        Self::generate(score, completion)
    }
}

/// HTTP adapter to the external LLM planner service.
pub struct HttpPlanner {
    client: reqwest::Client,
    url: String,
    store: Arc<CaseStore>,
}

impl HttpPlanner {
    pub fn new(url: String, store: Arc<CaseStore>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, store })
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(
        &self,
        case: &CaseState,
        score: &ScoreState,
        completion: &CompletionStatus,
        case_pk: i64,
    ) -> PlanResponse {
        let request_body = serde_json::json!({
            "case_state": case,
            "score_state": score,
            "completion": completion,
        });
        let prompt_hash = hash_prompt(&request_body);

        let body: Option<Value> = match self.client.post(&self.url).json(&request_body).send().await
        {
            Ok(resp) => resp.json().await.ok(),
            Err(e) => {
                warn!("planner request failed, using template fallback: {}", e);
                None
            }
        };

        let Some(body) = body else {
            return TemplatePlanner::generate(score, completion);
        };

        if let Err(e) = self
            .store
            .log_llm_call(case_pk, None, "PLANNER", &prompt_hash, &body)
        {
            warn!("failed to record planner call: {}", e);
        }

        let mut plan = match serde_json::from_value::<PlanResponse>(body) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("malformed planner response, using template fallback: {}", e);
                return TemplatePlanner::generate(score, completion);
            }
        };

        // Missing fields must always surface as questions.
        if !completion.missing_fields.is_empty() && plan.next_questions.is_empty() {
            plan.next_questions = fallback_questions(&completion.missing_fields);
            if plan.improvement_plan.is_empty() {
                plan.improvement_plan = fallback_improvements(&completion.missing_fields);
            }
        }
        if plan.presentation_summary.trim().is_empty() {
            plan.presentation_summary = fallback_summary(score, &completion.missing_fields);
        }

        plan
    }
}

fn question_text(field: &str) -> String {
    let leaf = field.rsplit('.').next().unwrap_or(field);
    match leaf {
        "payer_name" => "What is the insurance payer or insurance company name?".to_string(),
        "payer_id" => "What is the payer ID?".to_string(),
        "plan_name" => "What is the plan name?".to_string(),
        "product_type" => "What type of plan is this (Medicaid, Medicare, Commercial)?".to_string(),
        "contract_status" => "Is the provider contracted with this plan?".to_string(),
        "date_of_birth" => "What is the patient's date of birth?".to_string(),
        "sex" => "What is the patient's sex (M/F/Other)?".to_string(),
        "member_id" => "What is the member ID?".to_string(),
        "dos_date" => "What is the date of service?".to_string(),
        "first_name" => "What is the patient's first name?".to_string(),
        "last_name" => "What is the patient's last name?".to_string(),
        other => format!("What is the {}?", other.replace('_', " ")),
    }
}

fn fallback_questions(missing_fields: &[String]) -> Vec<NextQuestion> {
    missing_fields
        .iter()
        .take(5)
        .enumerate()
        .map(|(i, field)| NextQuestion {
            id: format!("q_{}", i + 1),
            text: question_text(field),
            answer_format: "FREE_TEXT".to_string(),
            options: Vec::new(),
            fills: vec![field.clone()],
            improves: vec!["COMPLETENESS".to_string()],
            why: format!("Required field: {}", field),
        })
        .collect()
}

fn fallback_improvements(missing_fields: &[String]) -> Vec<ImprovementAction> {
    missing_fields
        .iter()
        .take(5)
        .enumerate()
        .map(|(i, field)| {
            let leaf = field.rsplit('.').next().unwrap_or(field);
            ImprovementAction {
                action_id: format!("action_{}", i + 1),
                description: format!("Collect {} from user", leaf.replace('_', " ")),
                requires: "USER_INPUT".to_string(),
                expected_effect: "RESOLVE_COMPLETENESS".to_string(),
                priority: (i + 1) as u32,
                why: format!("Required for eligibility check: {}", field),
            }
        })
        .collect()
}

fn fallback_summary(score: &ScoreState, missing_fields: &[String]) -> String {
    if missing_fields.is_empty() {
        return format!(
            "Based on the eligibility check, the payment probability is {:.1}%.",
            score.base_probability * 100.0
        );
    }

    let mut names: Vec<String> = missing_fields
        .iter()
        .take(5)
        .map(|f| f.rsplit('.').next().unwrap_or(f).replace('_', " "))
        .collect();
    if missing_fields.len() > 5 {
        names.push("and more".to_string());
    }
    format!(
        "To complete the eligibility check, I need the following information: {}. \
         Please provide these details so I can proceed.",
        names.join(", ")
    )
}
