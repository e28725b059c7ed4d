//! Interpreter seam.
//!
//! The free-text interpreter is an external collaborator: it receives the
//! case state plus the user utterance and returns field suggestions strictly
//! partitioned into patient / health-plan / timing buckets. Malformed
//! responses collapse to an empty suggestion set with a warning; the turn
//! always continues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::models::{
    CaseState, CompletionState, CompletionStatus, ContractStatus, ProductType, SuggestedUpdates,
    UiEvent,
};
use crate::store::CaseStore;

#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(
        &self,
        case: &CaseState,
        event: &UiEvent,
        case_pk: i64,
    ) -> Result<SuggestedUpdates>;
}

/// Interpreter that never suggests anything. Used when no interpreter
/// endpoint is configured.
pub struct NoopInterpreter;

#[async_trait]
impl Interpreter for NoopInterpreter {
    async fn interpret(
        &self,
        _case: &CaseState,
        _event: &UiEvent,
        _case_pk: i64,
    ) -> Result<SuggestedUpdates> {
        Ok(SuggestedUpdates::default())
    }
}

/// HTTP adapter to the external LLM interpreter service. Every exchange is
/// recorded in the `llm_calls` ledger with a prompt hash.
pub struct HttpInterpreter {
    client: reqwest::Client,
    url: String,
    store: Arc<CaseStore>,
}

impl HttpInterpreter {
    pub fn new(url: String, store: Arc<CaseStore>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, store })
    }
}

#[async_trait]
impl Interpreter for HttpInterpreter {
    async fn interpret(
        &self,
        case: &CaseState,
        event: &UiEvent,
        case_pk: i64,
    ) -> Result<SuggestedUpdates> {
        let request_body = serde_json::json!({
            "case_state": case,
            "event_type": event.event_type,
            "data": event.data,
        });
        let prompt_hash = hash_prompt(&request_body);

        let response = match self.client.post(&self.url).json(&request_body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("interpreter request failed, continuing with empty suggestions: {}", e);
                return Ok(SuggestedUpdates::default());
            }
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("interpreter returned non-JSON body, collapsing to empty: {}", e);
                return Ok(SuggestedUpdates::default());
            }
        };

        if let Err(e) = self
            .store
            .log_llm_call(case_pk, None, "INTERPRETER", &prompt_hash, &body)
        {
            warn!("failed to record interpreter call: {}", e);
        }

        Ok(parse_suggestions(&body))
    }
}

/// Reduce an interpreter response to the three allowed buckets. Anything
/// outside them is ignored; anything unparseable collapses to empty.
pub fn parse_suggestions(body: &Value) -> SuggestedUpdates {
    let candidate = body.get("suggested_updates").unwrap_or(body);
    match serde_json::from_value::<SuggestedUpdates>(candidate.clone()) {
        Ok(suggestions) => suggestions,
        Err(e) => {
            warn!("malformed interpreter suggestions, collapsing to empty: {}", e);
            SuggestedUpdates::default()
        }
    }
}

pub fn hash_prompt(body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic completion check: the case is complete once the product
/// type, contract status, and a date of service are established.
pub fn check_completion(case: &CaseState) -> CompletionStatus {
    let mut missing_fields = Vec::new();

    if case.health_plan.product_type == ProductType::Unknown {
        missing_fields.push("health_plan.product_type".to_string());
    }
    if case.health_plan.contract_status == ContractStatus::Unknown {
        missing_fields.push("health_plan.contract_status".to_string());
    }
    if case.timing.dos_date.is_none() {
        missing_fields.push("timing.dos_date".to_string());
    }

    let status = if missing_fields.is_empty() {
        CompletionState::Complete
    } else {
        CompletionState::Incomplete
    };
    CompletionStatus {
        status,
        missing_fields,
    }
}
