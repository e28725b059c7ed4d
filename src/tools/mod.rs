//! External tool façade.
//!
//! Narrow async interfaces over the demographics, insurance, visits, and
//! coverage-transaction collaborators. The orchestrator only sees these
//! traits; production wires live adapters, the test suite (and the default
//! standalone server) wires the deterministic scenario doubles in
//! `fixtures`.

pub mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Demographics payload. Dates travel as ISO-8601 strings and are parsed
/// defensively at the updater seam.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Demographics {
    pub member_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub sex: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsuranceProfile {
    pub payer_name: Option<String>,
    pub payer_id: Option<String>,
    pub plan_name: Option<String>,
    pub member_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitRecord {
    pub visit_id: Option<String>,
    pub visit_date: String,
    pub visit_type: Option<String>,
    pub status: Option<String>,
    pub provider: Option<String>,
    pub location: Option<String>,
}

/// One coverage window from the payer transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageWindow {
    pub effective_date: String,
    pub end_date: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_type: Option<String>,
}

/// Raw result of the coverage-inquiry transaction. Deterministic for the
/// same member id across calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageResult {
    #[serde(default)]
    pub eligibility_windows: Vec<CoverageWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queried_at: Option<String>,
}

#[async_trait]
pub trait DemographicsTool: Send + Sync {
    async fn fetch(&self, patient_id: &str) -> Result<Option<Demographics>>;
}

#[async_trait]
pub trait InsuranceTool: Send + Sync {
    async fn fetch(&self, patient_id: &str) -> Result<Option<InsuranceProfile>>;
}

#[async_trait]
pub trait VisitsTool: Send + Sync {
    async fn fetch(
        &self,
        patient_id: &str,
        lookback_days: i64,
        lookahead_days: i64,
    ) -> Result<Vec<VisitRecord>>;
}

#[async_trait]
pub trait CoverageTool: Send + Sync {
    async fn check(&self, member_id: &str, payer_name: &str) -> Result<CoverageResult>;
}

/// Uniform handle to the concrete tool implementations.
#[derive(Clone)]
pub struct ToolSet {
    pub demographics: Arc<dyn DemographicsTool>,
    pub insurance: Arc<dyn InsuranceTool>,
    pub visits: Arc<dyn VisitsTool>,
    pub coverage: Arc<dyn CoverageTool>,
}

impl ToolSet {
    /// Scenario-backed tool set (deterministic per MRN).
    pub fn scenario_backed() -> Self {
        let tools = Arc::new(fixtures::ScenarioTools::new());
        Self {
            demographics: tools.clone(),
            insurance: tools.clone(),
            visits: tools.clone(),
            coverage: tools,
        }
    }
}
