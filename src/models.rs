//! Domain models for the eligibility assessment pipeline.
//!
//! `CaseState` is the mutable per-case aggregate; it is only ever changed
//! through the deterministic updater and persisted as a JSON snapshot at the
//! end of each turn. `ScoreState` is the append-only per-turn scoring record.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// The four-state eligibility outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EligibilityStatus {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
    #[serde(rename = "NOT_ESTABLISHED")]
    NotEstablished,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl EligibilityStatus {
    pub const ALL: [EligibilityStatus; 4] = [
        EligibilityStatus::Yes,
        EligibilityStatus::No,
        EligibilityStatus::NotEstablished,
        EligibilityStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EligibilityStatus::Yes => "YES",
            EligibilityStatus::No => "NO",
            EligibilityStatus::NotEstablished => "NOT_ESTABLISHED",
            EligibilityStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Whether the date of service is in the past or the future relative to today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventTense {
    #[serde(rename = "PAST")]
    Past,
    #[serde(rename = "FUTURE")]
    Future,
    #[serde(rename = "UNKNOWN")]
    #[default]
    Unknown,
}

impl EventTense {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTense::Past => "PAST",
            EventTense::Future => "FUTURE",
            EventTense::Unknown => "UNKNOWN",
        }
    }
}

/// A DOS on today's date counts as FUTURE (the service can still be paid for).
pub fn derive_event_tense(dos_date: NaiveDate, today: NaiveDate) -> EventTense {
    if dos_date >= today {
        EventTense::Future
    } else {
        EventTense::Past
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProductType {
    #[serde(rename = "MEDICAID")]
    Medicaid,
    #[serde(rename = "MEDICARE")]
    Medicare,
    #[serde(rename = "DSNP")]
    Dsnp,
    #[serde(rename = "COMMERCIAL")]
    Commercial,
    #[serde(rename = "OTHER")]
    Other,
    #[serde(rename = "UNKNOWN")]
    #[default]
    Unknown,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Medicaid => "MEDICAID",
            ProductType::Medicare => "MEDICARE",
            ProductType::Dsnp => "DSNP",
            ProductType::Commercial => "COMMERCIAL",
            ProductType::Other => "OTHER",
            ProductType::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MEDICAID" => Some(ProductType::Medicaid),
            "MEDICARE" => Some(ProductType::Medicare),
            "DSNP" => Some(ProductType::Dsnp),
            "COMMERCIAL" => Some(ProductType::Commercial),
            "OTHER" => Some(ProductType::Other),
            "UNKNOWN" => Some(ProductType::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContractStatus {
    #[serde(rename = "CONTRACTED")]
    Contracted,
    #[serde(rename = "NON_CONTRACTED")]
    NonContracted,
    #[serde(rename = "UNKNOWN")]
    #[default]
    Unknown,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Contracted => "CONTRACTED",
            ContractStatus::NonContracted => "NON_CONTRACTED",
            ContractStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CONTRACTED" => Some(ContractStatus::Contracted),
            "NON_CONTRACTED" => Some(ContractStatus::NonContracted),
            "UNKNOWN" => Some(ContractStatus::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sex {
    #[serde(rename = "MALE")]
    Male,
    #[serde(rename = "FEMALE")]
    Female,
    #[serde(rename = "OTHER")]
    Other,
    #[serde(rename = "UNKNOWN")]
    #[default]
    Unknown,
}

impl Sex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::Male => "MALE",
            Sex::Female => "FEMALE",
            Sex::Other => "OTHER",
            Sex::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MALE" | "M" => Some(Sex::Male),
            "FEMALE" | "F" => Some(Sex::Female),
            "OTHER" => Some(Sex::Other),
            "UNKNOWN" => Some(Sex::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvidenceStrength {
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LOW")]
    #[default]
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckSource {
    #[serde(rename = "CLEARINGHOUSE")]
    Clearinghouse,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "NONE")]
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl VisitStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(VisitStatus::Scheduled),
            "completed" => Some(VisitStatus::Completed),
            "cancelled" => Some(VisitStatus::Cancelled),
            _ => None,
        }
    }
}

/// Patient demographics known to the case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patient {
    pub member_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub sex: Sex,
}

/// Insurance plan details known to the case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthPlan {
    pub payer_name: Option<String>,
    pub payer_id: Option<String>,
    pub plan_name: Option<String>,
    #[serde(default)]
    pub product_type: ProductType,
    #[serde(default)]
    pub contract_status: ContractStatus,
}

/// Timing of the service under assessment plus the related visit set.
///
/// `related_visits` is rebuilt from the visits tool every turn and kept
/// ordered by visit date ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    pub dos_date: Option<NaiveDate>,
    #[serde(default)]
    pub event_tense: EventTense,
    #[serde(default)]
    pub related_visits: Vec<VisitInfo>,
}

/// The payer-evidenced eligibility determination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityTruth {
    pub status: EligibilityStatus,
    pub coverage_window_start: Option<NaiveDate>,
    pub coverage_window_end: Option<NaiveDate>,
    #[serde(default)]
    pub evidence_strength: EvidenceStrength,
}

impl Default for EligibilityTruth {
    fn default() -> Self {
        Self {
            status: EligibilityStatus::NotEstablished,
            coverage_window_start: None,
            coverage_window_end: None,
            evidence_strength: EvidenceStrength::Low,
        }
    }
}

/// Bookkeeping for the coverage transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EligibilityCheck {
    #[serde(default)]
    pub checked: bool,
    pub check_date: Option<NaiveDate>,
    #[serde(default)]
    pub source: CheckSource,
    /// Opaque raw payload of the last coverage transaction.
    pub result_raw: Option<Value>,
}

/// Mutable per-case aggregate. Created on the first turn for a case id,
/// mutated only through `updater`, persisted as a snapshot at end of turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseState {
    #[serde(default)]
    pub patient: Patient,
    #[serde(default)]
    pub health_plan: HealthPlan,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub eligibility_truth: EligibilityTruth,
    #[serde(default)]
    pub eligibility_check: EligibilityCheck,
}

/// A single visit with its per-visit scoring fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitInfo {
    pub visit_id: Option<String>,
    pub visit_date: NaiveDate,
    pub visit_type: Option<String>,
    pub status: Option<VisitStatus>,
    pub provider: Option<String>,
    pub location: Option<String>,
    pub eligibility_status: Option<EligibilityStatus>,
    pub eligibility_probability: Option<f64>,
    pub event_tense: Option<EventTense>,
    pub score_state: Option<Box<ScoreState>>,
}

impl VisitInfo {
    pub fn new(visit_date: NaiveDate) -> Self {
        Self {
            visit_id: None,
            visit_date,
            visit_type: None,
            status: None,
            provider: None,
            location: None,
            eligibility_status: None,
            eligibility_probability: None,
            event_tense: None,
            score_state: None,
        }
    }
}

/// Fixed-size distribution over the four eligibility states.
///
/// Kept as a record rather than an open map so the entries can never drift
/// out of the enum set; normalization correction targets the largest entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateDistribution {
    #[serde(rename = "YES")]
    pub yes: f64,
    #[serde(rename = "NO")]
    pub no: f64,
    #[serde(rename = "NOT_ESTABLISHED")]
    pub not_established: f64,
    #[serde(rename = "UNKNOWN")]
    pub unknown: f64,
}

impl Default for StateDistribution {
    fn default() -> Self {
        Self::uniform()
    }
}

impl StateDistribution {
    pub fn zero() -> Self {
        Self {
            yes: 0.0,
            no: 0.0,
            not_established: 0.0,
            unknown: 0.0,
        }
    }

    pub fn uniform() -> Self {
        Self {
            yes: 0.25,
            no: 0.25,
            not_established: 0.25,
            unknown: 0.25,
        }
    }

    pub fn one_hot(status: EligibilityStatus) -> Self {
        let mut dist = Self::zero();
        dist.set(status, 1.0);
        dist
    }

    pub fn get(&self, status: EligibilityStatus) -> f64 {
        match status {
            EligibilityStatus::Yes => self.yes,
            EligibilityStatus::No => self.no,
            EligibilityStatus::NotEstablished => self.not_established,
            EligibilityStatus::Unknown => self.unknown,
        }
    }

    pub fn set(&mut self, status: EligibilityStatus, value: f64) {
        match status {
            EligibilityStatus::Yes => self.yes = value,
            EligibilityStatus::No => self.no = value,
            EligibilityStatus::NotEstablished => self.not_established = value,
            EligibilityStatus::Unknown => self.unknown = value,
        }
    }

    pub fn sum(&self) -> f64 {
        self.yes + self.no + self.not_established + self.unknown
    }

    /// Scale every entry by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.yes *= factor;
        self.no *= factor;
        self.not_established *= factor;
        self.unknown *= factor;
    }

    /// State holding the largest mass (ties resolve in enum order).
    pub fn argmax(&self) -> EligibilityStatus {
        let mut best = EligibilityStatus::Yes;
        let mut best_value = self.yes;
        for status in [
            EligibilityStatus::No,
            EligibilityStatus::NotEstablished,
            EligibilityStatus::Unknown,
        ] {
            let value = self.get(status);
            if value > best_value {
                best = status;
                best_value = value;
            }
        }
        best
    }
}

/// Per-risk probabilities. Absent entries mean the risk is not active for
/// the case's event tense.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskProbabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrospective_denial: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_error: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<f64>,
}

impl RiskProbabilities {
    pub fn is_empty(&self) -> bool {
        self.coverage_loss.is_none()
            && self.retrospective_denial.is_none()
            && self.payer_error.is_none()
            && self.provider_error.is_none()
    }
}

/// Append-only scoring record for one scoring pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreState {
    /// Headline scalar: final probability mass on YES.
    pub base_probability: f64,
    pub base_confidence: f64,
    /// "direct_evidence" or "historical_fallback".
    pub base_source: String,
    pub state_probabilities: StateDistribution,
    pub risk_probabilities: RiskProbabilities,
    pub adjusted_risks: RiskProbabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability_interval: Option<[f64; 2]>,
    pub backoff_level: Option<usize>,
    pub backoff_dims: Vec<String>,
    pub sample_size: u64,
    pub scoring_version: String,
}

/// One inbound UI event (user message or form submission).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl UiEvent {
    pub fn user_message(text: &str) -> Self {
        Self {
            event_type: "user_message".to_string(),
            data: serde_json::json!({ "message": text }),
            timestamp: None,
        }
    }

    pub fn message_text(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}

/// Interpreter output: field suggestions strictly partitioned into the three
/// buckets the interpreter is allowed to touch. Anything else is dropped at
/// the seam.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestedUpdates {
    #[serde(default)]
    pub patient_updates: serde_json::Map<String, Value>,
    #[serde(default)]
    pub health_plan_updates: serde_json::Map<String, Value>,
    #[serde(default)]
    pub timing_updates: serde_json::Map<String, Value>,
}

impl SuggestedUpdates {
    pub fn is_empty(&self) -> bool {
        self.patient_updates.is_empty()
            && self.health_plan_updates.is_empty()
            && self.timing_updates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionState {
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "INCOMPLETE")]
    Incomplete,
    #[serde(rename = "NEEDS_INPUT")]
    NeedsInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub status: CompletionState,
    pub missing_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextQuestion {
    pub id: String,
    pub text: String,
    pub answer_format: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub fills: Vec<String>,
    #[serde(default)]
    pub improves: Vec<String>,
    #[serde(default)]
    pub why: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementAction {
    pub action_id: String,
    pub description: String,
    pub requires: String,
    pub expected_effect: String,
    pub priority: u32,
    #[serde(default)]
    pub why: String,
}

/// Planner output for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanResponse {
    #[serde(default)]
    pub next_questions: Vec<NextQuestion>,
    #[serde(default)]
    pub improvement_plan: Vec<ImprovementAction>,
    #[serde(default)]
    pub presentation_summary: String,
}

/// Full response envelope for one processed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub case_id: String,
    pub case_pk: i64,
    pub status: String,
    pub case_state: CaseState,
    pub score_state: ScoreState,
    pub next_questions: Vec<NextQuestion>,
    pub improvement_plan: Vec<ImprovementAction>,
    pub presentation_summary: String,
    pub completion: CompletionStatus,
}

/// Parse an ISO-8601 `YYYY-MM-DD` date defensively. Malformed inputs are
/// logged and dropped field-level, never fatal.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(e) => {
            debug!("could not parse date {:?}: {}", value, e);
            None
        }
    }
}

/// Age bucket for the propensity dimensions.
pub fn age_bucket(date_of_birth: NaiveDate, as_of: NaiveDate) -> &'static str {
    let age = (as_of - date_of_birth).num_days() / 365;
    match age {
        _ if age < 18 => "0-17",
        _ if age < 26 => "18-25",
        _ if age < 36 => "26-35",
        _ if age < 46 => "36-45",
        _ if age < 56 => "46-55",
        _ if age < 66 => "56-65",
        _ => "66+",
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub case_db_path: String,
    pub events_db_path: String,
    pub propensity_db_path: String,
    pub port: u16,
    pub interpreter_url: Option<String>,
    pub planner_url: Option<String>,
    pub tool_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let case_db_path =
            std::env::var("CASE_DB_PATH").unwrap_or_else(|_| "./paysight_cases.db".to_string());

        let events_db_path =
            std::env::var("EVENTS_DB_PATH").unwrap_or_else(|_| "./paysight_events.db".to_string());

        let propensity_db_path = std::env::var("PROPENSITY_DB_PATH")
            .unwrap_or_else(|_| "./paysight_propensity.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let interpreter_url = std::env::var("INTERPRETER_URL").ok().filter(|s| !s.is_empty());
        let planner_url = std::env::var("PLANNER_URL").ok().filter(|s| !s.is_empty());

        let tool_timeout_secs = std::env::var("TOOL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        Ok(Self {
            case_db_path,
            events_db_path,
            propensity_db_path,
            port,
            interpreter_url,
            planner_url,
            tool_timeout_secs,
        })
    }
}
