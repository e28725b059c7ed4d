//! Deterministic per-MRN scenario doubles for the external tools.
//!
//! The same MRN always returns the same data regardless of which surface
//! asks, so eligibility failures and missing-data behaviors are exactly
//! reproducible. Unknown MRNs get the happy path (full data, active
//! coverage).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};

use super::{
    CoverageResult, CoverageTool, CoverageWindow, Demographics, DemographicsTool, InsuranceProfile,
    InsuranceTool, VisitRecord, VisitsTool,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoverageScenario {
    /// One active window containing today.
    Active,
    /// Only inactive windows.
    NoActiveWindow,
    /// Active-status window that ended in the past.
    Expired,
    /// Active-status window that starts in the future.
    Future,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataLevel {
    Full,
    /// Missing date of birth.
    Partial,
    /// Missing first/last name.
    PartialName,
    /// Missing plan name.
    PartialPlan,
    /// Missing payer name.
    PartialPayer,
    None,
    /// The upstream system errors out.
    Fails,
}

#[derive(Debug, Clone, Copy)]
struct Scenario {
    coverage: CoverageScenario,
    demographics: DataLevel,
    insurance: DataLevel,
    visits: DataLevel,
}

const HAPPY_PATH: Scenario = Scenario {
    coverage: CoverageScenario::Active,
    demographics: DataLevel::Full,
    insurance: DataLevel::Full,
    visits: DataLevel::Full,
};

fn scenario_for(patient_id: &str) -> Scenario {
    let normalized = patient_id.trim().to_uppercase();
    match normalized.as_str() {
        // Eligibility failure scenarios
        "MRN200" => Scenario {
            coverage: CoverageScenario::NoActiveWindow,
            ..HAPPY_PATH
        },
        "MRN201" => Scenario {
            coverage: CoverageScenario::NoActiveWindow,
            visits: DataLevel::None,
            ..HAPPY_PATH
        },
        "MRN202" => Scenario {
            coverage: CoverageScenario::Expired,
            ..HAPPY_PATH
        },
        "MRN203" => Scenario {
            coverage: CoverageScenario::Future,
            ..HAPPY_PATH
        },
        // Missing data scenarios
        "MRN204" => Scenario {
            demographics: DataLevel::None,
            ..HAPPY_PATH
        },
        "MRN205" => Scenario {
            demographics: DataLevel::Partial,
            ..HAPPY_PATH
        },
        "MRN206" => Scenario {
            demographics: DataLevel::PartialName,
            ..HAPPY_PATH
        },
        "MRN207" => Scenario {
            coverage: CoverageScenario::NoActiveWindow,
            insurance: DataLevel::None,
            ..HAPPY_PATH
        },
        "MRN208" => Scenario {
            insurance: DataLevel::PartialPlan,
            ..HAPPY_PATH
        },
        "MRN209" => Scenario {
            insurance: DataLevel::PartialPayer,
            ..HAPPY_PATH
        },
        "MRN210" => Scenario {
            visits: DataLevel::None,
            ..HAPPY_PATH
        },
        // Combined failures
        "MRN211" => Scenario {
            coverage: CoverageScenario::NoActiveWindow,
            demographics: DataLevel::Partial,
            insurance: DataLevel::PartialPlan,
            visits: DataLevel::None,
        },
        "MRN212" => Scenario {
            coverage: CoverageScenario::NoActiveWindow,
            demographics: DataLevel::None,
            ..HAPPY_PATH
        },
        "MRN213" => Scenario {
            coverage: CoverageScenario::NoActiveWindow,
            insurance: DataLevel::None,
            ..HAPPY_PATH
        },
        "MRN214" => Scenario {
            coverage: CoverageScenario::Expired,
            visits: DataLevel::None,
            ..HAPPY_PATH
        },
        "MRN215" => Scenario {
            coverage: CoverageScenario::Future,
            demographics: DataLevel::Partial,
            insurance: DataLevel::PartialPlan,
            ..HAPPY_PATH
        },
        // Transient upstream failures
        "MRN500" => Scenario {
            demographics: DataLevel::Fails,
            ..HAPPY_PATH
        },
        "MRN501" => Scenario {
            visits: DataLevel::Fails,
            ..HAPPY_PATH
        },
        _ => HAPPY_PATH,
    }
}

fn member_id_for(patient_id: &str) -> String {
    format!("MBR-{}", patient_id.trim().to_uppercase())
}

/// Deterministic scenario-backed implementation of all four tools.
pub struct ScenarioTools;

impl ScenarioTools {
    pub fn new() -> Self {
        Self
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }
}

impl Default for ScenarioTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DemographicsTool for ScenarioTools {
    async fn fetch(&self, patient_id: &str) -> Result<Option<Demographics>> {
        match scenario_for(patient_id).demographics {
            DataLevel::None => Ok(None),
            DataLevel::Fails => Err(anyhow!("EMR demographics lookup timed out")),
            level => {
                let mut demographics = Demographics {
                    member_id: Some(member_id_for(patient_id)),
                    first_name: Some("Jordan".to_string()),
                    last_name: Some("Alvarez".to_string()),
                    date_of_birth: Some("1980-03-15".to_string()),
                    sex: Some("FEMALE".to_string()),
                };
                if level == DataLevel::Partial {
                    demographics.date_of_birth = None;
                }
                if level == DataLevel::PartialName {
                    demographics.first_name = None;
                    demographics.last_name = None;
                }
                Ok(Some(demographics))
            }
        }
    }
}

#[async_trait]
impl InsuranceTool for ScenarioTools {
    async fn fetch(&self, patient_id: &str) -> Result<Option<InsuranceProfile>> {
        match scenario_for(patient_id).insurance {
            DataLevel::None => Ok(None),
            DataLevel::Fails => Err(anyhow!("EMR insurance lookup timed out")),
            level => {
                let mut insurance = InsuranceProfile {
                    payer_name: Some("Acme Health".to_string()),
                    payer_id: Some("ACME01".to_string()),
                    plan_name: Some("Acme Commercial PPO".to_string()),
                    member_id: Some(member_id_for(patient_id)),
                };
                if level == DataLevel::PartialPlan {
                    insurance.plan_name = None;
                }
                if level == DataLevel::PartialPayer {
                    insurance.payer_name = None;
                }
                Ok(Some(insurance))
            }
        }
    }
}

#[async_trait]
impl VisitsTool for ScenarioTools {
    async fn fetch(
        &self,
        patient_id: &str,
        lookback_days: i64,
        lookahead_days: i64,
    ) -> Result<Vec<VisitRecord>> {
        match scenario_for(patient_id).visits {
            DataLevel::None => Ok(Vec::new()),
            DataLevel::Fails => Err(anyhow!("EMR visit lookup timed out")),
            _ => {
                let today = Self::today();
                let candidates = [
                    (-60, "completed", "office_visit", "Dr. Patel"),
                    (-10, "completed", "follow_up", "Dr. Patel"),
                    (30, "scheduled", "specialist_consult", "Dr. Okafor"),
                ];
                let visits = candidates
                    .iter()
                    .enumerate()
                    .filter(|&(_, &(offset, _, _, _))| {
                        offset >= -lookback_days && offset <= lookahead_days
                    })
                    .map(|(i, &(offset, status, visit_type, provider))| VisitRecord {
                        visit_id: Some(format!("{}-V{}", patient_id.trim().to_uppercase(), i + 1)),
                        visit_date: (today + Duration::days(offset)).format("%Y-%m-%d").to_string(),
                        visit_type: Some(visit_type.to_string()),
                        status: Some(status.to_string()),
                        provider: Some(provider.to_string()),
                        location: Some("Main Street Clinic".to_string()),
                    })
                    .collect();
                Ok(visits)
            }
        }
    }
}

#[async_trait]
impl CoverageTool for ScenarioTools {
    async fn check(&self, member_id: &str, _payer_name: &str) -> Result<CoverageResult> {
        // The scenario is keyed by the MRN embedded in the member id.
        let patient_id = member_id.strip_prefix("MBR-").unwrap_or(member_id);
        let today = Self::today();
        let iso = |d: NaiveDate| d.format("%Y-%m-%d").to_string();

        let windows = match scenario_for(patient_id).coverage {
            CoverageScenario::Active => vec![CoverageWindow {
                effective_date: iso(today - Duration::days(365)),
                end_date: iso(today + Duration::days(365)),
                status: "active".to_string(),
                plan_name: Some("Acme Commercial PPO".to_string()),
                member_id: Some(member_id.to_string()),
                coverage_type: Some("medical".to_string()),
            }],
            CoverageScenario::NoActiveWindow => vec![CoverageWindow {
                effective_date: iso(today - Duration::days(730)),
                end_date: iso(today - Duration::days(365)),
                status: "inactive".to_string(),
                plan_name: Some("Acme Commercial PPO".to_string()),
                member_id: Some(member_id.to_string()),
                coverage_type: Some("medical".to_string()),
            }],
            CoverageScenario::Expired => vec![CoverageWindow {
                effective_date: iso(today - Duration::days(400)),
                end_date: iso(today - Duration::days(30)),
                status: "active".to_string(),
                plan_name: Some("Acme Commercial PPO".to_string()),
                member_id: Some(member_id.to_string()),
                coverage_type: Some("medical".to_string()),
            }],
            CoverageScenario::Future => vec![CoverageWindow {
                effective_date: iso(today + Duration::days(30)),
                end_date: iso(today + Duration::days(395)),
                status: "active".to_string(),
                plan_name: Some("Acme Commercial PPO".to_string()),
                member_id: Some(member_id.to_string()),
                coverage_type: Some("medical".to_string()),
            }],
        };

        Ok(CoverageResult {
            eligibility_windows: windows,
            member_id: Some(member_id.to_string()),
            queried_at: Some(Utc::now().to_rfc3339()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_happy_path_mrn_returns_full_data() {
        let tools = ScenarioTools::new();
        let demographics = DemographicsTool::fetch(&tools, "MRN100").await.unwrap().unwrap();
        assert!(demographics.date_of_birth.is_some());

        let insurance = InsuranceTool::fetch(&tools, "MRN100").await.unwrap().unwrap();
        assert_eq!(insurance.payer_name.as_deref(), Some("Acme Health"));

        let visits = VisitsTool::fetch(&tools, "MRN100", 180, 180).await.unwrap();
        assert_eq!(visits.len(), 3);

        let coverage = tools.check("MBR-MRN100", "Acme Health").await.unwrap();
        assert_eq!(coverage.eligibility_windows.len(), 1);
        assert_eq!(coverage.eligibility_windows[0].status, "active");
    }

    #[tokio::test]
    async fn test_no_active_window_scenario() {
        let tools = ScenarioTools::new();
        let coverage = tools.check("MBR-MRN200", "Acme Health").await.unwrap();
        assert!(coverage
            .eligibility_windows
            .iter()
            .all(|w| w.status != "active"));
    }

    #[tokio::test]
    async fn test_lookback_window_filters_visits() {
        let tools = ScenarioTools::new();
        let visits = VisitsTool::fetch(&tools, "MRN100", 30, 0).await.unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn test_failure_scenarios_error() {
        let tools = ScenarioTools::new();
        assert!(DemographicsTool::fetch(&tools, "MRN500").await.is_err());
        assert!(VisitsTool::fetch(&tools, "MRN501", 180, 180).await.is_err());
    }

    #[tokio::test]
    async fn test_coverage_is_deterministic_per_member() {
        let tools = ScenarioTools::new();
        let a = tools.check("MBR-MRN202", "Acme Health").await.unwrap();
        let b = tools.check("MBR-MRN202", "Acme Health").await.unwrap();
        assert_eq!(
            a.eligibility_windows[0].effective_date,
            b.eligibility_windows[0].effective_date
        );
        assert_eq!(a.eligibility_windows[0].status, "active");
    }
}
