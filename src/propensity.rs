//! Propensity store: historical base rates over the eligibility fact table.
//!
//! Read-only at runtime (the fact table is populated out of band; tests seed
//! it directly). Implements the waterfall/backoff strategy over dimension
//! strata and the per-risk historical rate lookups.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, info};

use crate::models::{
    age_bucket, CaseState, ContractStatus, EligibilityStatus, EventTense, ProductType, Sex,
    StateDistribution,
};

/// Confidence saturates at 0.95; 100 samples reach it.
const CONFIDENCE_SAMPLE_SCALE: f64 = 100.0;
const MAX_CONFIDENCE: f64 = 0.95;
/// Minimum combined confidence for a stratum to count as trustworthy in the
/// waterfall ranking.
const CONFIDENCE_FLOOR: f64 = 0.2;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS eligibility_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payer_id TEXT,
    provider_id TEXT,
    product_type TEXT,
    contract_status TEXT,
    event_tense TEXT,
    sex TEXT,
    age_bucket TEXT,
    eligibility_status TEXT NOT NULL,
    days_until_dos INTEGER,
    days_since_visit INTEGER,
    lost_coverage_before_dos INTEGER NOT NULL DEFAULT 0,
    payment_status TEXT,
    error_type TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_elig_tx_payer ON eligibility_transactions(payer_id);
CREATE INDEX IF NOT EXISTS idx_elig_tx_provider ON eligibility_transactions(provider_id);
CREATE INDEX IF NOT EXISTS idx_elig_tx_product ON eligibility_transactions(product_type, event_tense);
CREATE INDEX IF NOT EXISTS idx_elig_tx_status ON eligibility_transactions(eligibility_status);
"#;

/// The dimension subset a propensity query conditions on.
#[derive(Debug, Clone, Default)]
pub struct PropensityDims {
    pub payer_id: Option<String>,
    pub product_type: Option<String>,
    pub contract_status: Option<String>,
    pub event_tense: Option<String>,
    pub sex: Option<String>,
    pub age_bucket: Option<String>,
}

impl PropensityDims {
    /// Extract the known dimensions from a case. UNKNOWN categoricals do not
    /// count as known.
    pub fn from_case(case: &CaseState) -> Self {
        let product_type = match case.health_plan.product_type {
            ProductType::Unknown => None,
            pt => Some(pt.as_str().to_string()),
        };
        let contract_status = match case.health_plan.contract_status {
            ContractStatus::Unknown => None,
            cs => Some(cs.as_str().to_string()),
        };
        let event_tense = match case.timing.event_tense {
            EventTense::Unknown => None,
            et => Some(et.as_str().to_string()),
        };
        let sex = match case.patient.sex {
            Sex::Unknown => None,
            s => Some(s.as_str().to_string()),
        };
        let bucket = match (case.patient.date_of_birth, case.timing.dos_date) {
            (Some(dob), Some(dos)) => Some(age_bucket(dob, dos).to_string()),
            _ => None,
        };

        Self {
            payer_id: case.health_plan.payer_id.clone(),
            product_type,
            contract_status,
            event_tense,
            sex,
            age_bucket: bucket,
        }
    }

    /// Known (column, value) pairs in waterfall order.
    pub fn known(&self) -> Vec<(&'static str, &str)> {
        let mut dims = Vec::new();
        if let Some(v) = self.payer_id.as_deref() {
            dims.push(("payer_id", v));
        }
        if let Some(v) = self.product_type.as_deref() {
            dims.push(("product_type", v));
        }
        if let Some(v) = self.contract_status.as_deref() {
            dims.push(("contract_status", v));
        }
        if let Some(v) = self.event_tense.as_deref() {
            dims.push(("event_tense", v));
        }
        if let Some(v) = self.sex.as_deref() {
            dims.push(("sex", v));
        }
        if let Some(v) = self.age_bucket.as_deref() {
            dims.push(("age_bucket", v));
        }
        dims
    }
}

/// Best stratum chosen by the waterfall, with backoff diagnostics.
#[derive(Debug, Clone)]
pub struct StratumStats {
    pub probability: f64,
    pub sample_size: u64,
    pub combined_confidence: f64,
    pub probability_interval: Option<[f64; 2]>,
    pub backoff_level: usize,
    pub backoff_dims: Vec<String>,
}

/// A seed row for the fact table (tests and offline backfill).
#[derive(Debug, Clone, Default)]
pub struct TransactionRow {
    pub payer_id: Option<String>,
    pub provider_id: Option<String>,
    pub product_type: Option<String>,
    pub contract_status: Option<String>,
    pub event_tense: Option<String>,
    pub sex: Option<String>,
    pub age_bucket: Option<String>,
    pub eligibility_status: String,
    pub days_until_dos: Option<i64>,
    pub days_since_visit: Option<i64>,
    pub lost_coverage_before_dos: bool,
    pub payment_status: Option<String>,
    pub error_type: Option<String>,
}

pub struct PropensityStore {
    conn: Arc<Mutex<Connection>>,
}

impl PropensityStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open propensity database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize propensity schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM eligibility_transactions", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);
        info!("📊 Propensity fact table ready at {} ({} rows)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Seed one fact row. Used by tests and offline loaders.
    pub fn insert_transaction(&self, row: &TransactionRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO eligibility_transactions
             (payer_id, provider_id, product_type, contract_status, event_tense, sex, age_bucket,
              eligibility_status, days_until_dos, days_since_visit, lost_coverage_before_dos,
              payment_status, error_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                row.payer_id,
                row.provider_id,
                row.product_type,
                row.contract_status,
                row.event_tense,
                row.sex,
                row.age_bucket,
                row.eligibility_status,
                row.days_until_dos,
                row.days_since_visit,
                row.lost_coverage_before_dos as i64,
                row.payment_status,
                row.error_type,
            ],
        )?;
        Ok(())
    }

    /// Waterfall backoff: evaluate the global stratum (level 0) and the
    /// fully-conditioned stratum (level |D_known|), then pick the candidate
    /// with the best (trusted confidence, level, sample size) tuple.
    pub fn best_stratum(&self, dims: &PropensityDims) -> StratumStats {
        let known = dims.known();
        debug!(
            "🌊 propensity waterfall: {} known dimensions: {:?}",
            known.len(),
            known.iter().map(|(k, _)| *k).collect::<Vec<_>>()
        );

        let mut candidates: Vec<StratumStats> = Vec::new();

        if let Some((n, probability)) = self.query_stratum(&[]) {
            candidates.push(Self::stratum_stats(probability, n, 0, &[]));
        }
        if !known.is_empty() {
            if let Some((n, probability)) = self.query_stratum(&known) {
                candidates.push(Self::stratum_stats(probability, n, known.len(), &known));
            }
        }

        candidates
            .into_iter()
            .max_by(|a, b| {
                let key = |s: &StratumStats| {
                    let trusted = if s.combined_confidence > CONFIDENCE_FLOOR {
                        s.combined_confidence
                    } else {
                        0.0
                    };
                    (trusted, s.backoff_level, s.sample_size)
                };
                key(a)
                    .partial_cmp(&key(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(StratumStats {
                probability: 0.5,
                sample_size: 0,
                combined_confidence: 0.5,
                probability_interval: None,
                backoff_level: 0,
                backoff_dims: Vec::new(),
            })
    }

    /// Per-state propensity over the fully-conditioned stratum, normalized
    /// to sum to 1. Zero total mass falls back to the uniform distribution.
    pub fn state_distribution(&self, dims: &PropensityDims) -> StateDistribution {
        let known = dims.known();
        let mut dist = StateDistribution::zero();
        for status in EligibilityStatus::ALL {
            dist.set(status, self.query_state_share(status, &known));
        }

        let total = dist.sum();
        if total > 0.0 {
            dist.scale(1.0 / total);
            dist
        } else {
            StateDistribution::uniform()
        }
    }

    /// Historical coverage-loss rate for a product type around a gap window.
    pub fn coverage_loss_rate(&self, product_type: &str, days_until_dos: i64) -> Option<f64> {
        let min_days = (days_until_dos - 7).max(1);
        let max_days = days_until_dos + 7;
        self.query_rate(
            "SELECT COUNT(*),
                    AVG(CASE WHEN lost_coverage_before_dos = 1 THEN 1.0 ELSE 0.0 END)
             FROM eligibility_transactions
             WHERE eligibility_status = 'YES'
               AND event_tense = 'FUTURE'
               AND product_type = ?1
               AND days_until_dos BETWEEN ?2 AND ?3",
            rusqlite::params![product_type, min_days, max_days],
        )
    }

    /// Historical retrospective-denial rate around a days-since-visit window.
    pub fn retro_denial_rate(&self, days_since_visit: i64) -> Option<f64> {
        let min_days = (days_since_visit - 30).max(1);
        let max_days = days_since_visit + 30;
        self.query_rate(
            "SELECT COUNT(*),
                    AVG(CASE WHEN payment_status = 'DENIED' THEN 1.0 ELSE 0.0 END)
             FROM eligibility_transactions
             WHERE eligibility_status = 'YES'
               AND event_tense = 'PAST'
               AND days_since_visit BETWEEN ?1 AND ?2",
            rusqlite::params![min_days, max_days],
        )
    }

    /// Historical error rate for a payer.
    pub fn payer_error_rate(&self, payer_id: &str) -> Option<f64> {
        self.query_rate(
            "SELECT COUNT(*),
                    AVG(CASE WHEN error_type IS NOT NULL THEN 1.0 ELSE 0.0 END)
             FROM eligibility_transactions
             WHERE payer_id = ?1",
            rusqlite::params![payer_id],
        )
    }

    /// Historical error rate for a provider.
    pub fn provider_error_rate(&self, provider_id: &str) -> Option<f64> {
        self.query_rate(
            "SELECT COUNT(*),
                    AVG(CASE WHEN error_type IS NOT NULL THEN 1.0 ELSE 0.0 END)
             FROM eligibility_transactions
             WHERE provider_id = ?1",
            rusqlite::params![provider_id],
        )
    }

    fn stratum_stats(
        probability: f64,
        n: u64,
        level: usize,
        dims: &[(&'static str, &str)],
    ) -> StratumStats {
        StratumStats {
            probability,
            sample_size: n,
            combined_confidence: confidence_for_sample(n),
            probability_interval: wilson_interval(probability, n),
            backoff_level: level,
            backoff_dims: dims.iter().map(|(k, _)| k.to_string()).collect(),
        }
    }

    /// `(sample_size, P(YES))` over a stratum, or `None` when the stratum is
    /// empty.
    fn query_stratum(&self, dims: &[(&'static str, &str)]) -> Option<(u64, f64)> {
        let (where_clause, values) = build_where(dims);
        let sql = format!(
            "SELECT COUNT(*),
                    AVG(CASE WHEN eligibility_status = 'YES' THEN 1.0 ELSE 0.0 END)
             FROM eligibility_transactions
             WHERE {}",
            where_clause
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).ok()?;
        let (n, probability): (i64, Option<f64>) = stmt
            .query_row(params_from_iter(values.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .ok()?;

        if n > 0 {
            Some((n as u64, probability.unwrap_or(0.5)))
        } else {
            None
        }
    }

    /// Share of one status within the stratum (count matching / stratum size).
    fn query_state_share(&self, status: EligibilityStatus, dims: &[(&'static str, &str)]) -> f64 {
        let (where_clause, mut values) = build_where(dims);
        let sql = format!(
            "SELECT COUNT(*),
                    AVG(CASE WHEN eligibility_status = ?{} THEN 1.0 ELSE 0.0 END)
             FROM eligibility_transactions
             WHERE {}",
            values.len() + 1,
            where_clause
        );
        values.push(status.as_str().to_string());

        let conn = self.conn.lock();
        let Ok(mut stmt) = conn.prepare_cached(&sql) else {
            return 0.0;
        };
        match stmt.query_row(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?))
        }) {
            Ok((n, share)) if n > 0 => share.unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Run a `(count, rate)` query; `Some(rate)` only when the sample exists.
    fn query_rate<P: rusqlite::Params>(&self, sql: &str, params: P) -> Option<f64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql).ok()?;
        let (n, rate): (i64, Option<f64>) = stmt
            .query_row(params, |row| Ok((row.get(0)?, row.get(1)?)))
            .ok()?;
        if n > 0 {
            Some(rate.unwrap_or(0.0))
        } else {
            None
        }
    }
}

fn build_where(dims: &[(&'static str, &str)]) -> (String, Vec<String>) {
    if dims.is_empty() {
        return ("1=1".to_string(), Vec::new());
    }
    let clause = dims
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let values = dims.iter().map(|(_, v)| v.to_string()).collect();
    (clause, values)
}

fn confidence_for_sample(n: u64) -> f64 {
    (n as f64 / CONFIDENCE_SAMPLE_SCALE).min(MAX_CONFIDENCE)
}

/// Wilson score interval at 95% for the stratum's YES rate.
fn wilson_interval(probability: f64, n: u64) -> Option<[f64; 2]> {
    if n == 0 {
        return None;
    }
    let normal = Normal::new(0.0, 1.0).ok()?;
    let z = normal.inverse_cdf(0.975);
    let n = n as f64;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let center = (probability + z2 / (2.0 * n)) / denom;
    let margin = (z / denom) * (probability * (1.0 - probability) / n + z2 / (4.0 * n * n)).sqrt();
    Some([(center - margin).max(0.0), (center + margin).min(1.0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PropensityStore {
        PropensityStore::new(":memory:").expect("in-memory store")
    }

    fn yes_row(payer: &str, product: &str) -> TransactionRow {
        TransactionRow {
            payer_id: Some(payer.to_string()),
            product_type: Some(product.to_string()),
            event_tense: Some("FUTURE".to_string()),
            eligibility_status: "YES".to_string(),
            ..Default::default()
        }
    }

    fn no_row(payer: &str, product: &str) -> TransactionRow {
        TransactionRow {
            eligibility_status: "NO".to_string(),
            ..yes_row(payer, product)
        }
    }

    #[test]
    fn test_empty_table_falls_back() {
        let store = store();
        let stats = store.best_stratum(&PropensityDims::default());
        assert_eq!(stats.sample_size, 0);
        assert!((stats.probability - 0.5).abs() < 1e-9);
        assert_eq!(stats.backoff_level, 0);

        let dist = store.state_distribution(&PropensityDims::default());
        assert!((dist.yes - 0.25).abs() < 1e-9);
        assert!((dist.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_specific_stratum_wins_when_confident() {
        let store = store();
        // Global: 200 rows, half YES. Payer P1: 100 rows, 90% YES.
        for i in 0..100 {
            store.insert_transaction(&yes_row("P1", "MEDICAID")).unwrap();
            let row = if i < 10 {
                no_row("P2", "COMMERCIAL")
            } else {
                yes_row("P2", "COMMERCIAL")
            };
            store.insert_transaction(&row).unwrap();
        }
        for _ in 0..90 {
            store.insert_transaction(&no_row("P3", "MEDICARE")).unwrap();
        }

        let dims = PropensityDims {
            payer_id: Some("P1".to_string()),
            product_type: Some("MEDICAID".to_string()),
            event_tense: Some("FUTURE".to_string()),
            ..Default::default()
        };
        let stats = store.best_stratum(&dims);
        assert_eq!(stats.backoff_level, 3);
        assert_eq!(stats.sample_size, 100);
        assert!((stats.probability - 1.0).abs() < 1e-9);
        assert!((stats.combined_confidence - 0.95).abs() < 1e-9);
        assert_eq!(
            stats.backoff_dims,
            vec!["payer_id", "product_type", "event_tense"]
        );
    }

    #[test]
    fn test_backoff_to_global_when_stratum_empty() {
        let store = store();
        for _ in 0..50 {
            store.insert_transaction(&yes_row("P1", "MEDICAID")).unwrap();
        }
        let dims = PropensityDims {
            payer_id: Some("UNSEEN".to_string()),
            ..Default::default()
        };
        let stats = store.best_stratum(&dims);
        assert_eq!(stats.backoff_level, 0);
        assert!(stats.backoff_dims.is_empty());
        assert_eq!(stats.sample_size, 50);
    }

    #[test]
    fn test_state_distribution_normalizes() {
        let store = store();
        for _ in 0..3 {
            store.insert_transaction(&yes_row("P1", "MEDICAID")).unwrap();
        }
        store.insert_transaction(&no_row("P1", "MEDICAID")).unwrap();

        let dims = PropensityDims {
            payer_id: Some("P1".to_string()),
            ..Default::default()
        };
        let dist = store.state_distribution(&dims);
        assert!((dist.yes - 0.75).abs() < 1e-9);
        assert!((dist.no - 0.25).abs() < 1e-9);
        assert!((dist.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_risk_rates_require_sample() {
        let store = store();
        assert!(store.payer_error_rate("P1").is_none());
        assert!(store.coverage_loss_rate("MEDICAID", 30).is_none());
        assert!(store.retro_denial_rate(20).is_none());

        let mut row = yes_row("P1", "MEDICAID");
        row.error_type = Some("timeout".to_string());
        store.insert_transaction(&row).unwrap();
        store.insert_transaction(&yes_row("P1", "MEDICAID")).unwrap();

        let rate = store.payer_error_rate("P1").unwrap();
        assert!((rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_coverage_loss_rate_window() {
        let store = store();
        for i in 0..10 {
            let mut row = yes_row("P1", "MEDICAID");
            row.days_until_dos = Some(30);
            row.lost_coverage_before_dos = i < 2;
            store.insert_transaction(&row).unwrap();
        }
        // Inside the ±7 window
        let rate = store.coverage_loss_rate("MEDICAID", 28).unwrap();
        assert!((rate - 0.2).abs() < 1e-9);
        // Far outside the window: no sample
        assert!(store.coverage_loss_rate("MEDICAID", 90).is_none());
    }

    #[test]
    fn test_wilson_interval_brackets_probability() {
        let interval = wilson_interval(0.8, 50).unwrap();
        assert!(interval[0] < 0.8 && 0.8 < interval[1]);
        assert!(interval[0] >= 0.0 && interval[1] <= 1.0);
        assert!(wilson_interval(0.5, 0).is_none());
    }
}
