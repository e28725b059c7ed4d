//! Case store: sessions, cases, turn history, score runs, and the LLM call
//! ledger.
//!
//! Case state is persisted as a JSON snapshot per turn; score runs are
//! append-only and the latest one is exposed. Writes go through a single
//! connection mutex; per-case turn serialization is enforced one level up
//! by the orchestrator's case locks.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::models::{CaseState, PlanResponse, ScoreState};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS cases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_uuid TEXT NOT NULL,
    case_id TEXT NOT NULL UNIQUE,
    session_id INTEGER,
    status TEXT NOT NULL DEFAULT 'INIT',
    case_state TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS case_turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_pk INTEGER NOT NULL,
    plan_response TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_case_turns_case ON case_turns(case_pk, id);

CREATE TABLE IF NOT EXISTS score_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_pk INTEGER NOT NULL,
    turn_id INTEGER,
    scoring_version TEXT NOT NULL,
    score_state TEXT NOT NULL,
    inputs_used TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_score_runs_case ON score_runs(case_pk, id);

CREATE TABLE IF NOT EXISTS llm_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_pk INTEGER NOT NULL,
    turn_id INTEGER,
    call_type TEXT NOT NULL,
    prompt_hash TEXT NOT NULL DEFAULT '',
    response TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_llm_calls_case ON llm_calls(case_pk, id);
"#;

/// Case row metadata (state snapshot is fetched separately).
#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub id: i64,
    pub case_uuid: String,
    pub case_id: String,
    pub session_id: Option<i64>,
    pub status: String,
}

pub struct CaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl CaseStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open case database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize case schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cases", [], |row| row.get(0))
            .unwrap_or(0);
        info!("🗂️  Case store ready at {} ({} cases)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn create_session(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute("INSERT INTO sessions (user_id) VALUES (?1)", params![user_id])?;
        Ok(conn.last_insert_rowid())
    }

    /// Get or create a case by its external id; returns the primary key.
    pub fn get_or_create_case(&self, case_id: &str, session_id: Option<i64>) -> Result<i64> {
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM cases WHERE case_id = ?1",
                params![case_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(pk) = existing {
            return Ok(pk);
        }

        let case_uuid = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO cases (case_uuid, case_id, session_id) VALUES (?1, ?2, ?3)",
            params![case_uuid, case_id, session_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_case(&self, case_pk: i64) -> Result<Option<CaseRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, case_uuid, case_id, session_id, status FROM cases WHERE id = ?1",
                params![case_pk],
                |row| {
                    Ok(CaseRecord {
                        id: row.get(0)?,
                        case_uuid: row.get(1)?,
                        case_id: row.get(2)?,
                        session_id: row.get(3)?,
                        status: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Look a case up by external id without creating it.
    pub fn find_case_pk(&self, case_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id FROM cases WHERE case_id = ?1",
                params![case_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_case_state(&self, case_pk: i64) -> Result<Option<CaseState>> {
        let conn = self.conn.lock();
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT case_state FROM cases WHERE id = ?1",
                params![case_pk],
                |row| row.get(0),
            )
            .optional()?;
        match snapshot {
            Some(json) => {
                let state: CaseState = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt case_state snapshot for case {}", case_pk))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub fn update_case_state(&self, case_pk: i64, state: &CaseState) -> Result<()> {
        let snapshot = serde_json::to_string(state)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE cases SET case_state = ?1, updated_at = strftime('%s', 'now') WHERE id = ?2",
            params![snapshot, case_pk],
        )?;
        Ok(())
    }

    pub fn create_turn(&self, case_pk: i64, plan: &PlanResponse) -> Result<i64> {
        let plan_json = serde_json::to_string(plan)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO case_turns (case_pk, plan_response) VALUES (?1, ?2)",
            params![case_pk, plan_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_plan(&self, case_pk: i64) -> Result<Option<PlanResponse>> {
        let conn = self.conn.lock();
        let plan_json: Option<String> = conn
            .query_row(
                "SELECT plan_response FROM case_turns WHERE case_pk = ?1 ORDER BY id DESC LIMIT 1",
                params![case_pk],
                |row| row.get(0),
            )
            .optional()?;
        Ok(plan_json.and_then(|json| serde_json::from_str(&json).ok()))
    }

    pub fn create_score_run(
        &self,
        case_pk: i64,
        turn_id: Option<i64>,
        score: &ScoreState,
        inputs_used: &Value,
    ) -> Result<i64> {
        let score_json = serde_json::to_string(score)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO score_runs (case_pk, turn_id, scoring_version, score_state, inputs_used)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                case_pk,
                turn_id,
                score.scoring_version,
                score_json,
                inputs_used.to_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_score(&self, case_pk: i64) -> Result<Option<ScoreState>> {
        let conn = self.conn.lock();
        let score_json: Option<String> = conn
            .query_row(
                "SELECT score_state FROM score_runs WHERE case_pk = ?1 ORDER BY id DESC LIMIT 1",
                params![case_pk],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score_json.and_then(|json| serde_json::from_str(&json).ok()))
    }

    pub fn log_llm_call(
        &self,
        case_pk: i64,
        turn_id: Option<i64>,
        call_type: &str,
        prompt_hash: &str,
        response: &Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO llm_calls (case_pk, turn_id, call_type, prompt_hash, response)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![case_pk, turn_id, call_type, prompt_hash, response.to_string()],
        )?;
        Ok(())
    }

    /// Count of score runs for a case (test/diagnostic helper).
    pub fn score_run_count(&self, case_pk: i64) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM score_runs WHERE case_pk = ?1",
            params![case_pk],
            |row| row.get(0),
        )?)
    }
}
