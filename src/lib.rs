//! PaySight Backend Library
//!
//! Per-turn eligibility assessment pipeline: deterministic case-state
//! updates, layered payment-probability scoring, per-visit scoring with
//! recency-weighted aggregation, and a persistent process-event log.
//!
//! The binary in `main.rs` wires these modules behind an axum HTTP surface;
//! integration tests drive the same modules directly.

pub mod api;
pub mod events;
pub mod interpret;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod plan;
pub mod propensity;
pub mod scoring;
pub mod store;
pub mod tools;
pub mod updater;

// Re-export the most commonly used types at crate root for convenience
pub use models::{CaseState, Config, EligibilityStatus, EventTense, ScoreState, UiEvent};
pub use orchestrator::Orchestrator;
