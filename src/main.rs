//! PaySight - Insurance payment-probability assessment service.
//!
//! Wires the case store, event log, propensity store, scorer, and external
//! collaborator seams behind the axum HTTP surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paysight_backend::api::{self, AppState};
use paysight_backend::events::EventLog;
use paysight_backend::interpret::{HttpInterpreter, Interpreter, NoopInterpreter};
use paysight_backend::models::Config;
use paysight_backend::orchestrator::Orchestrator;
use paysight_backend::plan::{HttpPlanner, Planner, TemplatePlanner};
use paysight_backend::propensity::PropensityStore;
use paysight_backend::scoring::Scorer;
use paysight_backend::store::CaseStore;
use paysight_backend::tools::ToolSet;

#[derive(Parser, Debug)]
#[command(name = "paysight", about = "Eligibility payment-probability service")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("🚀 PaySight eligibility service starting");

    let case_db_path = resolve_data_path(&config.case_db_path);
    let events_db_path = resolve_data_path(&config.events_db_path);
    let propensity_db_path = resolve_data_path(&config.propensity_db_path);

    let store = Arc::new(CaseStore::new(&case_db_path)?);
    let events = Arc::new(EventLog::new(&events_db_path)?);
    let propensity = Arc::new(PropensityStore::new(&propensity_db_path)?);
    let scorer = Arc::new(Scorer::new(propensity));

    // External data sources. The scenario-backed tools are the deterministic
    // default; a live EMR integration plugs in here.
    let tools = ToolSet::scenario_backed();

    let tool_timeout = Duration::from_secs(config.tool_timeout_secs);
    let interpreter: Arc<dyn Interpreter> = match config.interpreter_url.clone() {
        Some(url) => {
            info!("🧠 Interpreter endpoint: {}", url);
            Arc::new(HttpInterpreter::new(url, store.clone(), tool_timeout)?)
        }
        None => {
            info!("🧠 No interpreter endpoint configured; utterances are not interpreted");
            Arc::new(NoopInterpreter)
        }
    };
    let planner: Arc<dyn Planner> = match config.planner_url.clone() {
        Some(url) => {
            info!("🗺️  Planner endpoint: {}", url);
            Arc::new(HttpPlanner::new(url, store.clone(), tool_timeout)?)
        }
        None => {
            info!("🗺️  No planner endpoint configured; using template planner");
            Arc::new(TemplatePlanner)
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        events,
        scorer,
        tools,
        interpreter,
        planner,
    ));

    let app = api::router(AppState { orchestrator })
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            paysight_backend::middleware::logging::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-filter support.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paysight_backend=debug,paysight=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Anchor relative data paths to the crate directory so running from a
/// different working directory doesn't silently create a fresh database.
fn resolve_data_path(path: &str) -> String {
    let p = Path::new(path);
    if p.is_absolute() || path == ":memory:" {
        return path.to_string();
    }
    let base = std::env::var("PAYSIGHT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")));
    base.join(p).to_string_lossy().into_owned()
}
