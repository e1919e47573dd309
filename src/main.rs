//! Application entry point for the `gasflow` backend service.
//!
//! This binary orchestrates the full startup sequence for the prepaid gas
//! monitoring pipeline, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Restoring the persisted accrual anchor for the configured account
//! - Constructing the two refresh coordinators and the cost accrual engine
//!   and spawning their recurring loops
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! - `GAS_SN` (**required**) – account serial number on the provider portal
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `GASFLOW_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `GASFLOW_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP) by
//! delegating schema setup to `schema`, configuration parsing to `config`,
//! and route registration to `routes`.
use std::{env, io::IsTerminal, net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

mod config;
mod coordinator;
mod engine;
mod models;
mod routes;
mod schema;
mod source;
mod store;

pub use config::Config;

// These are not used everywhere here but they are re-exported for routes/*.rs,
// that way refactoring is easier since routes/*.rs do not need knowledge of the
// inner modules, only of their parent module (main.rs)
pub use coordinator::RefreshCoordinator;
pub use engine::CostAccrualEngine;
pub use models::AccrualState;
pub use source::{BalanceSource, RechargeSource};
pub use store::{PgStateStore, StateStore};

/// The concrete engine wiring used by the running service.
pub type GasCostEngine = CostAccrualEngine<BalanceSource, RechargeSource, PgStateStore>;

/// Shared state handed to the routes gateway: the two coordinators plus the
/// accrual engine, all explicitly constructed in `main` and passed by
/// reference — no process-wide registry.
#[derive(Clone)]
pub struct AppState {
    pub balance: Arc<RefreshCoordinator<BalanceSource>>,
    pub recharge: Arc<RefreshCoordinator<RechargeSource>>,
    pub engine: Arc<GasCostEngine>,
}

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database");

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store = PgStateStore::new(pool.clone(), cfg.sn.clone());
    let restored = match store.restore().await {
        Ok(state) => state,
        Err(e) => {
            // A failed restore degrades to a cold start, never a crash
            tracing::warn!("Could not restore accrual state, starting uninitialized: {}", e);
            AccrualState::default()
        }
    };

    let scan_period = Duration::from_secs(u64::from(cfg.scan_interval_hours) * 3600);
    let balance = Arc::new(RefreshCoordinator::new(
        "balance",
        BalanceSource::new(cfg.balance_url.clone()),
        cfg.sn.clone(),
        scan_period,
    ));
    let recharge = Arc::new(RefreshCoordinator::new(
        "recharge",
        RechargeSource::new(cfg.recharge_url.clone()),
        cfg.sn.clone(),
        scan_period,
    ));
    let engine = Arc::new(CostAccrualEngine::new(
        Arc::clone(&balance),
        Arc::clone(&recharge),
        store,
        restored,
    ));

    // Each coordinator polls on its own timer; the engine ticks on a third,
    // reading whatever the coordinators have cached
    Arc::clone(&balance).spawn_polling();
    Arc::clone(&recharge).spawn_polling();
    Arc::clone(&engine).spawn_ticking(Duration::from_secs(u64::from(cfg.cost_tick_secs)));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(AppState {
        balance,
        recharge,
        engine,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `GASFLOW_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `GASFLOW_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("GASFLOW_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to GASFLOW_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("GASFLOW_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
