//! Current-readings endpoint for the gasflow backend.
//!
//! Serves the full exported reading set — the five balance-page fields,
//! yesterday's settled recharge total, and the derived daily cost — as one
//! JSON array, each entry tagged with its unit and accumulation kind. A
//! sibling module in the `routes` directory following the Explicit Module
//! Boundary Pattern (EMBP): only the subrouter is exported to the gateway.

use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get, Json,
    Router,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::models::{Reading, BALANCE_READINGS, COST_READING, RECHARGE_READING};
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/readings", get(handler))
}

/// Query parameters for the readings endpoint.
#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    /// Force an on-demand refresh of both coordinators before reading.
    refresh: Option<bool>,
}

async fn handler(
    Query(params): Query<ReadingsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // ---
    info!("GET /readings");

    if params.refresh.unwrap_or(false) {
        // On-demand refreshes share the coordinators' single-flight
        // discipline; the two series are independent and may overlap
        let (balance, recharge) =
            tokio::join!(state.balance.refresh(), state.recharge.refresh());
        if let Err(e) = balance {
            warn!("On-demand balance refresh failed: {}", e);
        }
        if let Err(e) = recharge {
            warn!("On-demand recharge refresh failed: {}", e);
        }
        state.engine.tick().await;
    }

    let readings = assemble_readings(&state);
    info!("Returning {} readings", readings.len());
    (StatusCode::OK, Json(readings)).into_response()
}

/// Build the exported reading set from the coordinator caches and the
/// engine's latest published cost.
fn assemble_readings(state: &AppState) -> Vec<Reading> {
    // ---
    let snapshot = state.balance.current();
    if let Some(s) = snapshot.as_ref() {
        tracing::debug!("Serving balance snapshot captured at {}", s.captured_at);
    }
    let mut readings: Vec<Reading> = BALANCE_READINGS
        .iter()
        .map(|(provider_key, spec)| {
            spec.with_value(snapshot.as_ref().and_then(|s| s.get(provider_key)))
        })
        .collect();

    let recharge = state.recharge.current();
    if let Some(r) = recharge.as_ref() {
        tracing::debug!(
            "Serving recharge total for {} captured at {}",
            r.date,
            r.captured_at
        );
    }
    readings.push(RECHARGE_READING.with_value(recharge.map(|r| r.total)));

    // The cost value is always computable (missing inputs degrade to 0);
    // the flag carries the real-zero vs no-data distinction
    let cost = state.engine.latest();
    let mut cost_reading = COST_READING.with_value(Some(cost.value));
    cost_reading.available = cost.available;
    readings.push(cost_reading);

    readings
}
