//! Configuration loader for the `gasflow` backend service.
//!
//! This module centralizes all runtime configuration values and their
//! defaults, loading from environment variables (with optional `.env` file
//! support provided by the caller). By consolidating configuration logic
//! here, we avoid scattering `env::var` calls throughout the codebase.

use std::env;

use anyhow::{anyhow, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Read an optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

// ---

const DEFAULT_BALANCE_URL: &str =
    "http://qc.huayuanranqi.com/index.php?g=Wap&m=Index&a=balance_detail&sn=";
const DEFAULT_RECHARGE_LOG_URL: &str =
    "http://qc.huayuanranqi.com/index.php?g=Wap&m=Index&a=recharge_log&sn=";

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent
/// configuration snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Account serial number on the provider portal.
    pub sn: String,

    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Balance-detail page URL prefix; the serial number is appended.
    pub balance_url: String,

    /// Recharge-log page URL prefix; the serial number is appended.
    pub recharge_url: String,

    /// Provider scan cadence for both coordinators, in hours.
    pub scan_interval_hours: u32,

    /// Cost engine tick cadence, in seconds.
    pub cost_tick_secs: u32,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `GAS_SN` – account serial number
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BALANCE_URL` / `RECHARGE_LOG_URL` – provider endpoint overrides
/// - `SCAN_INTERVAL_HOURS` – provider scan cadence (default: 1)
/// - `COST_TICK_SECS` – cost engine tick cadence (default: 300)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let sn = require_env!("GAS_SN");
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let balance_url = env_or!("BALANCE_URL", DEFAULT_BALANCE_URL);
    let recharge_url = env_or!("RECHARGE_LOG_URL", DEFAULT_RECHARGE_LOG_URL);
    let scan_interval_hours = parse_env_u32!("SCAN_INTERVAL_HOURS", 1);
    let cost_tick_secs = parse_env_u32!("COST_TICK_SECS", 300);

    Ok(Config {
        sn,
        db_url,
        db_pool_max,
        balance_url,
        recharge_url,
        scan_interval_hours,
        cost_tick_secs,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information (the database password, most of the
    /// account serial) while showing all values that were loaded.
    pub fn log_config(&self) {
        // ---
        // Mask the password in the database URL for security
        let masked_db_url = if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                )
            } else {
                self.db_url.clone()
            }
        } else {
            self.db_url.clone()
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  GAS_SN              : {}", mask_sn(&self.sn));
        tracing::info!("  DATABASE_URL        : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX         : {}", self.db_pool_max);
        tracing::info!("  BALANCE_URL         : {}", self.balance_url);
        tracing::info!("  RECHARGE_LOG_URL    : {}", self.recharge_url);
        tracing::info!("  SCAN_INTERVAL_HOURS : {}", self.scan_interval_hours);
        tracing::info!("  COST_TICK_SECS      : {}", self.cost_tick_secs);
    }
}

/// Keep only the last four characters of the serial number visible.
fn mask_sn(sn: &str) -> String {
    // ---
    if sn.len() <= 4 {
        return "****".to_string();
    }
    let visible = &sn[sn.len() - 4..];
    format!("****{}", visible)
}

// ---
