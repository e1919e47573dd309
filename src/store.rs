//! Durable storage for the accrual anchor state.
//!
//! The engine only depends on the two-method [`StateStore`] contract:
//! restore once at startup, save on every rollover. The production backend
//! is one PostgreSQL row per account, written through the pool the rest of
//! the service already holds. Anchor fields are stored as nullable text so
//! a malformed value degrades that field alone on restore instead of
//! failing the whole record.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use thiserror::Error;

use crate::models::AccrualState;

// ---

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Restore-on-start, save-on-change persistence for [`AccrualState`].
///
/// `save` is called whenever the anchor changes; the write is expected to
/// be durable when the call returns, best-effort beyond that (last write
/// wins, no crash-atomicity assumed).
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn restore(&self) -> Result<AccrualState, StoreError>;

    async fn save(&self, state: &AccrualState) -> Result<(), StoreError>;
}

// ---

/// PostgreSQL-backed state store, one `accrual_state` row per account.
pub struct PgStateStore {
    // ---
    pool: PgPool,
    sn: String,
}

impl PgStateStore {
    pub fn new(pool: PgPool, sn: impl Into<String>) -> Self {
        // ---
        Self { pool, sn: sn.into() }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn restore(&self) -> Result<AccrualState, StoreError> {
        // ---
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT anchor_balance, anchor_date
            FROM accrual_state
            WHERE account_sn = $1
            "#,
        )
        .bind(&self.sn)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((balance, date)) => decode_state(balance.as_deref(), date.as_deref()),
            None => AccrualState::default(),
        })
    }

    async fn save(&self, state: &AccrualState) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO accrual_state (account_sn, anchor_balance, anchor_date, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (account_sn) DO UPDATE SET
                anchor_balance = EXCLUDED.anchor_balance,
                anchor_date = EXCLUDED.anchor_date,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.sn)
        .bind(state.anchor_balance.map(|v| v.to_string()))
        .bind(state.anchor_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---

/// Decode the stored anchor fields, degrading each one to absent on a
/// parse failure. A half-restored state re-anchors on the next tick, which
/// beats refusing to start over one corrupt value.
fn decode_state(balance: Option<&str>, date: Option<&str>) -> AccrualState {
    // ---
    let anchor_balance = balance.and_then(|raw| match raw.trim().parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Stored anchor balance {:?} is not a number, discarding", raw);
            None
        }
    });

    let anchor_date = date.and_then(|raw| {
        match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("Stored anchor date {:?} is not a date, discarding", raw);
                None
            }
        }
    });

    AccrualState {
        anchor_balance,
        anchor_date,
    }
}

// ---
