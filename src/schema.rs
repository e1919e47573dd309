//! Database schema management for `gasflow`.
//!
//! Ensures the accrual-state table exists before the pipeline starts.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// One row per account: the anchor pair the cost accrual must recover
/// after a restart. Both anchor columns are nullable text on purpose —
/// restore degrades a malformed field to absent rather than failing the
/// record (see `store::decode_state`).
///
/// Safe to call on every startup; no-op if the table already exists.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accrual_state (
            account_sn     TEXT PRIMARY KEY,
            anchor_balance TEXT,
            anchor_date    TEXT,
            updated_at     TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
