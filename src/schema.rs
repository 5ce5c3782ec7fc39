//! Database schema management for `codemetal-alarmflow`.
//!
//! Ensures the alarm table and its query index exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// `seq` is the insertion order used to break timestamp ties; `id` is the
/// request id chosen by the appender and makes replayed appends no-ops.
/// Safe to call on every startup; no-op if objects already exist.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alarm_records (
            seq            BIGSERIAL        PRIMARY KEY,
            id             UUID             NOT NULL UNIQUE,
            gateway_id     TEXT             NOT NULL,
            timestamp_utc  TIMESTAMPTZ      NOT NULL,
            category       TEXT             NOT NULL,
            subcategory    TEXT             NOT NULL,
            value          DOUBLE PRECISION NOT NULL,
            priority       TEXT             NOT NULL,
            created_at     TIMESTAMPTZ      NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Serves both the per-gateway count and the newest-first page scan
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alarm_records_gateway_recent
            ON alarm_records (gateway_id, timestamp_utc DESC, seq DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
