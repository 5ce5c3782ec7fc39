use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{check_page, total_pages, AlarmPage, AlarmStore};
use crate::error::{AlarmError, Result};
use crate::models::{AlarmEvent, AlarmRecord};

// ---

/// Alarm store backed by the `alarm_records` table (see `schema.rs`).
#[derive(Clone)]
pub struct PgAlarmStore {
    // ---
    pool: PgPool,
}

impl PgAlarmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlarmRow {
    // ---
    id: Uuid,
    seq: i64,
    gateway_id: String,
    timestamp_utc: DateTime<Utc>,
    category: String,
    subcategory: String,
    value: f64,
    priority: String,
}

impl AlarmRow {
    fn into_record(self) -> std::result::Result<AlarmRecord, String> {
        // ---
        Ok(AlarmRecord {
            id: self.id,
            seq: self.seq,
            event: AlarmEvent {
                gateway_id: self.gateway_id,
                timestamp: self.timestamp_utc,
                category: self.category,
                subcategory: self.subcategory,
                value: self.value,
                priority: self.priority.parse()?,
            },
        })
    }
}

#[async_trait]
impl AlarmStore for PgAlarmStore {
    async fn append(&self, request_id: Uuid, event: &AlarmEvent) -> Result<AlarmRecord> {
        // ---
        // The no-op update makes a replayed request return the stored row.
        let row: AlarmRow = sqlx::query_as(
            r#"
            INSERT INTO alarm_records (
                id, gateway_id, timestamp_utc,
                category, subcategory, value, priority
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
            RETURNING id, seq, gateway_id, timestamp_utc,
                      category, subcategory, value, priority
            "#,
        )
        .bind(request_id)
        .bind(&event.gateway_id)
        .bind(event.timestamp)
        .bind(&event.category)
        .bind(&event.subcategory)
        .bind(event.value)
        .bind(event.priority.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AlarmError::StoreAppend(e.to_string()))?;

        row.into_record().map_err(AlarmError::StoreAppend)
    }

    async fn query_page(&self, gateway_id: &str, page: u32, page_size: u32) -> Result<AlarmPage> {
        // ---
        check_page(page, page_size)?;
        let query_err = |e: sqlx::Error| AlarmError::StoreQuery(e.to_string());

        // Count and rows come from one snapshot so total_pages matches the page.
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM alarm_records WHERE gateway_id = $1")
                .bind(gateway_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;

        let offset = i64::from(page - 1) * i64::from(page_size);
        let rows: Vec<AlarmRow> = sqlx::query_as(
            r#"
            SELECT id, seq, gateway_id, timestamp_utc,
                   category, subcategory, value, priority
              FROM alarm_records
             WHERE gateway_id = $1
             ORDER BY timestamp_utc DESC, seq DESC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(gateway_id)
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;

        let records = rows
            .into_iter()
            .map(AlarmRow::into_record)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AlarmError::StoreQuery)?;

        let total_count = total.max(0) as u64;
        Ok(AlarmPage {
            records,
            page,
            page_size,
            total_count,
            total_pages: total_pages(total_count, page_size),
        })
    }
}
