use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{check_page, total_pages, AlarmPage, AlarmStore};
use crate::error::Result;
use crate::models::{AlarmEvent, AlarmRecord};

// ---

/// Process-local alarm store.
#[derive(Default)]
pub struct MemoryAlarmStore {
    // ---
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: Vec<AlarmRecord>,
    next_seq: i64,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlarmStore for MemoryAlarmStore {
    async fn append(&self, request_id: Uuid, event: &AlarmEvent) -> Result<AlarmRecord> {
        // ---
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.records.iter().find(|r| r.id == request_id) {
            return Ok(existing.clone());
        }

        inner.next_seq += 1;
        let record = AlarmRecord {
            id: request_id,
            seq: inner.next_seq,
            event: event.clone(),
        };
        inner.records.push(record.clone());
        Ok(record)
    }

    async fn query_page(&self, gateway_id: &str, page: u32, page_size: u32) -> Result<AlarmPage> {
        // ---
        check_page(page, page_size)?;

        let inner = self.inner.lock().await;
        let mut matching: Vec<&AlarmRecord> = inner
            .records
            .iter()
            .filter(|r| r.event.gateway_id == gateway_id)
            .collect();
        matching.sort_by(|a, b| {
            b.event
                .timestamp
                .cmp(&a.event.timestamp)
                .then(b.seq.cmp(&a.seq))
        });

        let total_count = matching.len() as u64;
        let offset = (page as usize - 1).saturating_mul(page_size as usize);
        let records = matching
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .cloned()
            .collect();

        Ok(AlarmPage {
            records,
            page,
            page_size,
            total_count,
            total_pages: total_pages(total_count, page_size),
        })
    }
}
