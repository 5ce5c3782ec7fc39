//! Alarm persistence contract.
//!
//! [`AlarmStore`] is the only durable surface of the engine. Two backends
//! implement it: [`PgAlarmStore`] for the service and [`MemoryAlarmStore`]
//! for tests and local runs. Both order query results by
//! `(timestamp desc, seq desc)`.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{AlarmError, Result};
use crate::models::{AlarmEvent, AlarmRecord};

mod memory;
mod postgres;

pub use memory::MemoryAlarmStore;
pub use postgres::PgAlarmStore;

// ---

/// One page of alarm records for a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmPage {
    // ---
    pub records: Vec<AlarmRecord>,
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u32,
}

/// Durable, queryable alarm storage.
#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// Persist `event` under `request_id`.
    ///
    /// Repeating the call with the same `request_id` returns the record that
    /// was already stored. Distinct ids always create distinct records.
    async fn append(&self, request_id: Uuid, event: &AlarmEvent) -> Result<AlarmRecord>;

    /// Fetch page `page` (1-based) of the gateway's alarms, newest first.
    ///
    /// A page past the end yields no records; it is not an error.
    async fn query_page(&self, gateway_id: &str, page: u32, page_size: u32) -> Result<AlarmPage>;
}

/// `ceil(total_count / page_size)`.
pub fn total_pages(total_count: u64, page_size: u32) -> u32 {
    // ---
    if page_size == 0 {
        return 0;
    }
    total_count.div_ceil(u64::from(page_size)) as u32
}

pub(crate) fn check_page(page: u32, page_size: u32) -> Result<()> {
    // ---
    if page == 0 || page_size == 0 {
        return Err(AlarmError::InvalidPage { page, page_size });
    }
    Ok(())
}

// ---

/// Bounded exponential backoff for [`append_with_retry`].
///
/// `max_retries` counts retries after the first attempt, so the default of 3
/// allows 4 attempts in total. An append that fails three times and then
/// succeeds therefore stores exactly one record under the default policy.
/// `APPEND_MAX_RETRIES=3` means three retries, not three attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    // ---
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // ---
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        // ---
        let shift = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Append `event` under `request_id`, retrying failures with backoff.
///
/// Every attempt reuses the caller's request id, so an attempt that reached
/// the store but lost its acknowledgement is not written twice, and the
/// caller knows the record id before the first attempt lands.
pub async fn append_with_retry(
    store: &dyn AlarmStore,
    request_id: Uuid,
    event: &AlarmEvent,
    policy: &RetryPolicy,
) -> Result<AlarmRecord> {
    // ---
    let mut retry = 0;

    loop {
        match store.append(request_id, event).await {
            Ok(record) => {
                if retry > 0 {
                    tracing::info!(
                        "Alarm {} persisted after {} retries",
                        record.id,
                        retry
                    );
                }
                return Ok(record);
            }
            Err(e) if retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay_for(retry);
                tracing::warn!(
                    "Append for {}/{}.{} failed ({}), retry {}/{} in {:?}",
                    event.gateway_id,
                    event.category,
                    event.subcategory,
                    e,
                    retry,
                    policy.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(
                    "Giving up on alarm {}/{}.{} after {} attempts: {}",
                    event.gateway_id,
                    event.category,
                    event.subcategory,
                    retry + 1,
                    e
                );
                return Err(e);
            }
        }
    }
}
