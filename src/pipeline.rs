//! Per-gateway alarm pipeline.
//!
//! Registry -> evaluator -> coordinator, one gateway lane at a time. Each
//! gateway has a lane mutex held while a reading is evaluated and its alarms
//! are published, so readings for one gateway are handled strictly in
//! arrival order while different gateways proceed concurrently.
//!
//! Readings that arrive while the gateway's thresholds are not loaded are
//! never evaluated against an empty rule set. Depending on
//! [`SuspendPolicy`] they are dropped or parked in the lane's backlog and
//! replayed, in order, right after the next successful load.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::AlarmFeedCoordinator;
use crate::error::Result;
use crate::evaluator::evaluate_with;
use crate::models::Reading;
use crate::registry::ThresholdRegistry;
use crate::source::ReadingSource;

// ---

/// Handling of readings for gateways whose thresholds are not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendPolicy {
    #[default]
    Drop,
    /// Keep up to `capacity` readings (oldest evicted first) for replay.
    Buffer { capacity: usize },
}

/// What happened to one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingOutcome {
    Evaluated { alarms: usize, persisted: usize },
    Buffered,
    Dropped,
}

type Lane = Arc<Mutex<VecDeque<Reading>>>;

pub struct AlarmPipeline {
    // ---
    registry: Arc<ThresholdRegistry>,
    coordinator: Arc<AlarmFeedCoordinator>,
    policy: SuspendPolicy,
    lanes: Mutex<HashMap<String, Lane>>,
}

impl AlarmPipeline {
    pub fn new(
        registry: Arc<ThresholdRegistry>,
        coordinator: Arc<AlarmFeedCoordinator>,
        policy: SuspendPolicy,
    ) -> Self {
        // ---
        Self {
            registry,
            coordinator,
            policy,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ThresholdRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<AlarmFeedCoordinator> {
        &self.coordinator
    }

    async fn lane(&self, gateway_id: &str) -> Lane {
        // ---
        self.lanes
            .lock()
            .await
            .entry(gateway_id.to_string())
            .or_default()
            .clone()
    }

    /// Load (or reload) thresholds for `gateway_id`, then replay its backlog.
    ///
    /// Returns the number of active rules. A failure is reported to the
    /// gateway's subscribers as a load error.
    pub async fn load_gateway(&self, gateway_id: &str) -> Result<usize> {
        // ---
        let rules = match self.registry.load(gateway_id).await {
            Ok(rules) => rules,
            Err(e) => {
                error!("{}", e);
                self.coordinator
                    .report_load_error(gateway_id, &e.to_string())
                    .await;
                return Err(e);
            }
        };
        self.coordinator.clear_load_error(gateway_id).await;

        let lane = self.lane(gateway_id).await;
        let mut backlog = lane.lock().await;
        if !backlog.is_empty() {
            info!(
                "Replaying {} buffered readings for gateway {}",
                backlog.len(),
                gateway_id
            );
        }
        while let Some(reading) = backlog.pop_front() {
            self.evaluate_and_publish(&reading).await;
        }

        Ok(rules.len())
    }

    /// Handle one reading for its gateway.
    pub async fn process(&self, reading: Reading) -> ReadingOutcome {
        // ---
        let lane = self.lane(&reading.gateway_id).await;
        let mut backlog = lane.lock().await;

        if !self.registry.is_loaded(&reading.gateway_id) {
            return self.suspend(&mut backlog, reading);
        }

        // a load may have landed between buffering and now
        while let Some(earlier) = backlog.pop_front() {
            self.evaluate_and_publish(&earlier).await;
        }
        self.evaluate_and_publish(&reading).await
    }

    /// Parse and handle one JSON reading. Malformed payloads are logged and
    /// rejected without affecting later readings.
    pub async fn process_json(&self, value: serde_json::Value) -> Result<ReadingOutcome> {
        // ---
        match Reading::from_json(value) {
            Ok(reading) => Ok(self.process(reading).await),
            Err(e) => {
                warn!("Skipping reading: {}", e);
                Err(e)
            }
        }
    }

    fn suspend(&self, backlog: &mut VecDeque<Reading>, reading: Reading) -> ReadingOutcome {
        // ---
        match self.policy {
            SuspendPolicy::Drop => {
                debug!(
                    "Thresholds for {} not loaded, dropping reading at {}",
                    reading.gateway_id, reading.timestamp
                );
                ReadingOutcome::Dropped
            }
            SuspendPolicy::Buffer { capacity } => {
                if capacity == 0 {
                    return ReadingOutcome::Dropped;
                }
                if backlog.len() >= capacity {
                    if let Some(evicted) = backlog.pop_front() {
                        warn!(
                            "Backlog for {} full, evicting reading at {}",
                            evicted.gateway_id, evicted.timestamp
                        );
                    }
                }
                backlog.push_back(reading);
                ReadingOutcome::Buffered
            }
        }
    }

    async fn evaluate_and_publish(&self, reading: &Reading) -> ReadingOutcome {
        // ---
        let Some(rules) = self.registry.snapshot(&reading.gateway_id) else {
            return ReadingOutcome::Dropped;
        };

        let events = evaluate_with(reading, &rules);
        let alarms = events.len();
        let mut persisted = 0;

        // sequential so that same-reading alarms keep their insertion order
        for event in events {
            match self.coordinator.publish(event).await {
                Ok(_) => persisted += 1,
                Err(e) => error!("Alarm for {} not persisted: {}", reading.gateway_id, e),
            }
        }

        if alarms > 0 {
            info!(
                "Reading {} at {}: {} alarms, {} persisted",
                reading.gateway_id, reading.timestamp, alarms, persisted
            );
        }
        ReadingOutcome::Evaluated { alarms, persisted }
    }

    /// Subscribe to `gateway_id` on `source` and spawn its worker.
    ///
    /// The worker loads thresholds if needed, then processes readings one at
    /// a time until the source closes the channel.
    pub async fn attach(
        self: &Arc<Self>,
        source: &dyn ReadingSource,
        gateway_id: &str,
    ) -> Result<JoinHandle<()>> {
        // ---
        let mut rx = source.subscribe(gateway_id).await?;
        let pipeline = Arc::clone(self);
        let gateway_id = gateway_id.to_string();

        Ok(tokio::spawn(async move {
            info!("Worker started for gateway {}", gateway_id);
            if !pipeline.registry.is_loaded(&gateway_id) {
                // failure is already reported; readings suspend until a reload
                let _ = pipeline.load_gateway(&gateway_id).await;
            }
            while let Some(reading) = rx.recv().await {
                pipeline.process(reading).await;
            }
            info!("Worker stopped for gateway {}", gateway_id);
        }))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::coordinator::CoordinatorSettings;
    use crate::models::{Measurements, Priority};
    use crate::registry::tests::{rule, StaticConfigSource};
    use crate::source::ChannelReadingSource;
    use crate::store::tests::{fast_retry, FlakyStore};
    use crate::store::{AlarmStore, MemoryAlarmStore};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        source: Arc<StaticConfigSource>,
        store: Arc<MemoryAlarmStore>,
        pipeline: Arc<AlarmPipeline>,
    }

    fn fixture(policy: SuspendPolicy, store: Arc<dyn AlarmStore>, inner: Arc<MemoryAlarmStore>) -> Fixture {
        // ---
        let source = Arc::new(StaticConfigSource::default());
        let registry = Arc::new(ThresholdRegistry::new(source.clone()));
        let coordinator = Arc::new(AlarmFeedCoordinator::new(
            store,
            CoordinatorSettings {
                page_size: 20,
                retry: fast_retry(3),
                ..CoordinatorSettings::default()
            },
        ));
        Fixture {
            source,
            store: inner,
            pipeline: Arc::new(AlarmPipeline::new(registry, coordinator, policy)),
        }
    }

    fn plain(policy: SuspendPolicy) -> Fixture {
        let store = Arc::new(MemoryAlarmStore::new());
        fixture(policy, store.clone(), store)
    }

    fn ts(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, second).unwrap()
    }

    fn reading(second: u32, pairs: &[(&str, &str, f64)]) -> Reading {
        // ---
        let mut data = Measurements::new();
        for (cat, sub, value) in pairs {
            data.entry(cat.to_string())
                .or_default()
                .insert(sub.to_string(), *value);
        }
        Reading {
            gateway_id: "gw-1".to_string(),
            timestamp: ts(second),
            data,
        }
    }

    fn core_rule() -> Vec<crate::models::ThresholdRule> {
        vec![rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High)]
    }

    async fn stored_count(f: &Fixture) -> u64 {
        f.store.query_page("gw-1", 1, 50).await.unwrap().total_count
    }

    #[tokio::test]
    async fn test_scenario_from_boundary_table() {
        // ---
        let f = plain(SuspendPolicy::Drop);
        f.source.set("gw-1", core_rule());
        f.pipeline.load_gateway("gw-1").await.unwrap();

        let hot = f.pipeline.process(reading(1, &[("temp", "core", 85.0)])).await;
        assert_eq!(hot, ReadingOutcome::Evaluated { alarms: 1, persisted: 1 });

        for value in [80.0, -10.0] {
            let outcome = f.pipeline.process(reading(2, &[("temp", "core", value)])).await;
            assert_eq!(outcome, ReadingOutcome::Evaluated { alarms: 0, persisted: 0 });
        }

        let unmatched = f.pipeline.process(reading(3, &[("humidity", "rh", 90.0)])).await;
        assert_eq!(unmatched, ReadingOutcome::Evaluated { alarms: 0, persisted: 0 });

        let page = f.store.query_page("gw-1", 1, 50).await.unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.records[0].event.value, 85.0);
        assert_eq!(page.records[0].event.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_unloaded_gateway_drops_and_writes_nothing() {
        // ---
        let f = plain(SuspendPolicy::Drop);
        f.source.set("gw-1", core_rule());

        let outcome = f.pipeline.process(reading(1, &[("temp", "core", 500.0)])).await;
        assert_eq!(outcome, ReadingOutcome::Dropped);
        assert_eq!(stored_count(&f).await, 0);

        // dropped readings are gone for good
        f.pipeline.load_gateway("gw-1").await.unwrap();
        assert_eq!(stored_count(&f).await, 0);
    }

    #[tokio::test]
    async fn test_buffered_readings_replay_in_order_after_load() {
        // ---
        let f = plain(SuspendPolicy::Buffer { capacity: 10 });
        f.source.set("gw-1", core_rule());

        for (second, value) in [(1, 90.0), (2, 20.0), (3, 95.0)] {
            let outcome = f.pipeline.process(reading(second, &[("temp", "core", value)])).await;
            assert_eq!(outcome, ReadingOutcome::Buffered);
        }
        assert_eq!(stored_count(&f).await, 0);

        f.pipeline.load_gateway("gw-1").await.unwrap();

        let page = f.store.query_page("gw-1", 1, 50).await.unwrap();
        let values: Vec<f64> = page.records.iter().map(|r| r.event.value).collect();
        assert_eq!(values, vec![95.0, 90.0]);
        assert!(page.records[0].seq > page.records[1].seq);
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest_when_full() {
        // ---
        let f = plain(SuspendPolicy::Buffer { capacity: 2 });
        f.source.set("gw-1", core_rule());

        for (second, value) in [(1, 81.0), (2, 82.0), (3, 83.0)] {
            f.pipeline.process(reading(second, &[("temp", "core", value)])).await;
        }
        f.pipeline.load_gateway("gw-1").await.unwrap();

        let page = f.store.query_page("gw-1", 1, 50).await.unwrap();
        let values: Vec<f64> = page.records.iter().map(|r| r.event.value).collect();
        assert_eq!(values, vec![83.0, 82.0]);
    }

    #[tokio::test]
    async fn test_load_failure_suspends_gateway_and_is_reported() {
        // ---
        let f = plain(SuspendPolicy::Drop);
        let sub = f.pipeline.coordinator().subscribe("gw-1").await;

        assert!(f.pipeline.load_gateway("gw-1").await.is_err());
        let view = f.pipeline.coordinator().current_page(&sub.handle).await.unwrap();
        assert!(matches!(view.status, crate::coordinator::FeedStatus::LoadError(_)));

        let outcome = f.pipeline.process(reading(1, &[("temp", "core", 500.0)])).await;
        assert_eq!(outcome, ReadingOutcome::Dropped);

        f.source.set("gw-1", core_rule());
        assert_eq!(f.pipeline.load_gateway("gw-1").await.unwrap(), 1);
        let view = f.pipeline.coordinator().current_page(&sub.handle).await.unwrap();
        assert!(!matches!(view.status, crate::coordinator::FeedStatus::LoadError(_)));
    }

    #[tokio::test]
    async fn test_failed_append_does_not_block_siblings_or_later_readings() {
        // ---
        let inner = Arc::new(MemoryAlarmStore::new());
        // first event burns 4 failures (1 + 3 retries), the rest succeed
        let flaky = Arc::new(FlakyStore::new(inner.clone(), 4));
        let f = fixture(SuspendPolicy::Drop, flaky, inner);
        f.source.set(
            "gw-1",
            vec![
                rule("gw-1", "temp", "ambient", 40.0, 0.0, Priority::Medium),
                rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High),
            ],
        );
        f.pipeline.load_gateway("gw-1").await.unwrap();

        let outcome = f
            .pipeline
            .process(reading(1, &[("temp", "ambient", 50.0), ("temp", "core", 90.0)]))
            .await;
        assert_eq!(outcome, ReadingOutcome::Evaluated { alarms: 2, persisted: 1 });

        let later = f.pipeline.process(reading(2, &[("temp", "core", 91.0)])).await;
        assert_eq!(later, ReadingOutcome::Evaluated { alarms: 1, persisted: 1 });
        assert_eq!(stored_count(&f).await, 2);
    }

    #[tokio::test]
    async fn test_same_reading_alarms_keep_insertion_order() {
        // ---
        let f = plain(SuspendPolicy::Drop);
        f.source.set(
            "gw-1",
            vec![
                rule("gw-1", "temp", "ambient", 40.0, 0.0, Priority::Medium),
                rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High),
            ],
        );
        f.pipeline.load_gateway("gw-1").await.unwrap();
        f.pipeline
            .process(reading(1, &[("temp", "core", 90.0), ("temp", "ambient", 50.0)]))
            .await;

        let page = f.store.query_page("gw-1", 1, 50).await.unwrap();
        let subs: Vec<&str> = page
            .records
            .iter()
            .map(|r| r.event.subcategory.as_str())
            .collect();
        // evaluated ambient then core; newest-first puts the later insert on top
        assert_eq!(subs, vec!["core", "ambient"]);
    }

    #[tokio::test]
    async fn test_malformed_json_is_skipped() {
        // ---
        let f = plain(SuspendPolicy::Drop);
        f.source.set("gw-1", core_rule());
        f.pipeline.load_gateway("gw-1").await.unwrap();

        let bad = json!({ "gatewayId": "gw-1", "timestamp": "2025-03-26T18:45:00Z", "data": "oops" });
        assert!(f.pipeline.process_json(bad).await.is_err());

        let good = json!({
            "gatewayId": "gw-1",
            "timestamp": "2025-03-26T18:45:01Z",
            "data": { "temp": { "core": 99 } }
        });
        tokio_test::assert_ok!(f.pipeline.process_json(good).await);
        assert_eq!(stored_count(&f).await, 1);
    }

    #[tokio::test]
    async fn test_attached_worker_loads_and_processes_in_order() {
        // ---
        let f = plain(SuspendPolicy::Buffer { capacity: 16 });
        f.source.set("gw-1", core_rule());
        let source = ChannelReadingSource::new(16);

        let worker = f.pipeline.attach(&source, "gw-1").await.unwrap();
        for (second, value) in [(1, 81.0), (2, 82.0), (3, 83.0)] {
            source.deliver(reading(second, &[("temp", "core", value)])).await.unwrap();
        }
        drop(source);
        worker.await.unwrap();

        let page = f.store.query_page("gw-1", 1, 50).await.unwrap();
        let values: Vec<f64> = page.records.iter().map(|r| r.event.value).collect();
        assert_eq!(values, vec![83.0, 82.0, 81.0]);
        assert!(f.pipeline.registry().is_loaded("gw-1"));
    }
}
