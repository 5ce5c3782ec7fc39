//! Per-gateway threshold registry.
//!
//! Each gateway starts **unloaded**. An unloaded gateway has no rule set at
//! all, which is different from a loaded gateway with zero rules: the
//! evaluator suspends on the former and evaluates (to nothing) on the latter.
//!
//! Rule sets are immutable once built and shared as `Arc<RuleSet>`. A reload
//! builds a fresh set and swaps it in under the write lock, so readers see
//! either the old set or the new one, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AlarmError, Result};
use crate::models::{Priority, ThresholdRule};

// ---

/// Supplier of threshold configuration, owned outside the core.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch every rule configured for `gateway_id`.
    async fn fetch_thresholds(&self, gateway_id: &str) -> Result<Vec<ThresholdRule>>;
}

/// Active rules for one gateway, keyed by category then subcategory.
#[derive(Debug, Default)]
pub struct RuleSet {
    // ---
    rules: HashMap<String, HashMap<String, ThresholdRule>>,
    len: usize,
}

impl RuleSet {
    /// Build a rule set. When a key repeats, the first rule wins.
    pub fn from_rules(gateway_id: &str, rules: Vec<ThresholdRule>) -> Self {
        // ---
        let mut set = RuleSet::default();
        for rule in rules {
            let subs = set.rules.entry(rule.category.clone()).or_default();
            if subs.contains_key(&rule.subcategory) {
                warn!(
                    "Duplicate threshold rule for {}/{}.{} ignored",
                    gateway_id, rule.category, rule.subcategory
                );
                continue;
            }
            subs.insert(rule.subcategory.clone(), rule);
            set.len += 1;
        }
        set
    }

    pub fn get(&self, category: &str, subcategory: &str) -> Option<&ThresholdRule> {
        self.rules.get(category)?.get(subcategory)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Holds the active rule set per gateway.
pub struct ThresholdRegistry {
    // ---
    source: Arc<dyn ConfigSource>,
    sets: RwLock<HashMap<String, Arc<RuleSet>>>,
    load_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ThresholdRegistry {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        // ---
        Self {
            source,
            sets: RwLock::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch and install the rule set for `gateway_id`.
    ///
    /// Loads for the same gateway are serialized; the last one to finish
    /// wins. On failure the previously installed set (if any) stays active.
    pub async fn load(&self, gateway_id: &str) -> Result<Arc<RuleSet>> {
        // ---
        let gate = {
            let mut locks = self.load_locks.lock().await;
            locks.entry(gateway_id.to_string()).or_default().clone()
        };
        let _guard = gate.lock().await;

        debug!("Loading thresholds for gateway {}", gateway_id);
        let rules = self.source.fetch_thresholds(gateway_id).await?;
        let set = Arc::new(RuleSet::from_rules(gateway_id, rules));

        self.sets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gateway_id.to_string(), set.clone());

        info!("Loaded {} threshold rules for gateway {}", set.len(), gateway_id);
        Ok(set)
    }

    pub fn is_loaded(&self, gateway_id: &str) -> bool {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(gateway_id)
    }

    /// The active rule set, or `None` while the gateway is unloaded.
    pub fn snapshot(&self, gateway_id: &str) -> Option<Arc<RuleSet>> {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gateway_id)
            .cloned()
    }

    /// Look up one rule. Absent for unknown keys and for unloaded gateways.
    pub fn lookup(
        &self,
        gateway_id: &str,
        category: &str,
        subcategory: &str,
    ) -> Option<ThresholdRule> {
        // ---
        self.snapshot(gateway_id)?
            .get(category, subcategory)
            .cloned()
    }

    pub fn loaded_gateways(&self) -> usize {
        self.sets.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// ---

/// Rule as served by the alarm settings API (no gateway id in the body).
#[derive(Debug, Deserialize)]
struct ThresholdSetting {
    category: String,
    subcategory: String,
    high: f64,
    low: f64,
    priority: Priority,
}

/// Fetches rules from `GET {base_url}?gatewayId=<id>`.
pub struct HttpConfigSource {
    // ---
    client: reqwest::Client,
    base_url: String,
}

impl HttpConfigSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        // ---
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch_thresholds(&self, gateway_id: &str) -> Result<Vec<ThresholdRule>> {
        // ---
        let load_err = |reason: String| AlarmError::ConfigLoad {
            gateway_id: gateway_id.to_string(),
            reason,
        };

        let settings: Vec<ThresholdSetting> = self
            .client
            .get(&self.base_url)
            .query(&[("gatewayId", gateway_id)])
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| load_err(e.to_string()))?
            .json()
            .await
            .map_err(|e| load_err(e.to_string()))?;

        Ok(settings
            .into_iter()
            .map(|s| ThresholdRule {
                gateway_id: gateway_id.to_string(),
                category: s.category,
                subcategory: s.subcategory,
                high: s.high,
                low: s.low,
                priority: s.priority,
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory config source; gateways without an entry fail to load.
    #[derive(Default)]
    pub(crate) struct StaticConfigSource {
        pub rules: std::sync::Mutex<HashMap<String, Vec<ThresholdRule>>>,
        pub calls: AtomicUsize,
    }

    impl StaticConfigSource {
        pub fn with(gateway_id: &str, rules: Vec<ThresholdRule>) -> Self {
            // ---
            let source = Self::default();
            source.set(gateway_id, rules);
            source
        }

        pub fn set(&self, gateway_id: &str, rules: Vec<ThresholdRule>) {
            self.rules
                .lock()
                .unwrap()
                .insert(gateway_id.to_string(), rules);
        }
    }

    #[async_trait]
    impl ConfigSource for StaticConfigSource {
        async fn fetch_thresholds(&self, gateway_id: &str) -> Result<Vec<ThresholdRule>> {
            // ---
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rules
                .lock()
                .unwrap()
                .get(gateway_id)
                .cloned()
                .ok_or_else(|| AlarmError::ConfigLoad {
                    gateway_id: gateway_id.to_string(),
                    reason: "connection refused".to_string(),
                })
        }
    }

    pub(crate) fn rule(
        gateway_id: &str,
        category: &str,
        subcategory: &str,
        high: f64,
        low: f64,
        priority: Priority,
    ) -> ThresholdRule {
        // ---
        ThresholdRule {
            gateway_id: gateway_id.to_string(),
            category: category.to_string(),
            subcategory: subcategory.to_string(),
            high,
            low,
            priority,
        }
    }

    #[tokio::test]
    async fn test_unloaded_gateway_has_no_rules() {
        // ---
        let source = StaticConfigSource::with("gw-1", vec![rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High)]);
        let registry = ThresholdRegistry::new(Arc::new(source));

        assert!(!registry.is_loaded("gw-1"));
        assert!(registry.snapshot("gw-1").is_none());
        assert!(registry.lookup("gw-1", "temp", "core").is_none());
    }

    #[tokio::test]
    async fn test_load_then_lookup() {
        // ---
        let source = StaticConfigSource::with(
            "gw-1",
            vec![
                rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High),
                rule("gw-1", "humidity", "rh", 90.0, 10.0, Priority::Low),
            ],
        );
        let registry = ThresholdRegistry::new(Arc::new(source));

        let set = registry.load("gw-1").await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(registry.is_loaded("gw-1"));
        assert_eq!(registry.loaded_gateways(), 1);

        let found = registry.lookup("gw-1", "temp", "core").unwrap();
        assert_eq!(found.high, 80.0);
        assert!(registry.lookup("gw-1", "temp", "skin").is_none());
        assert!(registry.lookup("gw-2", "temp", "core").is_none());
    }

    #[tokio::test]
    async fn test_empty_rule_set_still_counts_as_loaded() {
        // ---
        let registry = ThresholdRegistry::new(Arc::new(StaticConfigSource::with("gw-1", vec![])));
        registry.load("gw-1").await.unwrap();

        assert!(registry.is_loaded("gw-1"));
        assert!(registry.snapshot("gw-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_initial_load_leaves_gateway_unloaded() {
        // ---
        let registry = ThresholdRegistry::new(Arc::new(StaticConfigSource::default()));

        let err = registry.load("gw-9").await.unwrap_err();
        assert!(matches!(err, AlarmError::ConfigLoad { .. }));
        assert!(!registry.is_loaded("gw-9"));
    }

    #[tokio::test]
    async fn test_reload_replaces_whole_set() {
        // ---
        let source = Arc::new(StaticConfigSource::with(
            "gw-1",
            vec![rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High)],
        ));
        let registry = ThresholdRegistry::new(source.clone());
        registry.load("gw-1").await.unwrap();
        let before = registry.snapshot("gw-1").unwrap();

        source.set(
            "gw-1",
            vec![rule("gw-1", "pressure", "inlet", 5.0, 1.0, Priority::Medium)],
        );
        registry.load("gw-1").await.unwrap();

        assert!(registry.lookup("gw-1", "temp", "core").is_none());
        assert!(registry.lookup("gw-1", "pressure", "inlet").is_some());
        // an earlier snapshot is unaffected by the swap
        assert!(before.get("temp", "core").is_some());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_set() {
        // ---
        let source = Arc::new(StaticConfigSource::with(
            "gw-1",
            vec![rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High)],
        ));
        let registry = ThresholdRegistry::new(source.clone());
        registry.load("gw-1").await.unwrap();

        source.rules.lock().unwrap().clear();
        assert!(registry.load("gw-1").await.is_err());
        assert!(registry.lookup("gw-1", "temp", "core").is_some());
    }

    #[test]
    fn test_duplicate_key_keeps_first_rule() {
        // ---
        let set = RuleSet::from_rules(
            "gw-1",
            vec![
                rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High),
                rule("gw-1", "temp", "core", 50.0, 0.0, Priority::Low),
            ],
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("temp", "core").unwrap().priority, Priority::High);
    }

    #[tokio::test]
    async fn test_concurrent_loads_serialize() {
        // ---
        let source = Arc::new(StaticConfigSource::with(
            "gw-1",
            vec![rule("gw-1", "temp", "core", 80.0, -10.0, Priority::High)],
        ));
        let registry = Arc::new(ThresholdRegistry::new(source.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.load("gw-1").await })
            })
            .collect();
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 8);
        assert_eq!(registry.snapshot("gw-1").unwrap().len(), 1);
    }
}
