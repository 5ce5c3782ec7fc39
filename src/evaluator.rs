//! Reading evaluation.
//!
//! Turns one [`Reading`] into the alarm events it triggers. No I/O, no
//! blocking, no side effects. Events come out in the reading's map order:
//! categories lexicographically, then subcategories lexicographically. The
//! store's insertion order for same-timestamp alarms follows from this.

use crate::models::{AlarmEvent, Reading};
use crate::registry::{RuleSet, ThresholdRegistry};

// ---

/// Evaluate `reading` against the gateway's active rules.
///
/// Returns an empty sequence when the gateway is not loaded. Callers that
/// need to tell "not loaded" apart from "no violations" check
/// [`ThresholdRegistry::is_loaded`] first.
pub fn evaluate(reading: &Reading, registry: &ThresholdRegistry) -> Vec<AlarmEvent> {
    // ---
    match registry.snapshot(&reading.gateway_id) {
        Some(rules) => evaluate_with(reading, &rules),
        None => Vec::new(),
    }
}

/// Evaluate `reading` against a fixed rule set.
pub fn evaluate_with(reading: &Reading, rules: &RuleSet) -> Vec<AlarmEvent> {
    // ---
    let mut events = Vec::new();

    for (category, subs) in &reading.data {
        for (subcategory, &value) in subs {
            let Some(rule) = rules.get(category, subcategory) else {
                continue;
            };
            if !rule.is_violated_by(value) {
                continue;
            }

            tracing::debug!(
                "Alarm {}/{}.{} value={} bounds=[{}, {}] priority={}",
                reading.gateway_id,
                category,
                subcategory,
                value,
                rule.low,
                rule.high,
                rule.priority
            );

            events.push(AlarmEvent {
                gateway_id: reading.gateway_id.clone(),
                timestamp: reading.timestamp,
                category: category.clone(),
                subcategory: subcategory.clone(),
                value,
                priority: rule.priority,
            });
        }
    }

    events
}
