//! Data models for the alarm engine.
//!
//! Wire shapes use camelCase field names so that gateway payloads and the
//! alarm settings API can be consumed without translation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AlarmError;

// ---

/// Category -> subcategory -> measured value.
///
/// `BTreeMap` fixes the evaluation order: categories in lexicographic order,
/// and within each category, subcategories in lexicographic order.
pub type Measurements = BTreeMap<String, BTreeMap<String, f64>>;

/// Severity copied from the rule that triggered an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let s = match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "High" => Ok(Priority::High),
            "Medium" => Ok(Priority::Medium),
            "Low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Configured bounds for one `(gateway, category, subcategory)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRule {
    // ---
    pub gateway_id: String,
    pub category: String,
    pub subcategory: String,
    pub high: f64,
    pub low: f64,
    pub priority: Priority,
}

impl ThresholdRule {
    /// True when `value` lies strictly outside `[low, high]`.
    ///
    /// Values equal to either bound are not violations.
    pub fn is_violated_by(&self, value: f64) -> bool {
        // ---
        value > self.high || value < self.low
    }
}

/// Reading as delivered by a gateway, before the `data` shape is checked.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    // ---
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// One timestamped snapshot of measurements from a gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    // ---
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Measurements,
}

impl TryFrom<RawReading> for Reading {
    type Error = AlarmError;

    /// Validate the nested `data` object.
    ///
    /// Any non-object category or non-numeric leaf rejects the whole reading.
    fn try_from(raw: RawReading) -> Result<Self, Self::Error> {
        // ---
        if raw.gateway_id.trim().is_empty() {
            return Err(AlarmError::MalformedReading("empty gatewayId".into()));
        }

        let categories = raw.data.as_object().ok_or_else(|| {
            AlarmError::MalformedReading(format!("data is not an object: {}", raw.data))
        })?;

        let mut data = Measurements::new();
        for (category, sub_obj) in categories {
            let subs = sub_obj.as_object().ok_or_else(|| {
                AlarmError::MalformedReading(format!("category '{category}' is not an object"))
            })?;

            let mut values = BTreeMap::new();
            for (subcategory, value) in subs {
                let value = value.as_f64().ok_or_else(|| {
                    AlarmError::MalformedReading(format!(
                        "{category}.{subcategory} is not a number: {value}"
                    ))
                })?;
                values.insert(subcategory.clone(), value);
            }
            data.insert(category.clone(), values);
        }

        Ok(Reading {
            gateway_id: raw.gateway_id,
            timestamp: raw.timestamp,
            data,
        })
    }
}

impl Reading {
    /// Parse a reading straight from a JSON payload.
    pub fn from_json(value: serde_json::Value) -> Result<Self, AlarmError> {
        // ---
        let raw: RawReading = serde_json::from_value(value)
            .map_err(|e| AlarmError::MalformedReading(e.to_string()))?;
        Reading::try_from(raw)
    }
}

/// A threshold violation that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    // ---
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub subcategory: String,
    pub value: f64,
    pub priority: Priority,
}

/// Durable form of an [`AlarmEvent`].
///
/// `seq` is the store's insertion order, the tiebreaker for equal timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecord {
    // ---
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub seq: i64,
    #[serde(flatten)]
    pub event: AlarmEvent,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn rule(high: f64, low: f64) -> ThresholdRule {
        // ---
        ThresholdRule {
            gateway_id: "gw-1".to_string(),
            category: "temp".to_string(),
            subcategory: "core".to_string(),
            high,
            low,
            priority: Priority::High,
        }
    }

    #[test]
    fn test_bounds_are_exclusive() {
        // ---
        let r = rule(80.0, -10.0);
        assert!(r.is_violated_by(85.0));
        assert!(r.is_violated_by(-10.5));
        assert!(!r.is_violated_by(80.0));
        assert!(!r.is_violated_by(-10.0));
        assert!(!r.is_violated_by(20.0));
    }

    #[test]
    fn test_reading_parses_nested_data() {
        // ---
        let reading = Reading::from_json(json!({
            "gatewayId": "gw-1",
            "timestamp": "2025-03-26T18:45:00Z",
            "data": { "temp": { "core": 85, "skin": 31.5 }, "humidity": { "rh": 40 } }
        }))
        .unwrap();

        assert_eq!(reading.gateway_id, "gw-1");
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap()
        );
        assert_eq!(reading.data["temp"]["core"], 85.0);
        assert_eq!(reading.data["temp"]["skin"], 31.5);

        let order: Vec<&str> = reading.data.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["humidity", "temp"]);
    }

    #[test]
    fn test_malformed_shapes_are_rejected() {
        // ---
        let base = |data: serde_json::Value| {
            json!({ "gatewayId": "gw-1", "timestamp": "2025-03-26T18:45:00Z", "data": data })
        };

        for data in [
            json!([1, 2, 3]),
            json!({ "temp": 42 }),
            json!({ "temp": { "core": "hot" } }),
            json!({ "temp": { "core": null } }),
        ] {
            let err = Reading::from_json(base(data.clone())).unwrap_err();
            assert!(
                matches!(err, AlarmError::MalformedReading(_)),
                "expected malformed for {data}"
            );
        }

        let missing_ts = json!({ "gatewayId": "gw-1", "data": {} });
        assert!(Reading::from_json(missing_ts).is_err());

        let blank_gateway = json!({ "gatewayId": " ", "timestamp": "2025-03-26T18:45:00Z", "data": {} });
        assert!(Reading::from_json(blank_gateway).is_err());
    }

    #[test]
    fn test_priority_text_round_trip() {
        // ---
        for p in [Priority::High, Priority::Medium, Priority::Low] {
            assert_eq!(p.to_string().parse::<Priority>().unwrap(), p);
        }
        assert!("Critical".parse::<Priority>().is_err());
    }

    #[test]
    fn test_record_serializes_flat_with_id() {
        // ---
        let record = AlarmRecord {
            id: Uuid::nil(),
            seq: 7,
            event: AlarmEvent {
                gateway_id: "gw-1".to_string(),
                timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
                category: "temp".to_string(),
                subcategory: "core".to_string(),
                value: 85.0,
                priority: Priority::High,
            },
        };

        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["_id"], json!(Uuid::nil()));
        assert_eq!(v["gatewayId"], "gw-1");
        assert_eq!(v["priority"], "High");
        assert_eq!(v["seq"], 7);
    }
}
