//! Reading delivery.
//!
//! A [`ReadingSource`] hands out one ordered channel per gateway. How the
//! readings physically arrive is the source's business; the pipeline only
//! relies on per-gateway arrival order.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{AlarmError, Result};
use crate::models::Reading;

// ---

#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// Open the reading stream for `gateway_id`, replacing any earlier one.
    async fn subscribe(&self, gateway_id: &str) -> Result<mpsc::Receiver<Reading>>;
}

/// In-process source fed by [`deliver`](ChannelReadingSource::deliver),
/// e.g. from the HTTP ingest route.
pub struct ChannelReadingSource {
    // ---
    capacity: usize,
    senders: Mutex<HashMap<String, mpsc::Sender<Reading>>>,
}

impl ChannelReadingSource {
    pub fn new(capacity: usize) -> Self {
        // ---
        Self {
            capacity: capacity.max(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub async fn has_subscriber(&self, gateway_id: &str) -> bool {
        self.senders
            .lock()
            .await
            .get(gateway_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Queue `reading` on its gateway's channel, waiting if the queue is full.
    pub async fn deliver(&self, reading: Reading) -> Result<()> {
        // ---
        let gateway_id = reading.gateway_id.clone();
        let sender = self
            .senders
            .lock()
            .await
            .get(&gateway_id)
            .cloned()
            .ok_or_else(|| AlarmError::SourceClosed(gateway_id.clone()))?;

        if sender.send(reading).await.is_err() {
            tracing::warn!("Reading channel for {} closed, dropping it", gateway_id);
            self.senders.lock().await.remove(&gateway_id);
            return Err(AlarmError::SourceClosed(gateway_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingSource for ChannelReadingSource {
    async fn subscribe(&self, gateway_id: &str) -> Result<mpsc::Receiver<Reading>> {
        // ---
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.lock().await.insert(gateway_id.to_string(), tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Utc;

    fn reading(gateway_id: &str, value: f64) -> Reading {
        // ---
        let mut data = crate::models::Measurements::new();
        data.entry("temp".to_string())
            .or_default()
            .insert("core".to_string(), value);
        Reading {
            gateway_id: gateway_id.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    #[tokio::test]
    async fn test_delivery_preserves_order_per_gateway() {
        // ---
        let source = ChannelReadingSource::new(8);
        let mut rx = source.subscribe("gw-1").await.unwrap();

        for v in [1.0, 2.0, 3.0] {
            source.deliver(reading("gw-1", v)).await.unwrap();
        }

        for expected in [1.0, 2.0, 3.0] {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.data["temp"]["core"], expected);
        }
    }

    #[tokio::test]
    async fn test_delivery_without_subscriber_fails() {
        // ---
        let source = ChannelReadingSource::new(8);
        assert!(!source.has_subscriber("gw-1").await);
        assert_eq!(
            source.deliver(reading("gw-1", 1.0)).await.unwrap_err(),
            AlarmError::SourceClosed("gw-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_gateway() {
        // ---
        let source = ChannelReadingSource::new(8);
        let rx = source.subscribe("gw-1").await.unwrap();
        assert!(source.has_subscriber("gw-1").await);
        drop(rx);

        assert!(!source.has_subscriber("gw-1").await);
        assert!(source.deliver(reading("gw-1", 1.0)).await.is_err());
    }
}
