//! Service facade used by the HTTP routes.
//!
//! Owns the in-process reading source and makes sure every gateway that
//! sends a reading has exactly one live worker draining its channel. Also
//! opens, reads and closes alarm feeds on the pipeline's coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::coordinator::{FeedView, Subscription, SubscriptionHandle};
use crate::error::Result;
use crate::models::Reading;
use crate::pipeline::AlarmPipeline;
use crate::source::ChannelReadingSource;
use crate::store::AlarmPage;

// ---

pub struct AlarmService {
    // ---
    pipeline: Arc<AlarmPipeline>,
    source: Arc<ChannelReadingSource>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AlarmService {
    pub fn new(pipeline: Arc<AlarmPipeline>, source: Arc<ChannelReadingSource>) -> Self {
        // ---
        Self {
            pipeline,
            source,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<AlarmPipeline> {
        &self.pipeline
    }

    /// Queue a validated reading on its gateway's worker, starting the
    /// worker (and its initial threshold load) on first sight.
    pub async fn ingest(&self, reading: Reading) -> Result<()> {
        // ---
        {
            let mut workers = self.workers.lock().await;
            let running = workers
                .get(&reading.gateway_id)
                .is_some_and(|w| !w.is_finished());
            if !running || !self.source.has_subscriber(&reading.gateway_id).await {
                let worker = self
                    .pipeline
                    .attach(self.source.as_ref(), &reading.gateway_id)
                    .await?;
                workers.insert(reading.gateway_id.clone(), worker);
            }
        }
        self.source.deliver(reading).await
    }

    /// Reload thresholds for `gateway_id`; returns the active rule count.
    pub async fn reload(&self, gateway_id: &str) -> Result<usize> {
        self.pipeline.load_gateway(gateway_id).await
    }

    pub async fn alarm_page(&self, gateway_id: &str, page: u32, page_size: u32) -> Result<AlarmPage> {
        // ---
        self.pipeline
            .coordinator()
            .store()
            .query_page(gateway_id, page, page_size)
            .await
    }

    pub fn loaded_gateways(&self) -> usize {
        self.pipeline.registry().loaded_gateways()
    }

    // ---

    /// Subscribe to `gateway_id` and sync the new view with the store.
    ///
    /// A failed first query still opens the feed; its view reports the
    /// error as [`FeedStatus::LoadError`](crate::FeedStatus::LoadError).
    pub async fn open_feed(&self, gateway_id: &str) -> Result<(Subscription, FeedView)> {
        // ---
        let coordinator = self.pipeline.coordinator();
        let subscription = coordinator.subscribe(gateway_id).await;
        let view = self.synced_view(&subscription.handle).await?;
        Ok((subscription, view))
    }

    /// Page `page` of an open feed. Page 1 is the merged live view; later
    /// pages come from the store, falling back to the last fetched copy.
    pub async fn feed_page(&self, id: Uuid, page: u32) -> Result<FeedView> {
        // ---
        let coordinator = self.pipeline.coordinator();
        let handle = coordinator.handle(id).await?;
        if page <= 1 {
            return coordinator.current_page(&handle).await;
        }

        match coordinator.fetch_page(&handle, page).await {
            Ok(view) => Ok(view),
            Err(e) => match coordinator.cached_page(&handle, page).await? {
                Some(cached) => {
                    warn!("Serving cached page {} for {}: {}", page, handle.gateway_id(), e);
                    Ok(cached)
                }
                None => Err(e),
            },
        }
    }

    /// Re-sync page 1 of an open feed with the store.
    pub async fn refresh_feed(&self, id: Uuid) -> Result<FeedView> {
        // ---
        let handle = self.pipeline.coordinator().handle(id).await?;
        self.synced_view(&handle).await
    }

    /// Close an open feed; later calls with `id` fail as unknown.
    pub async fn close_feed(&self, id: Uuid) -> Result<()> {
        // ---
        let coordinator = self.pipeline.coordinator();
        let handle = coordinator.handle(id).await?;
        coordinator.unsubscribe(&handle).await;
        Ok(())
    }

    pub async fn feed_subscribers(&self) -> usize {
        self.pipeline.coordinator().total_subscribers().await
    }

    async fn synced_view(&self, handle: &SubscriptionHandle) -> Result<FeedView> {
        // ---
        let coordinator = self.pipeline.coordinator();
        match coordinator.refresh(handle).await {
            Ok(view) => Ok(view),
            // the view keeps its previous page and reports the query error
            Err(_) => coordinator.current_page(handle).await,
        }
    }
}
