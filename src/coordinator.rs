//! Alarm feed coordinator.
//!
//! Each subscriber gets its own view state: the live alarms pushed since it last
//! synced with the store, plus the store pages it has fetched. The page-1
//! view is the live list (newest first) followed by the stored head page,
//! with any record that is in both shown once.
//!
//! Live alarms enter as [`Confirmation::Pending`] and only become
//! [`Confirmation::Confirmed`] once the store append has succeeded. A
//! failed append either leaves the entry as [`Confirmation::Unconfirmed`]
//! or removes it, per [`FailurePolicy`]. Pages beyond the first are never
//! touched by live traffic.
//!
//! Every live entry is keyed by the request id its append runs under, which
//! is also the id of the stored record. A refresh that already sees the
//! record replaces the live copy with the stored row, whatever state the
//! live copy is in, so an alarm never shows twice.
//!
//! Views are only mutated through the coordinator's methods, each under the
//! view's own mutex. No lock is held across store I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AlarmError, Result};
use crate::models::{AlarmEvent, AlarmRecord};
use crate::store::{append_with_retry, total_pages, AlarmPage, AlarmStore, RetryPolicy};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

// ---

/// Identifies one subscriber's view of one gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    // ---
    id: Uuid,
    gateway_id: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }
}

/// A new subscription: the handle plus its push channel.
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub updates: broadcast::Receiver<FeedUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    Pending,
    Confirmed,
    Unconfirmed,
}

/// One row of a feed view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    // ---
    /// Stable key for the row: the id the alarm is (or will be) stored under.
    pub key: Uuid,
    /// Set once the store has acknowledged the record.
    pub record_id: Option<Uuid>,
    pub seq: Option<i64>,
    pub event: AlarmEvent,
    pub confirmation: Confirmation,
}

impl FeedEntry {
    fn from_record(record: &AlarmRecord) -> Self {
        // ---
        Self {
            key: record.id,
            record_id: Some(record.id),
            seq: Some(record.seq),
            event: record.event.clone(),
            confirmation: Confirmation::Confirmed,
        }
    }

    fn is_settled(&self) -> bool {
        self.confirmation == Confirmation::Confirmed
    }
}

/// Push notifications delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedUpdate {
    Pending(FeedEntry),
    Confirmed(FeedEntry),
    Unconfirmed(FeedEntry),
    Removed { key: Uuid },
}

/// What the subscriber should be told about the view as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum FeedStatus {
    /// Nothing fetched from the store yet and no live alarms.
    Loading,
    /// Synced and there are no alarms.
    Empty,
    Ready,
    /// At least one live alarm is not (yet) durable.
    PendingConfirmation,
    LoadError(String),
}

/// A page as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedView {
    // ---
    pub gateway_id: String,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub entries: Vec<FeedEntry>,
    pub status: FeedStatus,
}

/// What to do with a live alarm whose append exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep it in the view, flagged unconfirmed.
    #[default]
    KeepUnconfirmed,
    Remove,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    // ---
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub on_append_failure: FailurePolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        // ---
        Self {
            page_size: 20,
            retry: RetryPolicy::default(),
            on_append_failure: FailurePolicy::default(),
        }
    }
}

// ---

struct ViewState {
    // ---
    gateway_id: String,
    page_size: u32,
    /// Newest first.
    live: VecDeque<FeedEntry>,
    head: Option<AlarmPage>,
    /// Appends confirmed here since `head` was fetched; trimming keeps it.
    confirmed_since_sync: u64,
    pages: HashMap<u32, AlarmPage>,
    load_error: Option<String>,
    query_error: Option<String>,
    updates: broadcast::Sender<FeedUpdate>,
}

impl ViewState {
    fn new(gateway_id: &str, page_size: u32, updates: broadcast::Sender<FeedUpdate>) -> Self {
        // ---
        Self {
            gateway_id: gateway_id.to_string(),
            page_size,
            live: VecDeque::new(),
            head: None,
            confirmed_since_sync: 0,
            pages: HashMap::new(),
            load_error: None,
            query_error: None,
            updates,
        }
    }

    fn notify(&self, update: FeedUpdate) {
        // no receivers is fine; the view itself stays authoritative
        let _ = self.updates.send(update);
    }

    fn push_live(&mut self, key: Uuid, event: AlarmEvent) {
        // ---
        let entry = FeedEntry {
            key,
            record_id: None,
            seq: None,
            event,
            confirmation: Confirmation::Pending,
        };
        self.live.push_front(entry.clone());
        self.notify(FeedUpdate::Pending(entry));
    }

    fn confirm(&mut self, key: Uuid, record: &AlarmRecord) {
        // ---
        let Some(entry) = self.live.iter_mut().find(|e| e.key == key) else {
            return;
        };
        entry.record_id = Some(record.id);
        entry.seq = Some(record.seq);
        entry.confirmation = Confirmation::Confirmed;
        let update = FeedUpdate::Confirmed(entry.clone());
        self.confirmed_since_sync += 1;
        self.notify(update);
        self.trim_live();
    }

    fn fail(&mut self, key: Uuid, policy: FailurePolicy) {
        // ---
        let Some(pos) = self.live.iter().position(|e| e.key == key) else {
            return;
        };
        match policy {
            FailurePolicy::KeepUnconfirmed => {
                self.live[pos].confirmation = Confirmation::Unconfirmed;
                let update = FeedUpdate::Unconfirmed(self.live[pos].clone());
                self.notify(update);
            }
            FailurePolicy::Remove => {
                self.live.remove(pos);
                self.notify(FeedUpdate::Removed { key });
            }
        }
    }

    /// Drop the oldest confirmed live entries beyond one page; they are in the store.
    fn trim_live(&mut self) {
        // ---
        while self.live.len() > self.page_size as usize {
            match self.live.iter().rposition(FeedEntry::is_settled) {
                Some(pos) => {
                    self.live.remove(pos);
                }
                None => break,
            }
        }
    }

    /// Install a freshly queried head page.
    ///
    /// Live entries whose key the page already contains are dropped in any
    /// state; the stored row replaces them. Confirmed entries that sort below
    /// the last row of a full page are owned by the store as well. Pending
    /// and unconfirmed entries the page has not seen stay.
    fn reconcile(&mut self, page: AlarmPage) {
        // ---
        let fetched: HashSet<Uuid> = page.records.iter().map(|r| r.id).collect();
        let cutoff = if page.records.len() as u32 >= self.page_size {
            page.records
                .last()
                .map(|r| (r.event.timestamp, r.seq))
        } else {
            None
        };

        let before = self.live.len();
        self.live.retain(|e| {
            if fetched.contains(&e.key) {
                return false;
            }
            match (e.is_settled(), e.seq, cutoff) {
                (true, Some(seq), Some(cut)) => (e.event.timestamp, seq) > cut,
                _ => true,
            }
        });
        debug!(
            "Reconciled view for {}: {} live entries folded into page 1",
            self.gateway_id,
            before - self.live.len()
        );

        // confirmed rows still live were written after the page's snapshot
        self.confirmed_since_sync = self.live.iter().filter(|e| e.is_settled()).count() as u64;
        self.head = Some(page);
        self.query_error = None;
    }

    fn status(&self, entries: &[FeedEntry]) -> FeedStatus {
        // ---
        if let Some(reason) = self.load_error.as_ref().or(self.query_error.as_ref()) {
            return FeedStatus::LoadError(reason.clone());
        }
        if self.live.iter().any(|e| !e.is_settled()) {
            return FeedStatus::PendingConfirmation;
        }
        if self.head.is_none() && self.live.is_empty() {
            return FeedStatus::Loading;
        }
        if entries.is_empty() {
            FeedStatus::Empty
        } else {
            FeedStatus::Ready
        }
    }

    fn head_view(&self) -> FeedView {
        // ---
        let page_size = self.page_size as usize;
        let live_keys: HashSet<Uuid> = self.live.iter().map(|e| e.key).collect();

        let mut entries: Vec<FeedEntry> = self.live.iter().take(page_size).cloned().collect();
        let mut stored_total = 0;
        if let Some(head) = &self.head {
            stored_total = head.total_count;
            for record in &head.records {
                if entries.len() >= page_size {
                    break;
                }
                if !live_keys.contains(&record.id) {
                    entries.push(FeedEntry::from_record(record));
                }
            }
        }

        FeedView {
            gateway_id: self.gateway_id.clone(),
            page: 1,
            page_size: self.page_size,
            total_pages: total_pages(stored_total + self.confirmed_since_sync, self.page_size),
            status: self.status(&entries),
            entries,
        }
    }

    fn page_view(&self, page: &AlarmPage) -> FeedView {
        // ---
        let entries: Vec<FeedEntry> = page.records.iter().map(FeedEntry::from_record).collect();
        let status = if entries.is_empty() {
            FeedStatus::Empty
        } else {
            FeedStatus::Ready
        };
        FeedView {
            gateway_id: self.gateway_id.clone(),
            page: page.page,
            page_size: page.page_size,
            total_pages: page.total_pages,
            entries,
            status,
        }
    }
}

type SharedView = Arc<Mutex<ViewState>>;

// ---

/// Owns every subscriber view and the live-to-store publishing path.
pub struct AlarmFeedCoordinator {
    // ---
    store: Arc<dyn AlarmStore>,
    settings: CoordinatorSettings,
    views: RwLock<HashMap<Uuid, (String, SharedView)>>,
}

impl AlarmFeedCoordinator {
    pub fn new(store: Arc<dyn AlarmStore>, settings: CoordinatorSettings) -> Self {
        // ---
        Self {
            store,
            settings,
            views: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn AlarmStore> {
        &self.store
    }

    pub fn page_size(&self) -> u32 {
        self.settings.page_size
    }

    /// Open a view for `gateway_id`. It starts in [`FeedStatus::Loading`]
    /// until [`refresh`](Self::refresh) syncs it with the store.
    pub async fn subscribe(&self, gateway_id: &str) -> Subscription {
        // ---
        let (tx, rx) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let handle = SubscriptionHandle {
            id: Uuid::new_v4(),
            gateway_id: gateway_id.to_string(),
        };
        let view = ViewState::new(gateway_id, self.settings.page_size, tx);

        self.views.write().await.insert(
            handle.id,
            (gateway_id.to_string(), Arc::new(Mutex::new(view))),
        );
        info!("Subscriber {} attached to gateway {}", handle.id, gateway_id);

        Subscription {
            handle,
            updates: rx,
        }
    }

    /// Stop delivery to `handle`. Returns false if it was already gone.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        // ---
        let removed = self.views.write().await.remove(&handle.id).is_some();
        if removed {
            info!("Subscriber {} detached from gateway {}", handle.id, handle.gateway_id);
        }
        removed
    }

    /// Resolve a subscription id issued by [`subscribe`](Self::subscribe).
    pub async fn handle(&self, id: Uuid) -> Result<SubscriptionHandle> {
        // ---
        self.views
            .read()
            .await
            .get(&id)
            .map(|(gateway_id, _)| SubscriptionHandle {
                id,
                gateway_id: gateway_id.clone(),
            })
            .ok_or(AlarmError::UnknownSubscription(id))
    }

    pub async fn total_subscribers(&self) -> usize {
        self.views.read().await.len()
    }

    pub async fn subscriber_count(&self, gateway_id: &str) -> usize {
        self.views
            .read()
            .await
            .values()
            .filter(|(gw, _)| gw == gateway_id)
            .count()
    }

    async fn view(&self, handle: &SubscriptionHandle) -> Result<SharedView> {
        // ---
        self.views
            .read()
            .await
            .get(&handle.id)
            .map(|(_, view)| view.clone())
            .ok_or(AlarmError::UnknownSubscription(handle.id))
    }

    async fn views_for(&self, gateway_id: &str) -> Vec<(Uuid, SharedView)> {
        // ---
        self.views
            .read()
            .await
            .iter()
            .filter(|(_, (gw, _))| gw == gateway_id)
            .map(|(id, (_, view))| (*id, view.clone()))
            .collect()
    }

    async fn is_subscribed(&self, id: &Uuid) -> bool {
        self.views.read().await.contains_key(id)
    }

    /// Prepend `event` to one subscriber's page-1 view as pending and
    /// persist it.
    ///
    /// The entry is confirmed once the append lands, or handled per the
    /// failure policy if it gives up. The returned record id is the entry
    /// key carried by the matching [`FeedUpdate`]s.
    pub async fn on_live_event(
        &self,
        handle: &SubscriptionHandle,
        event: AlarmEvent,
    ) -> Result<AlarmRecord> {
        // ---
        let view = self.view(handle).await?;
        let key = Uuid::new_v4();
        view.lock().await.push_live(key, event.clone());

        self.persist_and_settle(key, &event, &[(handle.id, view)]).await
    }

    /// Deliver `event` to every subscriber of its gateway and persist it once.
    ///
    /// Subscribers see the alarm as pending immediately. After the append
    /// (with retries) it is confirmed, or handled per the failure policy,
    /// in every view that is still subscribed.
    pub async fn publish(&self, event: AlarmEvent) -> Result<AlarmRecord> {
        // ---
        let key = Uuid::new_v4();
        let targets = self.views_for(&event.gateway_id).await;
        for (_, view) in &targets {
            view.lock().await.push_live(key, event.clone());
        }

        self.persist_and_settle(key, &event, &targets).await
    }

    /// Append `event` under `key` and settle its live entry in `targets`.
    async fn persist_and_settle(
        &self,
        key: Uuid,
        event: &AlarmEvent,
        targets: &[(Uuid, SharedView)],
    ) -> Result<AlarmRecord> {
        // ---
        let outcome = append_with_retry(self.store.as_ref(), key, event, &self.settings.retry).await;

        for (id, view) in targets {
            if !self.is_subscribed(id).await {
                debug!("Discarding append result for detached subscriber {}", id);
                continue;
            }
            let mut view = view.lock().await;
            match &outcome {
                Ok(record) => view.confirm(key, record),
                Err(_) => view.fail(key, self.settings.on_append_failure),
            }
        }

        if let Err(e) = &outcome {
            warn!(
                "Alarm {}/{}.{} at {} left unconfirmed: {}",
                event.gateway_id, event.category, event.subcategory, event.timestamp, e
            );
        }
        outcome
    }

    /// The merged page-1 view for `handle`.
    pub async fn current_page(&self, handle: &SubscriptionHandle) -> Result<FeedView> {
        // ---
        let view = self.view(handle).await?;
        let view = view.lock().await;
        Ok(view.head_view())
    }

    /// Re-fetch page 1 from the store and reconcile it with the live list.
    ///
    /// On query failure the previously fetched page stays in the view, the
    /// view reports [`FeedStatus::LoadError`], and the error is returned.
    pub async fn refresh(&self, handle: &SubscriptionHandle) -> Result<FeedView> {
        // ---
        let result = self
            .store
            .query_page(&handle.gateway_id, 1, self.settings.page_size)
            .await;

        let view = self.view(handle).await?;
        let mut view = view.lock().await;
        match result {
            Ok(page) => {
                view.reconcile(page);
                Ok(view.head_view())
            }
            Err(e) => {
                warn!("Refresh of {} failed: {}", handle.gateway_id, e);
                view.query_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Fetch a stored page. Page 1 goes through [`refresh`](Self::refresh).
    ///
    /// On failure the page cached by an earlier fetch, if any, is kept and
    /// stays available through [`cached_page`](Self::cached_page).
    pub async fn fetch_page(&self, handle: &SubscriptionHandle, page: u32) -> Result<FeedView> {
        // ---
        if page <= 1 {
            return self.refresh(handle).await;
        }

        let fetched = self
            .store
            .query_page(&handle.gateway_id, page, self.settings.page_size)
            .await?;

        let view = self.view(handle).await?;
        let mut view = view.lock().await;
        let rendered = view.page_view(&fetched);
        view.pages.insert(page, fetched);
        Ok(rendered)
    }

    /// The last successfully fetched copy of page `page` (> 1).
    pub async fn cached_page(&self, handle: &SubscriptionHandle, page: u32) -> Result<Option<FeedView>> {
        // ---
        let view = self.view(handle).await?;
        let view = view.lock().await;
        Ok(view.pages.get(&page).map(|p| view.page_view(p)))
    }

    /// Mark every view of `gateway_id` as unable to load thresholds.
    pub async fn report_load_error(&self, gateway_id: &str, reason: &str) {
        // ---
        for (_, view) in self.views_for(gateway_id).await {
            view.lock().await.load_error = Some(reason.to_string());
        }
    }

    pub async fn clear_load_error(&self, gateway_id: &str) {
        for (_, view) in self.views_for(gateway_id).await {
            view.lock().await.load_error = None;
        }
    }
}
