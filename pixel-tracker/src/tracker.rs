//! The orchestrator: gates events through the fingerprint store, then fans them out to every
//! enabled destination.
//!
//! [`TrackerContext`] is process-wide and owns everything shared between sessions: the
//! destination list (loaded once), pixel readiness, platform hooks, adapters and the catalog
//! sync state. [`UnifiedTracker`] is one per browsing session and owns that session's dedup
//! store.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use pixel_common::event::{CanonicalEvent, EventType, Payload};
use pixel_common::fingerprint::{
    EventHasher, FingerprintStore, FingerprintStoreConfig, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL,
    STORAGE_KEY,
};
use pixel_common::platform::{PixelDestination, PixelKey};
use pixel_common::readiness::{CallbackId, PixelReadinessRegistry, DEFAULT_READY_TIMEOUT};
use pixel_common::retry::RetryPolicy;
use pixel_common::storage::SessionStorage;
use pixel_common::time::TimeSource;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterSet, DispatchOutcome, PixelAdapter};
use crate::analytics::{AnalyticsClient, PageViewRecord, VisitDurationRecord};
use crate::catalog::{CatalogSnapshot, Product};
use crate::destinations::DestinationSource;
use crate::error::{DispatchError, HookError};
use crate::hooks::HookRegistry;
use crate::metrics_consts::{
    CATALOG_SYNCS_TOTAL, DISPATCH_DURATION_SECONDS, DISPATCH_RESULTS_TOTAL, EVENTS_RECEIVED_TOTAL,
};

pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub dedup_ttl: Duration,
    pub sweep_interval: Duration,
    /// Upper bound for a single `wait_for_ready`.
    pub ready_timeout: Duration,
    /// How long `start` waits for any pixel to become ready before the first page view.
    pub settle_timeout: Duration,
    pub default_currency: String,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            dedup_ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            default_currency: "USD".to_owned(),
        }
    }
}

/// Per-destination tally for one dispatched event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Destinations whose platform call was made.
    pub delivered: usize,
    /// Destinations that were unavailable or have no equivalent event.
    pub skipped: usize,
    /// Destinations whose adapter failed.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// A duplicate within the dedup window, or an already registered order.
    Suppressed,
    Dispatched(DispatchReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogSyncReport {
    pub products: usize,
    pub available: usize,
    pub total_value: f64,
    pub currency: String,
    /// Destinations synced right away.
    pub delivered: usize,
    /// Destinations that will be synced once their pixel is ready.
    pub deferred: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogSyncOutcome {
    /// Same snapshot as the last sync, nothing sent.
    Unchanged,
    Synced(CatalogSyncReport),
}

#[derive(Default)]
struct CatalogSyncState {
    last_fingerprint: Option<String>,
    pending: Vec<(PixelKey, CallbackId)>,
}

/// Page details for the page view emitted when a session starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub page_url: String,
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub referrer_url: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl PageContext {
    fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("page_url".to_owned(), self.page_url.clone().into());
        if let Some(title) = &self.page_title {
            payload.insert("page_title".to_owned(), title.clone().into());
        }
        if let Some(referrer) = &self.referrer_url {
            payload.insert("referrer_url".to_owned(), referrer.clone().into());
        }
        payload
    }
}

pub struct TrackerContext {
    readiness: Arc<PixelReadinessRegistry>,
    hooks: Arc<HookRegistry>,
    adapters: AdapterSet,
    source: Arc<dyn DestinationSource>,
    analytics: Option<AnalyticsClient>,
    retry_policy: RetryPolicy,
    settings: TrackerSettings,
    hasher: EventHasher,
    clock: Arc<dyn TimeSource + Send + Sync>,
    destinations: OnceCell<Vec<PixelDestination>>,
    catalog: Mutex<CatalogSyncState>,
    shutdown: CancellationToken,
}

impl TrackerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        readiness: Arc<PixelReadinessRegistry>,
        hooks: Arc<HookRegistry>,
        adapters: AdapterSet,
        source: Arc<dyn DestinationSource>,
        analytics: Option<AnalyticsClient>,
        retry_policy: RetryPolicy,
        settings: TrackerSettings,
        hasher: EventHasher,
        clock: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            readiness,
            hooks,
            adapters,
            source,
            analytics,
            retry_policy,
            settings,
            hasher,
            clock,
            destinations: OnceCell::new(),
            catalog: Mutex::new(CatalogSyncState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn readiness(&self) -> &Arc<PixelReadinessRegistry> {
        &self.readiness
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Whether the destination list has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.destinations.initialized()
    }

    /// Load the enabled destinations once for the whole process. A failing source is logged
    /// and leaves the tracker with no destinations.
    pub async fn load_destinations(self: &Arc<Self>) -> &[PixelDestination] {
        self.destinations
            .get_or_init(|| async {
                let destinations: Vec<PixelDestination> = match self.source.load().await {
                    Ok(all) => all.into_iter().filter(|d| d.is_enabled).collect(),
                    Err(e) => {
                        error!(error = %e, "failed to load pixel destinations");
                        Vec::new()
                    }
                };

                for destination in &destinations {
                    self.bring_up(destination);
                }
                info!(count = destinations.len(), "pixel destinations loaded");
                destinations
            })
            .await
    }

    /// Mark a destination loaded and ready as soon as its platform hook is present, polling
    /// with backoff until the retry budget runs out.
    fn bring_up(self: &Arc<Self>, destination: &PixelDestination) {
        let key = destination.key();
        self.readiness.mark_as_loaded(&key);
        if self.check_presence(&key) {
            return;
        }

        let context = self.clone();
        tokio::spawn(async move {
            while context.readiness.can_retry(&key) {
                let failed = context.readiness.state(&key).attempts;
                let delay = context
                    .retry_policy
                    .time_until_next_retry(failed.saturating_sub(1));
                tokio::select! {
                    _ = context.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if context.check_presence(&key) {
                    return;
                }
            }
            warn!(
                pixel = %key,
                attempts = context.readiness.state(&key).attempts,
                "giving up on pixel"
            );
        });
    }

    fn check_presence(&self, key: &PixelKey) -> bool {
        let available = self
            .adapters
            .get(key.platform)
            .is_some_and(|adapter| adapter.is_available());
        if available {
            self.readiness.mark_as_ready(key);
        } else {
            self.readiness
                .mark_as_error(key, &format!("{} is not present", key.platform.global_name()));
        }
        available
    }

    /// Send every destination the given event, each one isolated from the others' failures.
    fn fan_out(&self, destinations: &[PixelDestination], event: &CanonicalEvent) -> DispatchReport {
        let started = Instant::now();
        let mut report = DispatchReport::default();

        for destination in destinations {
            let result = self.adapter_for(destination).and_then(|adapter| {
                guarded(destination, || adapter.dispatch(event, &destination.destination_id))
            });

            let outcome = match result {
                Ok(DispatchOutcome::Sent) => {
                    report.delivered += 1;
                    DispatchOutcome::Sent.as_str()
                }
                Ok(skipped) => {
                    debug!(
                        pixel = %destination.key(),
                        outcome = skipped.as_str(),
                        event = %event.event_type,
                        "event not sent"
                    );
                    report.skipped += 1;
                    skipped.as_str()
                }
                Err(e) => {
                    error!(
                        pixel = %destination.key(),
                        event = %event.event_type,
                        error = %e,
                        "dispatch failed"
                    );
                    report.failed += 1;
                    "failed"
                }
            };
            metrics::counter!(
                DISPATCH_RESULTS_TOTAL,
                "platform" => destination.platform.as_str(),
                "outcome" => outcome
            )
            .increment(1);
        }

        metrics::histogram!(DISPATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        report
    }

    fn adapter_for(
        &self,
        destination: &PixelDestination,
    ) -> Result<Arc<dyn PixelAdapter>, DispatchError> {
        self.adapters
            .get(destination.platform)
            .ok_or(DispatchError::NoAdapter(destination.platform))
    }

    /// Push a full catalog snapshot to every destination. Ready pixels are synced now, the
    /// rest as soon as they become ready. An identical snapshot is not sent again, and a newer
    /// snapshot replaces any sync still waiting on a pixel.
    pub async fn sync_catalog(self: &Arc<Self>, products: Vec<Product>) -> CatalogSyncOutcome {
        let destinations = self.load_destinations().await;
        let snapshot = Arc::new(CatalogSnapshot::new(products, &self.settings.default_currency));
        let fingerprint = snapshot.fingerprint(&self.hasher);

        // Held until `pending` lists this snapshot's callbacks only.
        let mut state = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        if state.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            drop(state);
            debug!("catalog unchanged, skipping sync");
            metrics::counter!(CATALOG_SYNCS_TOTAL, "outcome" => "unchanged").increment(1);
            return CatalogSyncOutcome::Unchanged;
        }
        for (key, id) in std::mem::take(&mut state.pending) {
            if self.readiness.cancel(&key, id) {
                debug!(pixel = %key, "dropped superseded catalog sync");
            }
        }

        let mut report = CatalogSyncReport {
            products: snapshot.len(),
            available: snapshot.available_count(),
            total_value: snapshot.total_value(),
            currency: snapshot.currency().to_owned(),
            delivered: 0,
            deferred: 0,
            failed: 0,
        };

        for destination in destinations {
            let key = destination.key();
            let adapter = match self.adapter_for(destination) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!(pixel = %key, error = %e, "catalog sync failed");
                    report.failed += 1;
                    continue;
                }
            };

            if self.readiness.is_ready(&key) {
                let result = guarded(destination, || {
                    adapter.sync_catalog(&snapshot, &destination.destination_id)
                });
                match result {
                    Ok(_) => report.delivered += 1,
                    Err(e) => {
                        error!(pixel = %key, error = %e, "catalog sync failed");
                        report.failed += 1;
                    }
                }
                continue;
            }

            let deferred_snapshot = snapshot.clone();
            let deferred_destination = destination.clone();
            let queued = self.readiness.on_ready(&key, move || {
                let result = guarded(&deferred_destination, || {
                    adapter.sync_catalog(&deferred_snapshot, &deferred_destination.destination_id)
                });
                if let Err(e) = result {
                    error!(
                        pixel = %deferred_destination.key(),
                        error = %e,
                        "deferred catalog sync failed"
                    );
                }
            });
            match queued {
                Some(id) => {
                    state.pending.push((key, id));
                    report.deferred += 1;
                }
                // Became ready in the meantime and ran right away.
                None => report.delivered += 1,
            }
        }

        // A snapshot nobody received stays eligible for the next sync.
        state.last_fingerprint = (report.delivered + report.deferred > 0).then_some(fingerprint);
        drop(state);

        info!(
            products = report.products,
            delivered = report.delivered,
            deferred = report.deferred,
            failed = report.failed,
            "catalog synced"
        );
        metrics::counter!(CATALOG_SYNCS_TOTAL, "outcome" => "synced").increment(1);
        CatalogSyncOutcome::Synced(report)
    }

    /// Stop background readiness polling and drop catalog syncs still waiting on a pixel.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let pending = {
            let mut state = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut state.pending)
        };
        for (key, id) in pending {
            if self.readiness.cancel(&key, id) {
                debug!(pixel = %key, "dropped pending catalog sync on shutdown");
            }
        }
    }
}

/// Run an adapter call, turning a panicking platform hook into a failed dispatch.
fn guarded<F>(destination: &PixelDestination, call: F) -> Result<DispatchOutcome, DispatchError>
where
    F: FnOnce() -> Result<DispatchOutcome, DispatchError>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Hook {
            platform: destination.platform,
            method: "dispatch".to_owned(),
            source: HookError::Rejected("platform hook panicked".to_owned()),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Uninitialized,
    LoadingDestinations,
    DestinationsLoaded,
    Ready,
}

/// One session's tracker.
pub struct UnifiedTracker {
    session_id: String,
    context: Arc<TrackerContext>,
    store: Arc<FingerprintStore>,
    state: Mutex<TrackerState>,
    started: OnceCell<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl UnifiedTracker {
    /// Dedup state is persisted in `storage` under a key scoped to the session.
    pub fn new(
        session_id: &str,
        context: Arc<TrackerContext>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        let store = FingerprintStore::new(
            storage,
            context.clock.clone(),
            FingerprintStoreConfig {
                storage_key: format!("{STORAGE_KEY}:{session_id}"),
                ttl: context.settings.dedup_ttl,
                hasher: context.hasher.clone(),
            },
        );

        Self {
            session_id: session_id.to_owned(),
            context,
            store: Arc::new(store),
            state: Mutex::new(TrackerState::Uninitialized),
            started: OnceCell::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<FingerprintStore> {
        &self.store
    }

    pub fn state(&self) -> TrackerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TrackerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        debug!(session_id = %self.session_id, ?state, "tracker state changed");
    }

    /// Bring the session to the ready state and emit its page view. Only the first call does
    /// anything; later calls wait for it to finish.
    pub async fn start(&self, page: PageContext) {
        self.started
            .get_or_init(|| async {
                self.set_state(TrackerState::LoadingDestinations);
                let keys: Vec<PixelKey> = self
                    .context
                    .load_destinations()
                    .await
                    .iter()
                    .map(PixelDestination::key)
                    .collect();
                self.set_state(TrackerState::DestinationsLoaded);

                if !keys.is_empty() {
                    let settle = self
                        .context
                        .settings
                        .settle_timeout
                        .min(self.context.settings.ready_timeout);
                    let readiness = &self.context.readiness;
                    let ready = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        ready = readiness.wait_for_any_ready(&keys, settle) => ready,
                    };
                    match ready {
                        Ok(key) => debug!(
                            session_id = %self.session_id,
                            pixel = %key,
                            "first pixel ready"
                        ),
                        Err(e) => info!(
                            session_id = %self.session_id,
                            error = %e,
                            "no pixel ready yet, sending page view anyway"
                        ),
                    }
                }

                self.set_state(TrackerState::Ready);
                // Detached, the sweeper exits once the session is cancelled.
                drop(self.store.spawn_sweeper(
                    self.context.settings.sweep_interval,
                    self.cancel.child_token(),
                ));

                self.track(CanonicalEvent::new(EventType::PageView, page.to_payload()))
                    .await;

                if let Some(analytics) = &self.context.analytics {
                    analytics.record_page_view(PageViewRecord {
                        page_url: page.page_url,
                        page_title: page.page_title,
                        referrer_url: page.referrer_url,
                        session_id: self.session_id.clone(),
                        user_agent: page.user_agent,
                    });
                }
            })
            .await;
    }

    /// Gate one event and, if it passes, fan it out. Purchases carrying an order id are gated
    /// by the order registry as well as the dedup window.
    pub async fn track(&self, event: CanonicalEvent) -> TrackOutcome {
        let event_label = match &event.event_type {
            EventType::Custom(_) => "custom",
            known => known.as_str(),
        };
        metrics::counter!(EVENTS_RECEIVED_TOTAL, "event" => event_label.to_owned()).increment(1);

        let passes = match (&event.event_type, event.order_id.as_deref()) {
            (EventType::Purchase, Some(order_id)) => {
                self.store.track_purchase(order_id, &event.payload)
            }
            (event_type, _) => self.store.should_track(event_type, &event.payload),
        };
        if !passes {
            debug!(
                session_id = %self.session_id,
                event = %event.event_type,
                "duplicate event suppressed"
            );
            return TrackOutcome::Suppressed;
        }

        let destinations = self.context.load_destinations().await;
        let report = self.context.fan_out(destinations, &event);
        debug!(
            session_id = %self.session_id,
            event = %event.event_type,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "event dispatched"
        );
        TrackOutcome::Dispatched(report)
    }

    /// Tear the session down: stop its sweeper, abandon a pending start, drop the persisted
    /// dedup state and send the visit duration beacon when one is given. Later calls do
    /// nothing.
    pub fn shutdown(&self, visit_duration: Option<Duration>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.store.release();

        if let (Some(analytics), Some(duration)) = (&self.context.analytics, visit_duration) {
            analytics.record_visit_duration(VisitDurationRecord {
                session_id: self.session_id.clone(),
                visit_duration: duration.as_secs(),
            });
        }
        debug!(session_id = %self.session_id, "session tracker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Ready pixels and known pixels.
pub fn ready_count(readiness: &PixelReadinessRegistry) -> (usize, usize) {
    let snapshot = readiness.snapshot();
    let ready = snapshot.iter().filter(|(_, state)| state.is_ready).count();
    (ready, snapshot.len())
}
