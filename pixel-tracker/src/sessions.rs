//! Live session trackers, evicted after a period of inactivity.
use std::sync::Arc;
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::sync::Cache;
use pixel_common::storage::SessionStorage;
use tracing::debug;

use crate::metrics_consts::ACTIVE_SESSIONS;
use crate::tracker::{TrackerContext, UnifiedTracker};

const MAX_SESSIONS: u64 = 100_000;

pub struct SessionManager {
    context: Arc<TrackerContext>,
    storage: Arc<dyn SessionStorage>,
    sessions: Cache<String, Arc<UnifiedTracker>>,
}

impl SessionManager {
    pub fn new(
        context: Arc<TrackerContext>,
        storage: Arc<dyn SessionStorage>,
        idle_timeout: Duration,
    ) -> Self {
        let sessions = Cache::builder()
            .name("session_trackers")
            .max_capacity(MAX_SESSIONS)
            .time_to_idle(idle_timeout)
            .eviction_listener(
                |session_id: Arc<String>, tracker: Arc<UnifiedTracker>, cause: RemovalCause| {
                    if matches!(cause, RemovalCause::Replaced) {
                        return;
                    }
                    debug!(%session_id, ?cause, "session tracker evicted");
                    tracker.shutdown(None);
                },
            )
            .build();

        Self {
            context,
            storage,
            sessions,
        }
    }

    pub fn context(&self) -> &Arc<TrackerContext> {
        &self.context
    }

    /// The session's tracker, created on first contact.
    pub fn get_or_create(&self, session_id: &str) -> Arc<UnifiedTracker> {
        let tracker = self.sessions.get_with(session_id.to_owned(), || {
            debug!(session_id, "new session tracker");
            Arc::new(UnifiedTracker::new(
                session_id,
                self.context.clone(),
                self.storage.clone(),
            ))
        });
        self.report_size();
        tracker
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<UnifiedTracker>> {
        self.sessions.get(session_id)
    }

    /// Tear a session down and forget it. Returns false for an unknown session.
    pub fn end(&self, session_id: &str, visit_duration: Option<Duration>) -> bool {
        let Some(tracker) = self.sessions.get(session_id) else {
            return false;
        };
        // Closed before invalidation, so the listener's shutdown is a no-op.
        tracker.shutdown(visit_duration);
        self.sessions.invalidate(session_id);
        self.report_size();
        true
    }

    pub fn len(&self) -> u64 {
        self.sessions.run_pending_tasks();
        self.sessions.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn report_size(&self) {
        metrics::gauge!(ACTIVE_SESSIONS).set(self.sessions.entry_count() as f64);
    }
}
