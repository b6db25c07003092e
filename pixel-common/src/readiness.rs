//! Load/ready/error tracking for every configured pixel.
//!
//! Each `(platform, destination_id)` key moves `unknown -> loaded -> ready`. Errors are an
//! orthogonal flag: they bump the attempt counter but never prevent a later `mark_as_ready`,
//! which clears the error again. State lives for the whole process and is only dropped by
//! [`PixelReadinessRegistry::reset`].
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::metrics_consts::{PIXEL_READY_TIMEOUTS_TOTAL, PIXEL_STATE_TRANSITIONS_TOTAL};
use crate::platform::{Platform, PixelKey};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PixelState {
    pub is_loaded: bool,
    pub is_ready: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("pixel {platform}:{destination_id} was not ready after {elapsed:?}")]
    Timeout {
        platform: Platform,
        destination_id: String,
        elapsed: Duration,
    },
    #[error("readiness registry was reset while waiting for {platform}:{destination_id}")]
    Reset {
        platform: Platform,
        destination_id: String,
    },
    #[error("no pixels to wait for")]
    NoPixels,
}

pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a queued `on_ready` callback, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
struct Entry {
    state: PixelState,
    callbacks: Vec<(CallbackId, ReadyCallback)>,
    waiters: Vec<oneshot::Sender<()>>,
}

pub struct PixelReadinessRegistry {
    entries: Mutex<HashMap<PixelKey, Entry>>,
    max_retries: u32,
    next_callback_id: AtomicU64,
}

impl Default for PixelReadinessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl PixelReadinessRegistry {
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_retries,
            next_callback_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PixelKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_as_loaded(&self, key: &PixelKey) {
        self.lock().entry(key.clone()).or_default().state.is_loaded = true;
        record_transition(key, "loaded");
    }

    /// Flag the pixel ready, then run and discard every pending callback and waiter.
    pub fn mark_as_ready(&self, key: &PixelKey) {
        let (callbacks, waiters) = {
            let mut entries = self.lock();
            let entry = entries.entry(key.clone()).or_default();
            entry.state.is_loaded = true;
            entry.state.is_ready = true;
            entry.state.error = None;
            (
                std::mem::take(&mut entry.callbacks),
                std::mem::take(&mut entry.waiters),
            )
        };
        record_transition(key, "ready");

        debug!(
            pixel = %key,
            callbacks = callbacks.len(),
            waiters = waiters.len(),
            "pixel ready"
        );
        // Callbacks run outside the lock so they may use the registry themselves.
        for (_, callback) in callbacks {
            callback();
        }
        for waiter in waiters {
            if waiter.send(()).is_err() {
                debug!(pixel = %key, "waiter already timed out");
            }
        }
    }

    pub fn mark_as_error(&self, key: &PixelKey, message: &str) {
        let attempts = {
            let mut entries = self.lock();
            let entry = entries.entry(key.clone()).or_default();
            entry.state.error = Some(message.to_owned());
            entry.state.attempts += 1;
            entry.state.attempts
        };
        record_transition(key, "error");
        warn!(pixel = %key, attempts, error = message, "pixel failed to load");
    }

    /// Run `callback` once the pixel is ready: immediately if it already is (returning `None`),
    /// otherwise on the next `mark_as_ready`.
    pub fn on_ready<F>(&self, key: &PixelKey, callback: F) -> Option<CallbackId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        if entry.state.is_ready {
            drop(entries);
            callback();
            return None;
        }

        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        entry.callbacks.push((id, Box::new(callback)));
        Some(id)
    }

    /// Drop a pending callback. Returns false if it already ran or was never queued for `key`.
    pub fn cancel(&self, key: &PixelKey, id: CallbackId) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let before = entry.callbacks.len();
        entry.callbacks.retain(|(queued, _)| *queued != id);
        entry.callbacks.len() != before
    }

    /// Drop every pending callback for `key`, returning how many were dropped.
    pub fn cancel_all(&self, key: &PixelKey) -> usize {
        self.lock()
            .get_mut(key)
            .map(|entry| std::mem::take(&mut entry.callbacks).len())
            .unwrap_or_default()
    }

    /// Wait until the pixel is ready, or fail once `timeout` elapses. Only the caller is
    /// suspended; dropping the returned future releases its timer and its waiter slot.
    pub async fn wait_for_ready(
        &self,
        key: &PixelKey,
        timeout: Duration,
    ) -> Result<(), ReadinessError> {
        let started = tokio::time::Instant::now();
        let receiver = {
            let mut entries = self.lock();
            let entry = entries.entry(key.clone()).or_default();
            if entry.state.is_ready {
                return Ok(());
            }
            let (sender, receiver) = oneshot::channel();
            entry.waiters.retain(|waiter| !waiter.is_closed());
            entry.waiters.push(sender);
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ReadinessError::Reset {
                platform: key.platform,
                destination_id: key.destination_id.clone(),
            }),
            Err(_) => {
                metrics::counter!(PIXEL_READY_TIMEOUTS_TOTAL, "platform" => key.platform.as_str())
                    .increment(1);
                Err(ReadinessError::Timeout {
                    platform: key.platform,
                    destination_id: key.destination_id.clone(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Resolve with the first key to become ready. Fails with the last error if none is ready
    /// before `timeout`.
    pub async fn wait_for_any_ready(
        &self,
        keys: &[PixelKey],
        timeout: Duration,
    ) -> Result<PixelKey, ReadinessError> {
        if keys.is_empty() {
            return Err(ReadinessError::NoPixels);
        }

        let waits = keys.iter().map(|key| {
            Box::pin(async move {
                self.wait_for_ready(key, timeout).await?;
                Ok::<_, ReadinessError>(key.clone())
            })
        });

        futures::future::select_ok(waits)
            .await
            .map(|(key, _pending)| key)
    }

    pub fn can_retry(&self, key: &PixelKey) -> bool {
        self.state(key).attempts < self.max_retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_ready(&self, key: &PixelKey) -> bool {
        self.state(key).is_ready
    }

    pub fn state(&self, key: &PixelKey) -> PixelState {
        self.lock().entry(key.clone()).or_default().state.clone()
    }

    /// Every known pixel and its state, ordered by key.
    pub fn snapshot(&self) -> Vec<(PixelKey, PixelState)> {
        let mut states: Vec<(PixelKey, PixelState)> = self
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.state.clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Forget all pixels. Pending callbacks are dropped and waiters fail with `Reset`.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

fn record_transition(key: &PixelKey, state: &'static str) {
    metrics::counter!(
        PIXEL_STATE_TRANSITIONS_TOTAL,
        "platform" => key.platform.as_str(),
        "state" => state
    )
    .increment(1);
}
