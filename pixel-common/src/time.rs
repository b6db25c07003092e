use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait TimeSource {
    // Milliseconds since the unix epoch
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Clone, Default)]
pub struct ManualTime {
    now: Arc<AtomicI64>,
}

impl ManualTime {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
