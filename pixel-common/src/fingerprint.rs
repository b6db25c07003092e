//! TTL-gated event deduplication with a permanent registry of purchased orders.
//!
//! Every event is reduced to a fingerprint: a keyed SipHash of its type and canonical payload.
//! A fingerprint younger than the TTL suppresses identical events. Purchases additionally record
//! their order id, and a recorded order id is never tracked again for the lifetime of the
//! session storage entry, regardless of TTL.
//!
//! The whole state is written through to [`SessionStorage`] after every mutation and read back
//! on construction, so a store rebuilt for the same session keeps its decisions.
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use siphasher::sip128::{Hasher128, SipHasher24};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{canonicalize_payload, EventType, Payload};
use crate::metrics_consts::{
    DEDUP_DECISIONS_TOTAL, DEDUP_FINGERPRINTS_SWEPT, DEDUP_STORAGE_ERRORS_TOTAL,
};
use crate::storage::SessionStorage;
use crate::time::TimeSource;

pub const DEFAULT_TTL: Duration = Duration::from_millis(5000);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const STORAGE_KEY: &str = "pixel_event_dedup";

/// Payload key under which `track_purchase` merges the order id before hashing.
pub const ORDER_ID_KEY: &str = "order_id";

const DEFAULT_HASH_KEY: [u8; 16] = *b"pixel-dedup-v1\0\0";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventFingerprint {
    pub hash: String,
    pub timestamp: i64,
}

/// The JSON document kept in session storage.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
pub struct PersistedDedupState {
    #[serde(default)]
    pub events: HashMap<String, EventFingerprint>,
    #[serde(default, rename = "transactionIds")]
    pub transaction_ids: Vec<String>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HashKeyError {
    #[error("hash key must be 32 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("hash key is not valid hex")]
    InvalidHex,
}

/// Computes fingerprint hashes. The key must stay stable across restarts, otherwise
/// persisted fingerprints stop matching.
#[derive(Clone, Debug)]
pub struct EventHasher {
    key0: u64,
    key1: u64,
}

impl EventHasher {
    pub fn new(key: [u8; 16]) -> Self {
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&key[0..8]);
        k1.copy_from_slice(&key[8..16]);
        Self {
            key0: u64::from_le_bytes(k0),
            key1: u64::from_le_bytes(k1),
        }
    }

    pub fn from_hex(hex: &str) -> Result<Self, HashKeyError> {
        if hex.len() != 32 {
            return Err(HashKeyError::InvalidLength(hex.len()));
        }
        let mut key = [0u8; 16];
        for (idx, byte) in key.iter_mut().enumerate() {
            let pair = hex
                .get(idx * 2..idx * 2 + 2)
                .filter(|pair| pair.bytes().all(|b| b.is_ascii_hexdigit()))
                .ok_or(HashKeyError::InvalidHex)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| HashKeyError::InvalidHex)?;
        }
        Ok(Self::new(key))
    }

    pub fn hash(&self, event_type: &EventType, payload: &Payload) -> String {
        let name = event_type.as_str();
        let mut hasher = SipHasher24::new_with_keys(self.key0, self.key1);
        // Length prefix keeps `type || payload` unambiguous.
        hasher.write(&(name.len() as u64).to_le_bytes());
        hasher.write(name.as_bytes());
        hasher.write(canonicalize_payload(payload).as_bytes());
        let digest = hasher.finish128();
        format!("{:016x}{:016x}", digest.h1, digest.h2)
    }
}

impl Default for EventHasher {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_KEY)
    }
}

#[derive(Clone, Debug)]
pub struct FingerprintStoreConfig {
    pub storage_key: String,
    pub ttl: Duration,
    pub hasher: EventHasher,
}

impl Default for FingerprintStoreConfig {
    fn default() -> Self {
        Self {
            storage_key: STORAGE_KEY.to_owned(),
            ttl: DEFAULT_TTL,
            hasher: EventHasher::default(),
        }
    }
}

struct DedupState {
    events: HashMap<String, EventFingerprint>,
    transaction_ids: HashSet<String>,
    ttl_ms: i64,
    released: bool,
}

impl DedupState {
    fn is_live(&self, fingerprint: &EventFingerprint, now: i64) -> bool {
        now - fingerprint.timestamp <= self.ttl_ms
    }

    /// Returns true and records a fresh fingerprint unless a live one exists for `hash`.
    fn check_and_record(&mut self, hash: String, now: i64) -> bool {
        if let Some(existing) = self.events.get(&hash) {
            if self.is_live(existing, now) {
                return false;
            }
        }
        self.events.insert(
            hash.clone(),
            EventFingerprint {
                hash,
                timestamp: now,
            },
        );
        true
    }

    fn to_persisted(&self) -> PersistedDedupState {
        let mut transaction_ids: Vec<String> = self.transaction_ids.iter().cloned().collect();
        transaction_ids.sort();
        PersistedDedupState {
            events: self.events.clone(),
            transaction_ids,
        }
    }
}

pub struct FingerprintStore {
    state: Mutex<DedupState>,
    storage: Arc<dyn SessionStorage>,
    storage_key: String,
    clock: Arc<dyn TimeSource + Send + Sync>,
    hasher: EventHasher,
}

impl FingerprintStore {
    /// Build a store, rehydrating whatever the storage holds under the configured key.
    /// Unreadable or corrupted state is logged and replaced by an empty store.
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn TimeSource + Send + Sync>,
        config: FingerprintStoreConfig,
    ) -> Self {
        let persisted = match storage.get(&config.storage_key) {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedDedupState>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        key = %config.storage_key,
                        error = %e,
                        "discarding corrupted dedup state"
                    );
                    metrics::counter!(DEDUP_STORAGE_ERRORS_TOTAL, "op" => "parse").increment(1);
                    PersistedDedupState::default()
                }
            },
            Ok(None) => PersistedDedupState::default(),
            Err(e) => {
                warn!(key = %config.storage_key, error = %e, "failed to read dedup state");
                metrics::counter!(DEDUP_STORAGE_ERRORS_TOTAL, "op" => "read").increment(1);
                PersistedDedupState::default()
            }
        };

        debug!(
            key = %config.storage_key,
            fingerprints = persisted.events.len(),
            transactions = persisted.transaction_ids.len(),
            "rehydrated dedup state"
        );

        Self {
            state: Mutex::new(DedupState {
                events: persisted.events,
                transaction_ids: persisted.transaction_ids.into_iter().collect(),
                ttl_ms: ttl_millis(config.ttl),
                released: false,
            }),
            storage,
            storage_key: config.storage_key,
            clock,
            hasher: config.hasher,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &DedupState) {
        if state.released {
            return;
        }
        let result = serde_json::to_string(&state.to_persisted())
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                self.storage
                    .set(&self.storage_key, &raw)
                    .map_err(|e| e.to_string())
            });
        if let Err(error) = result {
            warn!(
                key = %self.storage_key,
                %error,
                "failed to persist dedup state, continuing in memory"
            );
            metrics::counter!(DEDUP_STORAGE_ERRORS_TOTAL, "op" => "write").increment(1);
        }
    }

    /// Decide whether an event should be forwarded. Returns false for an identical event seen
    /// within the TTL window.
    pub fn should_track(&self, event_type: &EventType, payload: &Payload) -> bool {
        let hash = self.hasher.hash(event_type, payload);
        let now = self.clock.now_ms();

        let mut state = self.lock();
        let track = state.check_and_record(hash, now);
        if track {
            self.persist(&state);
        }
        drop(state);

        record_decision(event_type, track);
        track
    }

    /// Purchases are gated twice: an order id already registered is refused forever, and the
    /// purchase payload (with the order id merged in) goes through the TTL gate. Only a purchase
    /// passing both is registered.
    pub fn track_purchase(&self, order_id: &str, payload: &Payload) -> bool {
        let mut merged = payload.clone();
        merged.insert(ORDER_ID_KEY.to_owned(), Value::String(order_id.to_owned()));
        let hash = self.hasher.hash(&EventType::Purchase, &merged);
        let now = self.clock.now_ms();

        let mut state = self.lock();
        if state.transaction_ids.contains(order_id) {
            drop(state);
            debug!(order_id, "purchase already registered");
            record_decision(&EventType::Purchase, false);
            return false;
        }

        if !state.check_and_record(hash, now) {
            drop(state);
            record_decision(&EventType::Purchase, false);
            return false;
        }

        state.transaction_ids.insert(order_id.to_owned());
        self.persist(&state);
        drop(state);

        record_decision(&EventType::Purchase, true);
        true
    }

    /// Only affects decisions made after the call.
    pub fn set_ttl(&self, ttl: Duration) {
        self.lock().ttl_ms = ttl_millis(ttl);
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.lock().ttl_ms.max(0) as u64)
    }

    pub fn has_transaction(&self, order_id: &str) -> bool {
        self.lock().transaction_ids.contains(order_id)
    }

    /// Number of stored fingerprints, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired fingerprints. Expiry is also checked on every decision, so this only
    /// bounds memory and storage size.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let ttl_ms = state.ttl_ms;
        let before = state.events.len();
        state
            .events
            .retain(|_, fingerprint| now - fingerprint.timestamp <= ttl_ms);
        let removed = before - state.events.len();
        if removed > 0 {
            self.persist(&state);
        }
        drop(state);

        metrics::counter!(DEDUP_FINGERPRINTS_SWEPT).increment(removed as u64);
        removed
    }

    /// Forget every fingerprint and registered order.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.events.clear();
        state.transaction_ids.clear();
        if let Err(e) = self.storage.remove(&self.storage_key) {
            warn!(key = %self.storage_key, error = %e, "failed to clear dedup state");
            metrics::counter!(DEDUP_STORAGE_ERRORS_TOTAL, "op" => "remove").increment(1);
        }
    }

    /// Remove the persisted entry for good. Decisions keep working in memory, but nothing is
    /// written back to storage afterwards.
    pub fn release(&self) {
        let mut state = self.lock();
        state.released = true;
        if let Err(e) = self.storage.remove(&self.storage_key) {
            warn!(key = %self.storage_key, error = %e, "failed to release dedup state");
            metrics::counter!(DEDUP_STORAGE_ERRORS_TOTAL, "op" => "remove").increment(1);
        }
    }

    /// Sweep on a schedule until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired();
                        if removed > 0 {
                            debug!(removed, key = %store.storage_key, "swept expired fingerprints");
                        }
                    }
                }
            }
        })
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn record_decision(event_type: &EventType, tracked: bool) {
    let outcome = if tracked { "tracked" } else { "suppressed" };
    let event = match event_type {
        EventType::Custom(_) => "custom".to_owned(),
        known => known.as_str().to_owned(),
    };
    metrics::counter!(DEDUP_DECISIONS_TOTAL, "event" => event, "outcome" => outcome)
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageError};
    use crate::time::ManualTime;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    fn store_with(storage: Arc<dyn SessionStorage>, clock: &ManualTime) -> FingerprintStore {
        FingerprintStore::new(
            storage,
            Arc::new(clock.clone()),
            FingerprintStoreConfig::default(),
        )
    }

    /// Storage whose writes always fail, like a full quota.
    struct ReadOnlyStorage;

    impl SessionStorage for ReadOnlyStorage {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Poisoned)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "quota exceeded",
            )))
        }
        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Poisoned)
        }
    }

    #[test]
    fn suppresses_duplicates_within_ttl() {
        let clock = ManualTime::new(1_000_000);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);
        let p = payload(json!({"item_id": "ashwagandha", "price": 499}));

        assert!(store.should_track(&EventType::ViewContent, &p));
        clock.advance(4_999);
        assert!(!store.should_track(&EventType::ViewContent, &p));
        clock.advance(5_001);
        assert!(store.should_track(&EventType::ViewContent, &p));
    }

    #[test]
    fn boundary_age_equal_to_ttl_is_still_duplicate() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);
        let p = payload(json!({"q": "tulsi"}));

        assert!(store.should_track(&EventType::Search, &p));
        clock.advance(5_000);
        assert!(!store.should_track(&EventType::Search, &p));
        clock.advance(5_001);
        assert!(store.should_track(&EventType::Search, &p));
    }

    #[test]
    fn payload_key_order_does_not_matter() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);

        assert!(store.should_track(&EventType::Purchase, &payload(json!({"a": 1, "b": 2}))));
        assert!(!store.should_track(&EventType::Purchase, &payload(json!({"b": 2, "a": 1}))));
    }

    #[test]
    fn event_type_is_part_of_the_fingerprint() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);
        let p = payload(json!({"item_id": "brahmi"}));

        assert!(store.should_track(&EventType::ViewContent, &p));
        assert!(store.should_track(&EventType::AddToCart, &p));
        assert!(store.should_track(&EventType::Custom("wishlist".to_owned()), &p));
    }

    #[test]
    fn rapid_add_to_cart_scenario() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);
        let first = payload(json!({"item_id": "neem-oil", "price": 250, "quantity": 1}));
        let other_quantity = payload(json!({"item_id": "neem-oil", "price": 250, "quantity": 2}));

        assert!(store.should_track(&EventType::AddToCart, &first));
        clock.advance(200);
        assert!(!store.should_track(&EventType::AddToCart, &first));
        assert!(store.should_track(&EventType::AddToCart, &other_quantity));
    }

    #[test]
    fn purchase_is_deduplicated_permanently() {
        let clock = ManualTime::new(0);
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone(), &clock);
        let p = payload(json!({"value": 1000}));

        assert!(store.track_purchase("ORDER-1", &p));
        assert!(!store.track_purchase("ORDER-1", &p));
        assert!(store.has_transaction("ORDER-1"));

        clock.advance(60_000);
        assert!(!store.track_purchase("ORDER-1", &p));
        // Different payload, same order: still refused.
        assert!(!store.track_purchase("ORDER-1", &payload(json!({"value": 1}))));

        let reloaded = store_with(storage, &clock);
        assert!(!reloaded.track_purchase("ORDER-1", &p));
        assert!(reloaded.track_purchase("ORDER-2", &p));
    }

    #[test]
    fn suppressed_purchase_is_not_registered() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);
        let mut p = payload(json!({"value": 1000}));

        // A plain purchase event with the same merged payload claims the fingerprint first.
        p.insert(ORDER_ID_KEY.to_owned(), json!("ORD-7"));
        assert!(store.should_track(&EventType::Purchase, &p));
        p.remove(ORDER_ID_KEY);

        assert!(!store.track_purchase("ORD-7", &p));
        assert!(!store.has_transaction("ORD-7"));

        clock.advance(5_001);
        assert!(store.track_purchase("ORD-7", &p));
        assert!(store.has_transaction("ORD-7"));
    }

    #[test]
    fn clear_resets_purchases() {
        let clock = ManualTime::new(0);
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone(), &clock);
        let p = payload(json!({"value": 1000}));

        assert!(store.track_purchase("ORD-42", &p));
        assert!(!store.track_purchase("ORD-42", &p));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(storage.get(STORAGE_KEY).unwrap(), None);
        assert!(store.track_purchase("ORD-42", &p));
    }

    #[test]
    fn persists_expected_document_shape() {
        let clock = ManualTime::new(42);
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone(), &clock);

        assert!(store.track_purchase("ORD-1", &payload(json!({"value": 10}))));

        let raw = storage.get(STORAGE_KEY).unwrap().expect("state was persisted");
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["transactionIds"], json!(["ORD-1"]));
        let events = document["events"].as_object().unwrap();
        assert_eq!(events.len(), 1);
        let (hash, fingerprint) = events.iter().next().unwrap();
        assert_eq!(fingerprint["hash"], json!(hash));
        assert_eq!(fingerprint["timestamp"], json!(42));
    }

    #[test]
    fn corrupted_storage_falls_back_to_empty() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        storage.set(STORAGE_KEY, "{not json").unwrap();
        let clock = ManualTime::new(0);

        let store = store_with(storage, &clock);
        assert!(store.is_empty());
        assert!(store.should_track(&EventType::PageView, &Payload::new()));
    }

    #[test]
    fn storage_failures_do_not_break_decisions() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(ReadOnlyStorage), &clock);
        let p = payload(json!({"page_url": "/shop"}));

        assert!(store.should_track(&EventType::PageView, &p));
        assert!(!store.should_track(&EventType::PageView, &p));
        assert!(store.track_purchase("ORD-9", &p));
        assert!(!store.track_purchase("ORD-9", &p));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn set_ttl_applies_to_later_decisions() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);
        let p = payload(json!({"item_id": "moringa"}));

        assert!(store.should_track(&EventType::ViewContent, &p));
        store.set_ttl(Duration::from_millis(100));
        assert_eq!(store.ttl(), Duration::from_millis(100));
        clock.advance(150);
        assert!(store.should_track(&EventType::ViewContent, &p));
    }

    #[test]
    fn oversized_ttl_saturates() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);
        let p = payload(json!({"item_id": "tulsi"}));

        store.set_ttl(Duration::MAX);
        assert_eq!(store.ttl(), Duration::from_millis(i64::MAX as u64));
        assert!(store.should_track(&EventType::ViewContent, &p));
        clock.advance(365 * 24 * 3_600_000);
        assert!(!store.should_track(&EventType::ViewContent, &p));
    }

    #[test]
    fn release_removes_persisted_state_for_good() {
        let clock = ManualTime::new(0);
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone(), &clock);
        let p = payload(json!({"value": 10}));

        assert!(store.track_purchase("ORD-3", &p));
        assert!(storage.get(STORAGE_KEY).unwrap().is_some());

        store.release();
        assert_eq!(storage.get(STORAGE_KEY).unwrap(), None);

        // Still decides in memory, but never writes the entry back.
        assert!(!store.track_purchase("ORD-3", &p));
        assert!(store.should_track(&EventType::Search, &payload(json!({"q": "neem"}))));
        assert_eq!(storage.get(STORAGE_KEY).unwrap(), None);
    }

    #[test]
    fn sweep_removes_only_expired_fingerprints() {
        let clock = ManualTime::new(0);
        let store = store_with(Arc::new(MemoryStorage::new()), &clock);

        assert!(store.should_track(&EventType::Search, &payload(json!({"q": "old"}))));
        clock.advance(6_000);
        assert!(store.should_track(&EventType::Search, &payload(json!({"q": "new"}))));

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_cancelled() {
        let clock = ManualTime::new(0);
        let store = Arc::new(store_with(Arc::new(MemoryStorage::new()), &clock));
        assert!(store.should_track(&EventType::Search, &payload(json!({"q": "giloy"}))));

        let cancel = CancellationToken::new();
        let handle = store.spawn_sweeper(DEFAULT_SWEEP_INTERVAL, cancel.clone());

        clock.advance(6_000);
        tokio::time::sleep(DEFAULT_SWEEP_INTERVAL + Duration::from_millis(1)).await;
        assert!(store.is_empty());

        cancel.cancel();
        handle.await.expect("sweeper task panicked");
    }

    #[test]
    fn hash_key_parsing() {
        assert!(EventHasher::from_hex("00112233445566778899aabbccddeeff").is_ok());
        assert_eq!(
            EventHasher::from_hex("abc").unwrap_err(),
            HashKeyError::InvalidLength(3)
        );
        assert_eq!(
            EventHasher::from_hex("zz112233445566778899aabbccddeeff").unwrap_err(),
            HashKeyError::InvalidHex
        );
        assert_eq!(
            EventHasher::from_hex("+f112233445566778899aabbccddeeff").unwrap_err(),
            HashKeyError::InvalidHex
        );
    }

    #[test]
    fn different_keys_produce_different_hashes() {
        let p = payload(json!({"a": 1}));
        let default_hash = EventHasher::default().hash(&EventType::PageView, &p);
        let other = EventHasher::from_hex("00112233445566778899aabbccddeeff")
            .unwrap()
            .hash(&EventType::PageView, &p);

        assert_eq!(default_hash.len(), 32);
        assert_ne!(default_hash, other);
    }
}
