//! Fingerprint cache
//!
//! Memoizes step outputs keyed by canonical fingerprint. Besides TTL'd
//! storage (behind the swappable [`CacheStore`] boundary) this layer
//! guarantees at most one in-flight computation per fingerprint: concurrent
//! requesters of the same key await the first computation's outcome instead
//! of re-invoking the agent.
//!
//! Only validator-approved / successfully executed results are ever written;
//! failed computations release their flight so a later requester can retry.

pub mod fingerprint;
pub mod store;

pub use fingerprint::{
    canonical_json, query_fingerprint, step_fingerprint, version_prefix, Fingerprint,
};
pub use store::{CacheStore, InMemoryCacheStore};

use crate::plan::types::StepResult;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Outcome of a cache lookup
pub enum Lookup {
    /// A live entry was found (possibly after awaiting another requester's
    /// in-flight computation)
    Hit(StepResult),
    /// No entry; the caller now owns the flight for this fingerprint and must
    /// either `complete` the guard or drop it to release waiters
    Miss(FlightGuard),
}

/// Fingerprint-keyed result cache with single-flight coordination
pub struct FingerprintCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FingerprintCache {
    /// Create a cache over the given backing store
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a fingerprint, claiming the flight on a miss
    ///
    /// If another task already owns the flight for this fingerprint, this
    /// call suspends until that flight resolves, then either returns the
    /// cached result or claims the flight itself (when the first computation
    /// failed and cached nothing).
    pub async fn lookup(self: &Arc<Self>, fp: &Fingerprint) -> Lookup {
        let key = fp.as_str();
        loop {
            if let Some(hit) = self.store.get(key).await {
                return Lookup::Hit(hit);
            }

            let wait_on = {
                let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
                match inflight.entry(key.to_string()) {
                    Entry::Occupied(entry) => Some(entry.get().clone()),
                    Entry::Vacant(entry) => {
                        entry.insert(Arc::new(Notify::new()));
                        None
                    }
                }
            };

            let notify = match wait_on {
                None => {
                    return Lookup::Miss(FlightGuard {
                        cache: Arc::clone(self),
                        key: key.to_string(),
                        done: false,
                    });
                }
                Some(notify) => notify,
            };

            // Register interest before re-checking, so a completion landing
            // between the checks still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.store.get(key).await {
                return Lookup::Hit(hit);
            }
            let still_inflight = {
                self.inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .contains_key(key)
            };
            if !still_inflight {
                // The flight ended without caching anything; race for it.
                continue;
            }
            notified.await;
        }
    }

    /// Fetch a fingerprint without claiming a flight
    pub async fn peek(&self, fp: &Fingerprint) -> Option<StepResult> {
        self.store.get(fp.as_str()).await
    }

    /// Insert a result directly (used for secondary query-digest writes)
    pub async fn insert(&self, fp: &Fingerprint, result: &StepResult) {
        self.store.set(fp.as_str(), result.clone(), self.ttl).await;
    }

    /// Drop every entry computed under the given schema version
    pub async fn invalidate_schema(&self, schema_version: &str) {
        tracing::debug!(
            schema_version = %schema_version,
            "Invalidating cache entries for schema version"
        );
        self.store
            .invalidate_prefix(&version_prefix(schema_version))
            .await;
    }

    fn release(&self, key: &str) {
        let notify = {
            self.inflight
                .lock()
                .expect("inflight lock poisoned")
                .remove(key)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

/// Exclusive claim on one fingerprint's computation
///
/// Dropping the guard without completing releases waiting requesters so one
/// of them can retry; nothing is cached on that path.
pub struct FlightGuard {
    cache: Arc<FingerprintCache>,
    key: String,
    done: bool,
}

impl FlightGuard {
    /// Publish a successful result and wake all waiters
    pub async fn complete(mut self, result: &StepResult) {
        self.cache
            .store
            .set(&self.key, result.clone(), self.cache.ttl)
            .await;
        self.done = true;
        self.cache.release(&self.key);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            self.cache.release(&self.key);
        }
    }
}
