// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Response cache for idempotent commands.
//!
//! Keyed by (command name, correlation id, invoker id). A reserved slot is
//! inserted when execution begins so concurrent duplicates coalesce onto the
//! same work item and receive identical responses; completed entries are
//! replayed until their TTL elapses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgelink_mqtt::control_packet::PublishProperties;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Cache key uniquely identifying a command request.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct CacheKey {
    pub command_name: String,
    pub correlation_id: Uuid,
    pub invoker_id: String,
}

/// A fully serialized response, replayable on the wire.
#[derive(Clone, Debug)]
pub(crate) struct CachedResponse {
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
}

/// Progress of a pending cache slot, broadcast to coalesced waiters.
#[derive(Clone, Debug)]
pub(crate) enum PendingState {
    /// Execution in progress
    Waiting,
    /// Execution finished; [`None`] means the executing side went away
    /// without producing a response.
    Done(Option<Arc<CachedResponse>>),
}

enum Entry {
    Pending(watch::Receiver<PendingState>),
    Ready {
        response: Arc<CachedResponse>,
        expiration: Instant,
    },
}

/// Outcome of a cache consultation.
pub(crate) enum CacheOutcome {
    /// A live cached response to replay without re-executing.
    Hit(Arc<CachedResponse>),
    /// Another arrival holds the slot; await its result.
    Coalesced(watch::Receiver<PendingState>),
    /// The slot is now reserved for this arrival; execute and complete it.
    Reserved(CacheReservation),
}

/// Response cache for one command executor.
pub(crate) struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    /// Consult the cache for `key`, reserving the slot when absent.
    ///
    /// Expired entries encountered here are evicted.
    pub fn lookup_or_reserve(self: &Arc<Self>, key: CacheKey) -> CacheOutcome {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(Entry::Ready {
                response,
                expiration,
            }) => {
                if expiration.elapsed().is_zero() {
                    return CacheOutcome::Hit(response.clone());
                }
                entries.remove(&key);
            }
            Some(Entry::Pending(rx)) => return CacheOutcome::Coalesced(rx.clone()),
            None => {}
        }
        let (tx, rx) = watch::channel(PendingState::Waiting);
        entries.insert(key.clone(), Entry::Pending(rx));
        CacheOutcome::Reserved(CacheReservation {
            cache: self.clone(),
            key,
            tx,
            completed: false,
        })
    }

    /// Evict every expired entry. Pending slots are never evicted here.
    pub fn sweep(&self) {
        self.entries.lock().unwrap().retain(|_, entry| match entry {
            Entry::Pending(_) => true,
            Entry::Ready { expiration, .. } => expiration.elapsed().is_zero(),
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Exclusive right to fill one reserved cache slot.
pub(crate) struct CacheReservation {
    cache: Arc<ResponseCache>,
    key: CacheKey,
    tx: watch::Sender<PendingState>,
    completed: bool,
}

impl CacheReservation {
    /// Deliver the response to coalesced waiters. When `store` is set the
    /// response is retained for the cache TTL; otherwise the slot is freed
    /// (used for responses that must not be replayed, like 408).
    pub fn complete(mut self, response: Arc<CachedResponse>, store: bool) {
        self.completed = true;
        let _ = self.tx.send(PendingState::Done(Some(response.clone())));
        let mut entries = self.cache.entries.lock().unwrap();
        if store {
            entries.insert(
                self.key.clone(),
                Entry::Ready {
                    response,
                    expiration: Instant::now() + self.cache.ttl,
                },
            );
        } else {
            entries.remove(&self.key);
        }
    }
}

impl Drop for CacheReservation {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.tx.send(PendingState::Done(None));
            self.cache.entries.lock().unwrap().remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(correlation_id: Uuid) -> CacheKey {
        CacheKey {
            command_name: "increment".to_string(),
            correlation_id,
            invoker_id: "invoker-1".to_string(),
        }
    }

    fn response(payload: &[u8]) -> Arc<CachedResponse> {
        Arc::new(CachedResponse {
            payload: payload.to_vec(),
            properties: PublishProperties::default(),
        })
    }

    #[tokio::test]
    async fn stored_response_replayed_until_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        let CacheOutcome::Reserved(reservation) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected reservation");
        };
        reservation.complete(response(b"42"), true);

        match cache.lookup_or_reserve(key(id)) {
            CacheOutcome::Hit(hit) => assert_eq!(hit.payload, b"42"),
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn expired_entry_evicted_on_access() {
        tokio::time::pause();
        let cache = ResponseCache::new(Duration::from_secs(10));
        let id = Uuid::new_v4();

        let CacheOutcome::Reserved(reservation) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected reservation");
        };
        reservation.complete(response(b"42"), true);

        tokio::time::advance(Duration::from_secs(11)).await;
        match cache.lookup_or_reserve(key(id)) {
            CacheOutcome::Reserved(_) => {}
            _ => panic!("expected fresh reservation after expiry"),
        }
    }

    #[tokio::test]
    async fn concurrent_duplicates_coalesce() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        let CacheOutcome::Reserved(reservation) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected reservation");
        };
        let CacheOutcome::Coalesced(mut rx) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected coalesced duplicate");
        };

        reservation.complete(response(b"same"), true);
        let state = rx.wait_for(|s| matches!(s, PendingState::Done(_))).await;
        match &*state.unwrap() {
            PendingState::Done(Some(r)) => assert_eq!(r.payload, b"same"),
            other => panic!("expected completed response, got {other:?}"),
        };
    }

    #[tokio::test]
    async fn uncached_completion_frees_slot() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        let CacheOutcome::Reserved(reservation) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected reservation");
        };
        reservation.complete(response(b"timeout"), false);

        // Not retained, so the next arrival executes afresh
        assert!(matches!(
            cache.lookup_or_reserve(key(id)),
            CacheOutcome::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn dropped_reservation_notifies_waiters() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        let CacheOutcome::Reserved(reservation) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected reservation");
        };
        let CacheOutcome::Coalesced(mut rx) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected coalesced duplicate");
        };

        drop(reservation);
        let state = rx.wait_for(|s| matches!(s, PendingState::Done(_))).await;
        assert!(matches!(&*state.unwrap(), PendingState::Done(None)));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired() {
        tokio::time::pause();
        let cache = ResponseCache::new(Duration::from_secs(10));
        let old_id = Uuid::new_v4();
        let new_id = Uuid::new_v4();

        let CacheOutcome::Reserved(r) = cache.lookup_or_reserve(key(old_id)) else {
            panic!("expected reservation");
        };
        r.complete(response(b"old"), true);

        tokio::time::advance(Duration::from_secs(8)).await;
        let CacheOutcome::Reserved(r) = cache.lookup_or_reserve(key(new_id)) else {
            panic!("expected reservation");
        };
        r.complete(response(b"new"), true);

        tokio::time::advance(Duration::from_secs(4)).await;
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(matches!(
            cache.lookup_or_reserve(key(new_id)),
            CacheOutcome::Hit(_)
        ));
    }

    #[tokio::test]
    async fn distinct_invokers_do_not_share_entries() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        let CacheOutcome::Reserved(r) = cache.lookup_or_reserve(key(id)) else {
            panic!("expected reservation");
        };
        r.complete(response(b"a"), true);

        let other_invoker = CacheKey {
            invoker_id: "invoker-2".to_string(),
            ..key(id)
        };
        assert!(matches!(
            cache.lookup_or_reserve(other_invoker),
            CacheOutcome::Reserved(_)
        ));
    }
}
