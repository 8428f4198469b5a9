//! In-process idempotency store
//!
//! Records live in a `DashMap` keyed by idempotency key, with a secondary
//! lease-token index so `complete`/`fail` resolve their record in O(1).
//! Atomicity of the reserve-or-observe step rides on the `DashMap` entry
//! (shard) lock, so concurrent `put_new_running` calls on one key are
//! serialized without a dedicated per-key mutex. Expired records are treated
//! as absent on every read and reclaimed lazily, either in place or by the
//! periodic sweeper.
//!
//! Lock ordering: every path that touches both maps takes the record shard
//! first and the lease index second.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::{IdempotencyStore, StoreError};
use crate::record::{IdempotencyRecord, LeaseResult, RequestState, StoredResponse};

/// Thread-safe in-process store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    /// Records keyed by idempotency key.
    records: DashMap<String, IdempotencyRecord>,
    /// Lease-token → key index for `complete`/`fail` lookups.
    leases: DashMap<String, String>,
}

impl InMemoryStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            leases: DashMap::new(),
        }
    }

    /// Current number of tracked records, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Return `true` when no records are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Transition the record owned by `lease_token` to a terminal state.
    ///
    /// The lease-index entry is kept after a successful transition so that a
    /// retried `complete`/`fail` with the same token reports `WrongState`
    /// instead of `UnknownLease`; the entry is purged with the record.
    fn finish(
        &self,
        lease_token: &str,
        response: StoredResponse,
        state: RequestState,
    ) -> Result<(), StoreError> {
        let key = {
            let Some(entry) = self.leases.get(lease_token) else {
                return Err(StoreError::UnknownLease);
            };
            entry.value().clone()
        };

        let Some(mut record) = self.records.get_mut(&key) else {
            self.leases.remove(lease_token);
            return Err(StoreError::UnknownLease);
        };

        if record.state != RequestState::Running {
            // Idempotent retry: this token already completed the record.
            return Err(StoreError::WrongState);
        }
        // A post-expiry re-lease supersedes the old token.
        if record.lease_token.as_deref() != Some(lease_token) {
            drop(record);
            self.leases.remove(lease_token);
            return Err(StoreError::UnknownLease);
        }
        if record.is_expired(Utc::now()) {
            drop(record);
            self.remove_if_expired(&key, Utc::now());
            return Err(StoreError::UnknownLease);
        }

        record.state = state;
        record.response = Some(response);
        record.lease_token = None;
        Ok(())
    }

    /// Remove the record under `key` if it is still expired, together with
    /// its lease-index entry.
    ///
    /// The expiry re-check runs under the entry lock: between an expired
    /// read and this call the key may have been re-leased, and that fresh
    /// record must survive.
    fn remove_if_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        if let Entry::Occupied(occupied) = self.records.entry(key.to_string()) {
            if occupied.get().is_expired(now) {
                if let Some(token) = &occupied.get().lease_token {
                    self.leases.remove(token);
                }
                occupied.remove();
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let Some(record) = self.records.get(key) else {
            return Ok(None);
        };
        if record.is_expired(Utc::now()) {
            // Expired - behaves as absent; reclaim in place.
            drop(record);
            self.remove_if_expired(key, Utc::now());
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    async fn put_new_running(
        &self,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
        trace_id: Option<String>,
    ) -> Result<LeaseResult, StoreError> {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(Utc::now()) {
                    // Shadow the lapsed record with a fresh lease.
                    if let Some(token) = &occupied.get().lease_token {
                        self.leases.remove(token);
                    }
                    let record = IdempotencyRecord::new_running(key, fingerprint, ttl, trace_id);
                    let Some(lease_token) = record.lease_token.clone() else {
                        return Err(StoreError::Unavailable("record missing lease".to_string()));
                    };
                    self.leases.insert(lease_token.clone(), key.to_string());
                    occupied.insert(record);
                    Ok(LeaseResult::Acquired { lease_token })
                } else {
                    Ok(LeaseResult::Held {
                        record: occupied.get().clone(),
                    })
                }
            }
            Entry::Vacant(vacant) => {
                let record = IdempotencyRecord::new_running(key, fingerprint, ttl, trace_id);
                let Some(lease_token) = record.lease_token.clone() else {
                    return Err(StoreError::Unavailable("record missing lease".to_string()));
                };
                self.leases.insert(lease_token.clone(), key.to_string());
                vacant.insert(record);
                Ok(LeaseResult::Acquired { lease_token })
            }
        }
    }

    async fn complete(
        &self,
        lease_token: &str,
        response: StoredResponse,
    ) -> Result<(), StoreError> {
        self.finish(lease_token, response, RequestState::Completed)
    }

    async fn fail(&self, lease_token: &str, response: StoredResponse) -> Result<(), StoreError> {
        self.finish(lease_token, response, RequestState::Failed)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter_map(|entry| entry.value().is_expired(now).then(|| entry.key().clone()))
            .collect();

        let mut removed = 0;
        for key in stale {
            // The expiry re-check inside runs under the entry lock: the
            // key may have been re-leased since the scan.
            if self.remove_if_expired(&key, now) {
                removed += 1;
            }
        }

        // Purge lease-index entries whose record is gone. Tokens of terminal
        // records stay indexed until here so retried completions can be told
        // apart from unknown leases.
        let index: Vec<(String, String)> = self
            .leases
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (token, key) in index {
            if !self.records.contains_key(&key) {
                self.leases.remove(&token);
            }
        }

        if removed > 0 {
            debug!(removed, "Removed expired idempotency records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const FP: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn response(status: u16) -> StoredResponse {
        StoredResponse {
            status,
            headers: std::collections::BTreeMap::new(),
            body: bytes::Bytes::from_static(b"{}"),
            execution_time_ms: 7,
        }
    }

    async fn acquire(store: &InMemoryStore, key: &str, ttl: Duration) -> String {
        match store.put_new_running(key, FP, ttl, None).await.unwrap() {
            LeaseResult::Acquired { lease_token } => lease_token,
            LeaseResult::Held { .. } => panic!("expected a fresh lease for {key}"),
        }
    }

    // ── put_new_running ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_reservation_acquires_a_lease() {
        // GIVEN: an empty store
        // WHEN: reserving a new key
        // THEN: the lease is acquired and the record is RUNNING
        let store = InMemoryStore::new();
        let token = acquire(&store, "k1", Duration::from_secs(60)).await;
        assert!(!token.is_empty());

        let record = store.get("k1").await.unwrap().expect("record must exist");
        assert_eq!(record.state, RequestState::Running);
        assert_eq!(record.lease_token.as_deref(), Some(token.as_str()));
        assert!(record.response.is_none());
    }

    #[tokio::test]
    async fn second_reservation_returns_the_existing_record() {
        // GIVEN: a key that is already leased
        // WHEN: a second caller reserves it
        // THEN: Held with the RUNNING record
        let store = InMemoryStore::new();
        acquire(&store, "k1", Duration::from_secs(60)).await;

        match store
            .put_new_running("k1", FP, Duration::from_secs(60), None)
            .await
            .unwrap()
        {
            LeaseResult::Held { record } => assert_eq!(record.state, RequestState::Running),
            LeaseResult::Acquired { .. } => panic!("second reservation must not acquire"),
        }
    }

    #[tokio::test]
    async fn expired_record_is_shadowed_by_a_fresh_lease() {
        // GIVEN: a record whose TTL has elapsed
        // WHEN: reserving the same key again
        // THEN: a fresh lease is acquired and the old one is dead
        let store = InMemoryStore::new();
        let old_token = acquire(&store, "k1", Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let new_token = acquire(&store, "k1", Duration::from_secs(60)).await;
        assert_ne!(old_token, new_token);

        // The superseded lease can no longer complete.
        let err = store.complete(&old_token, response(200)).await.unwrap_err();
        assert_eq!(err, StoreError::UnknownLease);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_elect_exactly_one_winner() {
        // GIVEN: 16 parallel reservations of the same key
        // WHEN: they race
        // THEN: exactly one acquires; the rest observe the winner's record
        let store = Arc::new(InMemoryStore::new());
        let results = futures::future::join_all((0..16).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .put_new_running("race", FP, Duration::from_secs(60), None)
                    .await
                    .unwrap()
            })
        }))
        .await;

        let acquired = results
            .into_iter()
            .map(|r| r.expect("task must not panic"))
            .filter(|r| matches!(r, LeaseResult::Acquired { .. }))
            .count();
        assert_eq!(acquired, 1);
        assert_eq!(store.len(), 1);
    }

    // ── get / expiry ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn get_returns_none_for_unknown_key() {
        let store = InMemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_record_is_absent_before_cleanup_runs() {
        // GIVEN: a record past its TTL, sweeper never invoked
        // WHEN: reading the key
        // THEN: absent, and the record is reclaimed in place
        let store = InMemoryStore::new();
        acquire(&store, "k1", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.get("k1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    // ── complete / fail ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn complete_stores_the_response_and_clears_the_lease() {
        let store = InMemoryStore::new();
        let token = acquire(&store, "k1", Duration::from_secs(60)).await;

        store.complete(&token, response(201)).await.unwrap();

        let record = store.get("k1").await.unwrap().expect("record must exist");
        assert_eq!(record.state, RequestState::Completed);
        assert_eq!(record.response.as_ref().map(|r| r.status), Some(201));
        assert!(record.lease_token.is_none());
    }

    #[tokio::test]
    async fn fail_stores_the_artifact_as_failed() {
        let store = InMemoryStore::new();
        let token = acquire(&store, "k1", Duration::from_secs(60)).await;

        store.fail(&token, response(500)).await.unwrap();

        let record = store.get("k1").await.unwrap().expect("record must exist");
        assert_eq!(record.state, RequestState::Failed);
        assert_eq!(record.response.as_ref().map(|r| r.status), Some(500));
    }

    #[tokio::test]
    async fn complete_preserves_expires_at() {
        let store = InMemoryStore::new();
        let token = acquire(&store, "k1", Duration::from_secs(60)).await;
        let before = store.get("k1").await.unwrap().unwrap().expires_at;

        store.complete(&token, response(200)).await.unwrap();

        let after = store.get("k1").await.unwrap().unwrap().expires_at;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected_without_side_effects() {
        // A token that does not match the stored lease is a no-op.
        let store = InMemoryStore::new();
        acquire(&store, "k1", Duration::from_secs(60)).await;

        let err = store
            .complete("not-a-lease", response(200))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::UnknownLease);

        let record = store.get("k1").await.unwrap().unwrap();
        assert_eq!(record.state, RequestState::Running);
    }

    #[tokio::test]
    async fn double_complete_reports_wrong_state() {
        // GIVEN: a lease that already completed its record
        // WHEN: the same token retries the transition
        // THEN: WrongState, and the stored response is untouched
        let store = InMemoryStore::new();
        let token = acquire(&store, "k1", Duration::from_secs(60)).await;
        store.complete(&token, response(200)).await.unwrap();

        let err = store.complete(&token, response(503)).await.unwrap_err();
        assert_eq!(err, StoreError::WrongState);

        let record = store.get("k1").await.unwrap().unwrap();
        assert_eq!(record.response.as_ref().map(|r| r.status), Some(200));
    }

    #[tokio::test]
    async fn cleanup_purges_tokens_of_expired_completed_records() {
        let store = InMemoryStore::new();
        let token = acquire(&store, "k1", Duration::from_millis(10)).await;
        store.complete(&token, response(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.cleanup_expired(Utc::now()).await.unwrap();

        assert!(store.is_empty());
        assert!(store.leases.is_empty());
    }

    // ── cleanup_expired ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_removes_only_expired_records() {
        let store = InMemoryStore::new();
        acquire(&store, "short", Duration::from_millis(10)).await;
        acquire(&store, "long", Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = store.cleanup_expired(Utc::now()).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_reclaims_the_lease_index() {
        let store = InMemoryStore::new();
        let token = acquire(&store, "k1", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.cleanup_expired(Utc::now()).await.unwrap();

        let err = store.complete(&token, response(200)).await.unwrap_err();
        assert_eq!(err, StoreError::UnknownLease);
        assert!(store.leases.is_empty());
    }

    #[tokio::test]
    async fn cleanup_of_an_empty_store_is_a_noop() {
        let store = InMemoryStore::new();
        assert_eq!(store.cleanup_expired(Utc::now()).await.unwrap(), 0);
    }
}
