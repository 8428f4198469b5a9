//! Storage contract for idempotency records
//!
//! Stores hold one [`IdempotencyRecord`] per key and expose an atomic lease
//! reservation primitive. All operations on a single key are linearizable;
//! no ordering is guaranteed across distinct keys. The crate ships an
//! in-process implementation ([`InMemoryStore`]); distributed stores plug in
//! by implementing [`IdempotencyStore`].

mod memory;
mod sweeper;

pub use memory::InMemoryStore;
pub use sweeper::Sweeper;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::{IdempotencyRecord, LeaseResult, StoredResponse};

/// Store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The lease token is not found, or the record it pointed at has been
    /// superseded by a post-expiry re-lease.
    #[error("Lease token not found or superseded")]
    UnknownLease,

    /// The record exists but is no longer `Running` (e.g. an idempotent
    /// retry of `complete`).
    #[error("Record is not in the running state")]
    WrongState,

    /// Transient store fault. Surfaced to the client as a 500 and never
    /// recorded as an idempotency artifact.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed repository of idempotency records with atomic lease acquisition.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Return the record under `key` if it exists and is unexpired.
    ///
    /// Never returns an expired record, even before the sweeper has run.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Atomically reserve `key`: if no unexpired record exists, write a
    /// `Running` record with a fresh lease token and `expires_at = now + ttl`
    /// and return [`LeaseResult::Acquired`]; otherwise return the existing
    /// record as [`LeaseResult::Held`].
    async fn put_new_running(
        &self,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
        trace_id: Option<String>,
    ) -> Result<LeaseResult, StoreError>;

    /// Transition the record owned by `lease_token` to `Completed`, storing
    /// `response` and clearing the lease. `expires_at` is preserved.
    async fn complete(&self, lease_token: &str, response: StoredResponse)
    -> Result<(), StoreError>;

    /// Transition the record owned by `lease_token` to `Failed`, storing
    /// `response` and clearing the lease. `expires_at` is preserved.
    async fn fail(&self, lease_token: &str, response: StoredResponse) -> Result<(), StoreError>;

    /// Remove every record with `expires_at <= now`; return how many were
    /// removed. Safe to run concurrently with all other operations.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}
