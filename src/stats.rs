//! Usage counters for the idempotency layer
//!
//! Tracked atomically so the hot path stays lock-free. A snapshot is
//! serializable for health/diagnostic endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked across the lifetime of the middleware.
#[derive(Debug, Default)]
pub struct IdempotencyStats {
    /// Requests admitted into the idempotency path (valid key present).
    admissions: AtomicU64,
    /// Handler executions performed (leases acquired).
    executions: AtomicU64,
    /// Responses served from the store without re-execution.
    replays: AtomicU64,
    /// Fingerprint conflicts and no-wait in-progress rejections.
    conflicts: AtomicU64,
    /// Wait-policy timeouts.
    timeouts: AtomicU64,
    /// Requests rejected before admission (bad key, oversized body).
    rejected: AtomicU64,
}

impl IdempotencyStats {
    /// Create new statistics with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an admitted request.
    pub fn record_admission(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a handler execution.
    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a replayed response.
    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a conflict (fingerprint mismatch or no-wait in-progress).
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a wait-policy timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request rejected before admission.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of admitted requests served by replay (0.0-1.0).
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn replay_rate(&self) -> f64 {
        let admissions = self.admissions.load(Ordering::Relaxed);
        if admissions == 0 {
            0.0
        } else {
            self.replays.load(Ordering::Relaxed) as f64 / admissions as f64
        }
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admissions: self.admissions.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            replay_rate: self.replay_rate(),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    /// Requests admitted into the idempotency path.
    pub admissions: u64,
    /// Handler executions performed.
    pub executions: u64,
    /// Responses served from the store.
    pub replays: u64,
    /// Conflicts returned.
    pub conflicts: u64,
    /// Wait timeouts returned.
    pub timeouts: u64,
    /// Requests rejected before admission.
    pub rejected: u64,
    /// Fraction of admissions served by replay.
    pub replay_rate: f64,
}
