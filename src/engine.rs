//! Per-key idempotency state machine
//!
//! Decides the outcome of an admitted request: execute the handler under a
//! fresh lease, replay a stored response, report a fingerprint conflict,
//! report in-progress (no-wait), or time out waiting.
//!
//! # Single flight
//!
//! For any set of concurrent admissions sharing a key, exactly one acquires
//! the lease and executes the handler; the rest either replay its result or
//! observe the RUNNING record per the wait policy.
//!
//! # Crash and cancellation safety
//!
//! The handler runs inside a spawned task that records a terminal state
//! (`complete` or `fail`) before the admission future observes the result,
//! so an upstream disconnect cannot leave the record RUNNING until expiry
//! with the side effect already performed. A genuinely crashed executor is
//! covered by the TTL: once `expires_at` passes, the key reads as absent
//! and the next admission acquires a fresh lease; the stale lease token is
//! then rejected by the store.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::config::{IdempotencyConfig, WaitPolicy};
use crate::record::{IdempotencyRecord, LeaseResult, RequestState, StoredResponse};
use crate::store::IdempotencyStore;
use crate::{Error, Result};

/// Outcome of handling an admitted request.
#[derive(Debug)]
pub enum Outcome {
    /// The handler ran under this admission's lease.
    Executed(StoredResponse),
    /// A stored terminal response was found for a matching fingerprint.
    Replayed(StoredResponse),
    /// The stored record belongs to a request with a different fingerprint.
    Conflict,
    /// A RUNNING record exists and the policy is no-wait.
    InProgress {
        /// Suggested client back-off in seconds.
        retry_after: u64,
    },
    /// Waiting on the RUNNING record exceeded the execution timeout.
    TimedOut {
        /// Suggested client back-off in seconds.
        retry_after: u64,
    },
}

/// Result of one wait-policy polling session.
enum WaitResult {
    /// The record reached COMPLETED or FAILED.
    Terminal(IdempotencyRecord),
    /// The record expired mid-wait; the key is free again.
    Vacated,
    /// The deadline elapsed with the record still RUNNING.
    TimedOut(IdempotencyRecord),
}

/// The per-key state machine.
pub struct StateEngine {
    store: Arc<dyn IdempotencyStore>,
    wait_policy: WaitPolicy,
    execution_timeout: std::time::Duration,
    wait_poll_interval: std::time::Duration,
}

impl StateEngine {
    /// Create an engine over `store` configured per `config`.
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>, config: &IdempotencyConfig) -> Self {
        Self {
            store,
            wait_policy: config.wait_policy,
            execution_timeout: config.execution_timeout(),
            wait_poll_interval: config.wait_poll_interval(),
        }
    }

    /// Decide the outcome for an admitted request.
    ///
    /// `handler` is invoked at most once, and only when this admission wins
    /// the lease. The returned [`StoredResponse`] has `execution_time_ms`
    /// filled in by the engine.
    ///
    /// # Errors
    ///
    /// Propagates store faults; those are surfaced as 500 and never cached.
    pub async fn handle<F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        ttl: std::time::Duration,
        trace_id: Option<String>,
        handler: F,
    ) -> Result<Outcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoredResponse> + Send + 'static,
    {
        let mut handler = Some(handler);
        loop {
            let existing = match self.store.get(key).await? {
                Some(record) => record,
                None => {
                    match self
                        .store
                        .put_new_running(key, fingerprint, ttl, trace_id.clone())
                        .await?
                    {
                        LeaseResult::Acquired { lease_token } => {
                            let handler = handler
                                .take()
                                .ok_or_else(|| Error::Internal("handler already consumed".to_string()))?;
                            let response = self.execute(key, &lease_token, handler).await?;
                            return Ok(Outcome::Executed(response));
                        }
                        // Lost the reservation race; inspect the winner's record.
                        LeaseResult::Held { record } => record,
                    }
                }
            };

            match existing.state {
                RequestState::Completed | RequestState::Failed => {
                    return terminal_outcome(&existing, fingerprint);
                }
                RequestState::Running => match self.wait_policy {
                    WaitPolicy::NoWait => {
                        debug!(key, "In-progress record under no-wait policy");
                        return Ok(Outcome::InProgress {
                            retry_after: self.retry_after(&existing),
                        });
                    }
                    WaitPolicy::Wait => match self.wait_for_terminal(key).await? {
                        WaitResult::Terminal(record) => {
                            return terminal_outcome(&record, fingerprint);
                        }
                        // Expired mid-wait; loop back into fresh acquisition.
                        WaitResult::Vacated => {}
                        WaitResult::TimedOut(record) => {
                            return Ok(Outcome::TimedOut {
                                retry_after: self.retry_after(&record),
                            });
                        }
                    },
                },
            }
        }
    }

    /// Run the handler under the lease and record the terminal state.
    ///
    /// The work is spawned so that dropping the admission future (upstream
    /// cancellation) cannot abandon the lease mid-flight.
    async fn execute<F, Fut>(&self, key: &str, lease_token: &str, handler: F) -> Result<StoredResponse>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoredResponse> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let token = lease_token.to_string();
        let key = key.to_string();
        let timeout = self.execution_timeout;

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(timeout, AssertUnwindSafe(handler()).catch_unwind()).await;

            let (mut response, failed) = match outcome {
                Ok(Ok(response)) => (response, false),
                Ok(Err(_)) => {
                    warn!(key = %key, "Handler panicked; storing a failed artifact");
                    (StoredResponse::internal_error("handler panicked"), true)
                }
                Err(_) => {
                    warn!(key = %key, "Handler exceeded the execution timeout");
                    (StoredResponse::internal_error("handler timed out"), true)
                }
            };
            response.execution_time_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

            let recorded = if failed {
                store.fail(&token, response.clone()).await
            } else {
                store.complete(&token, response.clone()).await
            };
            if let Err(e) = recorded {
                // The record expired (and was possibly re-leased) while the
                // handler ran; this caller still gets its own response.
                warn!(key = %key, error = %e, "Could not record terminal state");
            }
            response
        });

        task.await
            .map_err(|e| Error::Internal(format!("executor task failed: {e}")))
    }

    /// Poll `get(key)` until the record leaves RUNNING or the deadline hits.
    async fn wait_for_terminal(&self, key: &str) -> Result<WaitResult> {
        let deadline = Instant::now() + self.execution_timeout;
        loop {
            tokio::time::sleep(self.wait_poll_interval).await;
            match self.store.get(key).await? {
                None => return Ok(WaitResult::Vacated),
                Some(record) if record.state.is_terminal() => {
                    return Ok(WaitResult::Terminal(record));
                }
                Some(record) => {
                    if Instant::now() >= deadline {
                        return Ok(WaitResult::TimedOut(record));
                    }
                }
            }
        }
    }

    /// `Retry-After` hint: seconds until the record expires, clamped to
    /// `[1, execution_timeout]`.
    fn retry_after(&self, record: &IdempotencyRecord) -> u64 {
        record
            .seconds_until_expiry(Utc::now())
            .clamp(1, self.execution_timeout.as_secs().max(1))
    }
}

/// Map a terminal record to replay or conflict for `fingerprint`.
fn terminal_outcome(record: &IdempotencyRecord, fingerprint: &str) -> Result<Outcome> {
    if record.fingerprint != fingerprint {
        debug!(key = %record.key, "Fingerprint mismatch on stored record");
        return Ok(Outcome::Conflict);
    }
    match &record.response {
        Some(response) => Ok(Outcome::Replayed(response.clone())),
        None => Err(Error::Internal(
            "terminal record is missing its response".to_string(),
        )),
    }
}
