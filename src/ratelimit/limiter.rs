//! The decision engine.
//!
//! Each check resolves the target's policy, derives the bucket key, issues
//! one atomic increment and, only on the increment that opened the window,
//! sets the key's TTL. A later increment that finds the key without a TTL
//! restores it without touching a running window. All synchronization between
//! concurrent checks is left to the store; the engine holds no lock across a
//! store call.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, trace, warn};

use super::decision::{Allowance, Decision, DenyReason, Rejection};
use super::identity::IdentityHasher;
use super::rules::{PolicyTable, Resolved, Target};
use crate::error::Result;
use crate::store::CounterStore;

/// Fixed-window rate limiter over a shared counter store.
pub struct DecisionEngine {
    store: Arc<dyn CounterStore>,
    hasher: IdentityHasher,
    policies: RwLock<PolicyTable>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("hasher", &self.hasher)
            .field("policies", &*self.policies.read())
            .finish()
    }
}

impl DecisionEngine {
    /// Create an engine with the default policy table and an unsalted hasher.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_policies(store, PolicyTable::new(), IdentityHasher::new())
    }

    /// Create an engine with an explicit policy table and hasher.
    pub fn with_policies(
        store: Arc<dyn CounterStore>,
        policies: PolicyTable,
        hasher: IdentityHasher,
    ) -> Self {
        policies.report_invalid();
        Self {
            store,
            hasher,
            policies: RwLock::new(policies),
        }
    }

    /// Swap in a new policy table.
    ///
    /// Counters already in the store keep the window they were opened with.
    pub fn set_policies(&self, policies: PolicyTable) {
        policies.report_invalid();
        *self.policies.write() = policies;
    }

    /// Get a copy of the current policy table.
    pub fn policies(&self) -> PolicyTable {
        self.policies.read().clone()
    }

    /// Resolve the policy that governs `target`.
    pub fn resolve(&self, target: &Target) -> Resolved {
        self.policies.read().resolve(target)
    }

    /// Decide whether the request from `identity` to `target` may proceed.
    ///
    /// A store failure is returned as an error; it is never turned into an
    /// allow or a deny here. An increment that reached the store stays
    /// counted even if this future is dropped before it completes.
    #[instrument(skip_all, fields(route = %target))]
    pub async fn decide(&self, target: &Target, identity: &str) -> Result<Decision> {
        let Resolved {
            policy, namespace, ..
        } = self.resolve(target);

        if !policy.is_valid() {
            debug!(
                limit = policy.limit,
                window_ms = policy.window_ms,
                "Denying request under invalid policy"
            );
            return Ok(Decision::Denied(Rejection {
                reason: DenyReason::InvalidPolicy,
                limit: policy.limit,
                retry_after: None,
            }));
        }

        let key = self.hasher.bucket_key(&namespace, identity);
        trace!(key = %key, limit = policy.limit, window_ms = policy.window_ms, "Checking rate limit");

        let hit = self.store.increment(key.as_str()).await?;

        let expires_in = if hit.is_first() {
            self.store.expire_after(key.as_str(), policy.window()).await?;
            trace!(key = %key, window_ms = policy.window_ms, "Opened rate limit window");
            Some(policy.window())
        } else if hit.expires_in.is_none() {
            // The request that opened this window never set its TTL.
            warn!(key = %key, count = hit.count, "Rate limit counter has no TTL");
            self.store.expire_if_unset(key.as_str(), policy.window()).await?;
            Some(policy.window())
        } else {
            hit.expires_in
        };

        if hit.count > policy.limit {
            debug!(
                key = %key,
                count = hit.count,
                limit = policy.limit,
                "Rate limit exceeded"
            );
            return Ok(Decision::Denied(Rejection {
                reason: DenyReason::LimitExceeded,
                limit: policy.limit,
                retry_after: Some(expires_in.unwrap_or_else(|| policy.window())),
            }));
        }

        Ok(Decision::Allowed(Allowance {
            limit: policy.limit,
            remaining: policy.limit - hit.count,
            reset_after: expires_in,
        }))
    }
}
