//! Request guard applying the host's failure policy.
//!
//! The engine reports a store outage as an error. The guard is where the
//! boundary layer decides what such an outage means for the request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::backend::RateLimiterBackend;
use super::decision::{Decision, Rejection};
use super::rules::Target;
use crate::error::{GuardError, Result};

/// What to do with a request when the counter store is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Let the request through unmetered.
    Open,
    /// Reject the request.
    #[default]
    Closed,
}

/// What the boundary layer should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Run the handler.
    Proceed,
    /// Answer with a 429 built from the rejection.
    Reject(Rejection),
    /// Answer with a 503; the store is down and the guard fails closed.
    Unavailable,
}

/// Guard in front of request handlers.
pub struct Guard<R: RateLimiterBackend> {
    limiter: Arc<R>,
    fail_mode: FailMode,
}

impl<R: RateLimiterBackend> Guard<R> {
    /// Create a guard over `limiter`.
    pub fn new(limiter: Arc<R>, fail_mode: FailMode) -> Self {
        info!(fail_mode = ?fail_mode, "Rate limit guard initialized");
        Self { limiter, fail_mode }
    }

    /// The configured failure policy.
    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    /// Decide what to do with a request.
    pub async fn check(&self, target: &Target, identity: &str) -> Verdict {
        match self.limiter.decide(target, identity).await {
            Ok(Decision::Allowed(_)) => Verdict::Proceed,
            Ok(Decision::Denied(rejection)) => Verdict::Reject(rejection),
            Err(GuardError::StoreUnavailable(err)) => {
                error!(route = %target, error = %err, fail_mode = ?self.fail_mode, "Rate limit store unavailable");
                match self.fail_mode {
                    FailMode::Open => Verdict::Proceed,
                    FailMode::Closed => Verdict::Unavailable,
                }
            }
            Err(err) => {
                warn!(route = %target, error = %err, "Rate limit check failed");
                Verdict::Unavailable
            }
        }
    }

    /// Like [`Guard::check`], but as a `Result` for `?`-style handlers.
    ///
    /// A denial becomes [`GuardError::LimitExceeded`]. A store outage is
    /// returned as-is when failing closed.
    pub async fn enforce(&self, target: &Target, identity: &str) -> Result<()> {
        match self.limiter.decide(target, identity).await {
            Ok(decision) => decision.into_result().map(|_| ()),
            Err(GuardError::StoreUnavailable(err)) if self.fail_mode == FailMode::Open => {
                error!(route = %target, error = %err, "Rate limit store unavailable; failing open");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
