//! Rate limiter trait for abstracting over decision engines.

use async_trait::async_trait;

use super::decision::Decision;
use super::limiter::DecisionEngine;
use super::rules::Target;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// Lets a [`Guard`](super::Guard) front the store-backed engine or any
/// other source of decisions.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether a request from `identity` to `target` may proceed.
    async fn decide(&self, target: &Target, identity: &str) -> Result<Decision>;
}

#[async_trait]
impl RateLimiterBackend for DecisionEngine {
    async fn decide(&self, target: &Target, identity: &str) -> Result<Decision> {
        DecisionEngine::decide(self, target, identity).await
    }
}
