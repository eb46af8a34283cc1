//! Rate limiting logic: policies, bucket keys and the decision engine.

mod backend;
mod decision;
mod guard;
mod identity;
mod limiter;
mod rules;

pub use backend::RateLimiterBackend;
pub use decision::{Allowance, Decision, DenyReason, Rejection, TOO_MANY_REQUESTS};
pub use guard::{FailMode, Guard, Verdict};
pub use identity::{BucketKey, IdentityHasher, DEFAULT_NAMESPACE};
pub use limiter::DecisionEngine;
pub use rules::{HandlerConfig, Policy, PolicyTable, Resolved, RouteConfig, Scope, Target};
