//! Outcome of a rate limit check.

use std::time::Duration;

use serde::Serialize;

use crate::error::GuardError;

/// Public text for a denied request. Carries no identity or key details.
pub const TOO_MANY_REQUESTS: &str = "Too many requests. Please try again later.";

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The window's budget is spent.
    LimitExceeded,
    /// The governing policy has a zero limit or window.
    InvalidPolicy,
}

/// Budget details for an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allowance {
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window resets, when the store reported it
    #[serde(with = "millis_opt")]
    pub reset_after: Option<Duration>,
}

impl Allowance {
    /// Rate limit headers for a successful response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
        ]
    }
}

/// Details for building a 429 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: DenyReason,
    pub limit: u64,
    /// Estimated wait before the window resets. `None` when no wait helps.
    #[serde(with = "millis_opt")]
    pub retry_after: Option<Duration>,
}

impl Rejection {
    /// HTTP status for the response.
    pub fn status_code(&self) -> u16 {
        429
    }

    /// Client-facing message.
    pub fn message(&self) -> &'static str {
        TOO_MANY_REQUESTS
    }

    /// `Retry-After` in whole seconds, rounded up and never below 1.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|wait| {
            let secs = wait.as_secs();
            let secs = if wait.subsec_nanos() > 0 {
                secs.saturating_add(1)
            } else {
                secs
            };
            secs.max(1)
        })
    }

    /// Headers for the 429 response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(3);
        if let Some(secs) = self.retry_after_secs() {
            headers.push(("Retry-After", secs.to_string()));
        }
        headers.push(("X-RateLimit-Limit", self.limit.to_string()));
        headers.push(("X-RateLimit-Remaining", "0".to_string()));
        headers
    }
}

/// The decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Allowed(Allowance),
    Denied(Rejection),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    /// Turn a denial into [`GuardError::LimitExceeded`].
    pub fn into_result(self) -> Result<Allowance, GuardError> {
        match self {
            Decision::Allowed(allowance) => Ok(allowance),
            Decision::Denied(rejection) => Err(GuardError::LimitExceeded {
                retry_after: rejection.retry_after.unwrap_or(Duration::ZERO),
            }),
        }
    }
}

mod millis_opt {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection(retry_after: Option<Duration>) -> Rejection {
        Rejection {
            reason: DenyReason::LimitExceeded,
            limit: 3,
            retry_after,
        }
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(rejection(Some(Duration::from_millis(1))).retry_after_secs(), Some(1));
        assert_eq!(rejection(Some(Duration::from_secs(2))).retry_after_secs(), Some(2));
        assert_eq!(rejection(Some(Duration::from_millis(2500))).retry_after_secs(), Some(3));
        assert_eq!(rejection(None).retry_after_secs(), None);
    }

    #[test]
    fn test_expired_window_still_asks_for_a_second() {
        assert_eq!(rejection(Some(Duration::ZERO)).retry_after_secs(), Some(1));

        let headers = rejection(Some(Duration::ZERO)).headers();
        assert_eq!(headers[0], ("Retry-After", "1".to_string()));
    }

    #[test]
    fn test_huge_wait_saturates() {
        let json = serde_json::to_value(rejection(Some(Duration::MAX))).unwrap();
        assert_eq!(json["retry_after"], u64::MAX);
        assert_eq!(rejection(Some(Duration::MAX)).retry_after_secs(), Some(u64::MAX));
    }

    #[test]
    fn test_rejection_headers() {
        let headers = rejection(Some(Duration::from_millis(900))).headers();
        assert_eq!(
            headers,
            vec![
                ("Retry-After", "1".to_string()),
                ("X-RateLimit-Limit", "3".to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
            ]
        );

        let headers = rejection(None).headers();
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_into_result() {
        let allowed = Decision::Allowed(Allowance {
            limit: 3,
            remaining: 2,
            reset_after: None,
        });
        assert_eq!(allowed.into_result().unwrap().remaining, 2);

        let denied = Decision::Denied(rejection(Some(Duration::from_secs(5))));
        match denied.into_result() {
            Err(GuardError::LimitExceeded { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(5));
            }
            other => panic!("expected LimitExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_decision_serializes_without_identity() {
        let denied = Decision::Denied(rejection(Some(Duration::from_millis(1500))));
        let json = serde_json::to_value(denied).unwrap();

        assert_eq!(json["decision"], "denied");
        assert_eq!(json["reason"], "limit_exceeded");
        assert_eq!(json["retry_after"], 1500);
        assert_eq!(rejection(None).message(), TOO_MANY_REQUESTS);
    }
}
