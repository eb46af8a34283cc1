//! Error types for the Turnstile rate limiter.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// The counter store could not be reached or failed mid-operation.
    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The client exhausted its budget for the current window.
    ///
    /// The message is shown to clients verbatim, so it carries no identity
    /// or bucket details.
    #[error("Too many requests. Please try again later.")]
    LimitExceeded {
        /// Estimated time until the window resets
        retry_after: Duration,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    /// HTTP status code a boundary layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GuardError::LimitExceeded { .. } => 429,
            GuardError::StoreUnavailable(_) => 503,
            GuardError::Config(_) | GuardError::Io(_) => 500,
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, GuardError>;
