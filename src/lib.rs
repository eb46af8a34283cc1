//! Turnstile - Distributed Fixed-Window Rate Limiting
//!
//! This crate decides whether a client request may proceed under a per-route
//! budget. Counters live in a shared store (Redis in production), so any
//! number of request workers across processes can consult the same budget.
//! The store's atomic increment is the only synchronization point.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
