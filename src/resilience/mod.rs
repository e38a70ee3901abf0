//! Resilience primitives: retry with exponential backoff.

pub mod retry;
