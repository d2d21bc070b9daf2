//! Resilience patterns for Hive
//!
//! This crate provides the backoff schedule used by IPC clients when they
//! re-establish a lost connection.

pub mod backoff;

// Re-export commonly used types
pub use backoff::{BackoffCalculator, DEFAULT_MAX_DELAY};
