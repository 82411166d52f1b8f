//! Common utilities shared across the Tiller dispatch layer
//!
//! This crate provides the pieces used by every Tiller component:
//! error types and the observability bootstrap (structured logging and
//! dispatch metrics).
//!
//! # Module Organization
//!
//! - [`errors`]: Error types and result aliases
//! - [`observability`]: Logging initialization and Prometheus counters

pub mod errors;
pub mod observability;

// Re-export commonly used items at the crate root
pub use errors::{TillerError, TillerResult};
pub use observability::{init_tracing, DispatchMetrics};
