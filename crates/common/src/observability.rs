//! Observability module for the Tiller dispatch layer
//!
//! Provides the tracing/logging bootstrap and the Prometheus counters
//! surrounding dispatch: attempts, retries, and empty-pool rejections.

use anyhow::Result;
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing/logging subsystem
pub fn init_tracing() -> Result<()> {
    // Use JSON format for structured logging in production
    let json_layer =
        if std::env::var("TILLER_LOG_FORMAT").unwrap_or_else(|_| "json".to_string()) == "json" {
            Some(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
        } else {
            None
        };

    // Pretty format for development
    let pretty_layer = if std::env::var("TILLER_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        == "pretty"
    {
        Some(
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    // Configure log level from environment
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    info!("Tracing initialized");
    Ok(())
}

/// Dispatch metrics collector
pub struct DispatchMetrics {
    /// Dispatch attempts by pool
    attempts: IntCounterVec,
    /// Retries spent by pool
    retries: IntCounterVec,
    /// Requests rejected because the pool had no live endpoints
    empty_pool_rejections: IntCounterVec,
}

impl DispatchMetrics {
    /// Create a new metrics collector and register with Prometheus
    pub fn new() -> Result<Self> {
        let attempts = register_int_counter_vec!(
            "tiller_dispatch_attempts_total",
            "Total dispatch attempts against backend pools",
            &["pool"]
        )?;

        let retries = register_int_counter_vec!(
            "tiller_dispatch_retries_total",
            "Dispatch attempts that were retries of an earlier failed attempt",
            &["pool"]
        )?;

        let empty_pool_rejections = register_int_counter_vec!(
            "tiller_empty_pool_rejections_total",
            "Requests rejected with 503 because the backend pool was empty",
            &["pool"]
        )?;

        Ok(Self {
            attempts,
            retries,
            empty_pool_rejections,
        })
    }

    /// Record one dispatch attempt against a pool
    pub fn record_attempt(&self, pool: &str) {
        self.attempts.with_label_values(&[pool]).inc();
    }

    /// Record one retry against a pool
    pub fn record_retry(&self, pool: &str) {
        self.retries.with_label_values(&[pool]).inc();
    }

    /// Record a budget-free empty-pool rejection
    pub fn record_empty_pool_rejection(&self, pool: &str) {
        self.empty_pool_rejections.with_label_values(&[pool]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // Registration happens against the process-global registry, so this
        // can only run once per process; counters must survive repeated use.
        if let Ok(metrics) = DispatchMetrics::new() {
            metrics.record_attempt("web");
            metrics.record_attempt("web");
            metrics.record_retry("web");
            metrics.record_empty_pool_rejection("api");
        }
    }
}
