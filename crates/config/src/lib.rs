//! Configuration module for the Tiller dispatch layer
//!
//! This module provides typed configuration with validation for backend
//! pools, retry budgets, and session stickiness. Full configuration-file
//! handling (formats, includes, hot reload) belongs to the embedding
//! application; this crate only defines the dispatch-relevant shapes and
//! a JSON loading convenience.
//!
//! # Module Organization
//!
//! - [`upstreams`]: Pool, retry, and stickiness configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use validator::Validate;

pub mod upstreams;

pub use upstreams::{PoolConfig, RetryConfig, StickinessConfig};

/// Top-level dispatch configuration: named backend pools
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Pools by name
    pub pools: HashMap<String, PoolConfig>,
}

impl DispatchConfig {
    /// Parse and validate configuration from a JSON string
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("Failed to parse dispatch config")?;
        for (name, pool) in &config.pools {
            pool.validate()
                .with_context(|| format!("Pool '{}' failed validation", name))?;
        }
        Ok(config)
    }

    /// Load and validate configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_round_trip() {
        let raw = r#"{
            "pools": {
                "web": {
                    "targets": ["10.0.0.1:8080", "10.0.0.2:8080"],
                    "retry": {"max_attempts": 3},
                    "stickiness": {"use_cookie": true, "cookie_encrypt_key": "s3cret"}
                }
            }
        }"#;
        let config = DispatchConfig::from_json_str(raw).unwrap();
        let web = &config.pools["web"];
        assert_eq!(web.targets.len(), 2);
        assert_eq!(web.retry.max_attempts, 3);
        assert!(web.stickiness.as_ref().unwrap().use_cookie);
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let raw = r#"{"pools": {"web": {"targets": []}}}"#;
        assert!(DispatchConfig::from_json_str(raw).is_err());
    }
}
