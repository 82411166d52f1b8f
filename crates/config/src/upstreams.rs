//! Upstream dispatch configuration types
//!
//! This module contains configuration types for backend pools: retry
//! budgets and session stickiness. Parsing of the surrounding
//! configuration file format is the embedding application's concern.

use serde::{Deserialize, Serialize};
use validator::Validate;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry budget for one logical request against a pool
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    /// Maximum number of attempts for one logical request. 1 disables retries.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 16))]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

// ============================================================================
// Stickiness Configuration
// ============================================================================

/// Configuration for session stickiness on a pool
///
/// Pin sources are consulted in fixed precedence: rules, then client IP,
/// then the session cookie. When neither rules nor `use_ip` are
/// configured, cookie stickiness is the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct StickinessConfig {
    /// Cookie name for session affinity. Empty means a deterministic name
    /// is derived from the pool identifier.
    #[serde(default)]
    pub cookie_name: String,

    /// Secret used to seal the session cookie value. When unset the cookie
    /// carries the endpoint address in the clear.
    #[serde(default)]
    #[validate(length(min = 1))]
    pub cookie_encrypt_key: Option<String>,

    /// Request templates evaluated in order; the first non-empty rendering
    /// becomes the pinning token.
    #[serde(default)]
    pub rules: Vec<String>,

    /// Pin by session cookie
    #[serde(default)]
    pub use_cookie: bool,

    /// Pin by client IP
    #[serde(default)]
    pub use_ip: bool,
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Configuration for one named backend pool
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolConfig {
    /// Backend endpoints in `host:port` form
    #[validate(length(min = 1))]
    pub targets: Vec<String>,

    /// Retry budget for requests against this pool
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Session stickiness, when enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub stickiness: Option<StickinessConfig>,
}
