//! Error types for the Tiller dispatch layer
//!
//! This module defines the common error types used across the Tiller crates,
//! with a focus on clear failure modes and operational visibility.

use thiserror::Error;

/// Main error type for Tiller operations
#[derive(Error, Debug)]
pub enum TillerError {
    /// Configuration errors, detected once at construction time
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Upstream dispatch errors
    #[error("Upstream error: {endpoint} - {message}")]
    Upstream {
        endpoint: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Failures writing to the client-facing response sink
    #[error("Sink error: {message}")]
    Sink {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TillerError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an upstream error without a source
    pub fn upstream(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a sink error without a source
    pub fn sink(message: impl Into<String>) -> Self {
        Self::Sink {
            message: message.into(),
            source: None,
        }
    }
}

/// Result type alias for Tiller operations
pub type TillerResult<T> = Result<T, TillerError>;
