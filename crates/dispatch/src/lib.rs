//! Tiller Dispatch Library
//!
//! The resilient dispatch core of the Tiller proxy: given a request
//! already matched to a named backend pool, pick an instance, forward,
//! and transparently survive a failing backend — without ever letting a
//! client observe a failed attempt while an alternative exists and no
//! irreversible side effect has occurred.
//!
//! The pieces, composed as handler decorators around a [`BackendPool`]:
//!
//! - **Retry controller** ([`Retry`]): bounded re-dispatch with
//!   buffer-then-commit response interception
//! - **Sticky routing** ([`StickyHandler`], [`StickinessPolicy`]):
//!   rule/IP/cookie pinning with a consistent-hash ring
//! - **Empty-pool gate** ([`EmptyPoolGate`]): budget-free 503 when the
//!   pool has no live endpoints
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tiller_dispatch::{
//!     EmptyPoolGate, NoopRetryListener, Retry, RoundRobinPool, StickinessPolicy, StickyHandler,
//! };
//!
//! let pool = Arc::new(RoundRobinPool::new(endpoints, transport));
//! let gate = Arc::new(EmptyPoolGate::new(pool.clone()));
//! let policy = StickinessPolicy::from_config(&config, "web-pool")?;
//! let sticky = Arc::new(StickyHandler::new(pool, gate, policy));
//! let handler = Retry::new(3, sticky, Arc::new(NoopRetryListener));
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod cookie;
pub mod gate;
pub mod handler;
pub mod pool;
pub mod request;
pub mod retry;
pub mod ring;
pub mod rules;
pub mod sticky;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Handler chain surface
pub use handler::{write_status_text, BufferedResponse, CloseSignal, Handler, ResponseSink};

// Requests
pub use request::{AttemptTrace, ForwardRequest};

// Backend pool surface
pub use pool::{BackendPool, RoundRobinPool, Transport, UpstreamResponse};

// Sticky routing
pub use ring::HashRing;
pub use rules::RuleTemplate;
pub use sticky::{Pinning, StickinessPolicy, StickyDecision, StickyHandler};

// Admission gate
pub use gate::EmptyPoolGate;

// Retry protocol
pub use retry::{MetricsRetryListener, NoopRetryListener, Retry, RetryListener};
