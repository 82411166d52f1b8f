//! Admission gate for empty backend pools
//!
//! Short-circuits dispatch with a fixed 503 when the pool has no live
//! endpoints, before any network attempt is made and before any retry
//! budget is spent.

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use tracing::warn;

use tiller_common::errors::TillerResult;

use crate::handler::{write_status_text, Handler, ResponseSink};
use crate::pool::BackendPool;
use crate::request::ForwardRequest;

/// Handler gating pool access on endpoint availability
pub struct EmptyPoolGate {
    pool: Arc<dyn BackendPool>,
}

impl EmptyPoolGate {
    pub fn new(pool: Arc<dyn BackendPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Handler for EmptyPoolGate {
    async fn handle(
        &self,
        sink: &mut dyn ResponseSink,
        req: &mut ForwardRequest,
    ) -> TillerResult<()> {
        if self.pool.servers().is_empty() {
            warn!(path = %req.uri.path(), "Backend pool has no live endpoints, rejecting");
            return write_status_text(sink, StatusCode::SERVICE_UNAVAILABLE).await;
        }
        self.pool.forward(sink, req).await
    }
}
