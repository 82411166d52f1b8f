//! Retry controller and its response interceptor
//!
//! Runs up to `max_attempts` dispatches of one logical request, buffering
//! each attempt's response head and discarding its body until the attempt
//! either commits or fails. An attempt commits the moment request data
//! reaches a backend (the [`AttemptTrace`] triggers), because replaying a
//! request the backend may have acted on risks duplicate side effects. A
//! 503 observed while an attempt is still retryable means no network peer
//! was involved at all — the empty-pool gate fired — and retrying cannot
//! help, so the loop stops there without spending further budget.
//!
//! [`AttemptTrace`]: crate::request::AttemptTrace

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use tiller_common::errors::TillerResult;
use tiller_common::DispatchMetrics;

use crate::handler::{CloseSignal, Handler, ResponseSink};
use crate::request::{AttemptTrace, ForwardRequest};

/// Observer invoked once per retry, for external bookkeeping. It cannot
/// veto the retry.
pub trait RetryListener: Send + Sync {
    /// `attempt` is the attempt about to run; the first retry reports 2.
    fn retried(&self, req: &ForwardRequest, attempt: u32);
}

/// Listener that ignores retries
pub struct NoopRetryListener;

impl RetryListener for NoopRetryListener {
    fn retried(&self, _req: &ForwardRequest, _attempt: u32) {}
}

/// Listener feeding the dispatch retry counter
pub struct MetricsRetryListener {
    metrics: Arc<DispatchMetrics>,
    pool: String,
}

impl MetricsRetryListener {
    pub fn new(metrics: Arc<DispatchMetrics>, pool: impl Into<String>) -> Self {
        Self {
            metrics,
            pool: pool.into(),
        }
    }
}

impl RetryListener for MetricsRetryListener {
    fn retried(&self, _req: &ForwardRequest, _attempt: u32) {
        self.metrics.record_retry(&self.pool);
    }
}

/// Handler decorating `next` with the retry protocol
pub struct Retry {
    max_attempts: u32,
    next: Arc<dyn Handler>,
    listener: Arc<dyn RetryListener>,
}

impl Retry {
    pub fn new(max_attempts: u32, next: Arc<dyn Handler>, listener: Arc<dyn RetryListener>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            next,
            listener,
        }
    }
}

#[async_trait]
impl Handler for Retry {
    async fn handle(
        &self,
        sink: &mut dyn ResponseSink,
        req: &mut ForwardRequest,
    ) -> TillerResult<()> {
        let mut attempt = 1u32;
        loop {
            // fresh per-attempt state: an unlatched trace on a pristine
            // clone of the request, and a fresh interceptor
            let mut attempt_req = req.clone_for_attempt();
            let trace = attempt_req.trace().clone();
            let retryable = attempt < self.max_attempts;
            let mut capture = RetryCapture::new(&mut *sink, trace, retryable);

            match self.next.handle(&mut capture, &mut attempt_req).await {
                Ok(()) => {
                    if !capture.should_retry() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    if !capture.should_retry() {
                        return Err(err);
                    }
                    warn!(
                        attempt = attempt,
                        error = %err,
                        "Attempt failed before reaching a backend"
                    );
                }
            }

            attempt += 1;
            debug!(attempt = attempt, "Retrying request against another backend");
            self.listener.retried(req, attempt);
        }
    }
}

/// Response interceptor for one attempt
///
/// While the attempt is still retryable, the head is buffered privately
/// and body bytes are reported as written but discarded, so a failed
/// attempt never leaks output to the client. Committing merges the
/// buffered headers into the real sink before the first real write; from
/// then on everything passes through, including mid-stream flushes.
struct RetryCapture<'a> {
    inner: &'a mut dyn ResponseSink,
    trace: AttemptTrace,
    retryable: bool,
    committed: bool,
    status: Option<StatusCode>,
    headers: HeaderMap,
}

impl<'a> RetryCapture<'a> {
    fn new(inner: &'a mut dyn ResponseSink, trace: AttemptTrace, retryable: bool) -> Self {
        Self {
            inner,
            trace,
            retryable,
            committed: false,
            status: None,
            headers: HeaderMap::new(),
        }
    }

    /// Whether this attempt's output may still be discarded and re-tried
    fn should_retry(&self) -> bool {
        self.retryable && !self.committed && !self.trace.is_committed()
    }

    async fn commit(&mut self, status: StatusCode) -> TillerResult<()> {
        let buffered = std::mem::take(&mut self.headers);
        let target = self.inner.headers_mut();
        for (name, value) in buffered.iter() {
            target.append(name, value.clone());
        }
        self.committed = true;
        self.inner.write_head(status).await
    }
}

#[async_trait]
impl ResponseSink for RetryCapture<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        if self.committed {
            self.inner.headers_mut()
        } else {
            &mut self.headers
        }
    }

    async fn write_head(&mut self, status: StatusCode) -> TillerResult<()> {
        if self.committed {
            return self.inner.write_head(status).await;
        }
        if self.should_retry() {
            if status == StatusCode::SERVICE_UNAVAILABLE {
                // no network peer was involved; more attempts cannot help
                self.retryable = false;
                return self.commit(status).await;
            }
            self.status = Some(status);
            return Ok(());
        }
        self.commit(status).await
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> TillerResult<usize> {
        if self.should_retry() {
            return Ok(chunk.len());
        }
        if !self.committed {
            let status = self.status.take().unwrap_or(StatusCode::OK);
            self.commit(status).await?;
        }
        self.inner.write_chunk(chunk).await
    }

    fn supports_flush(&self) -> bool {
        self.inner.supports_flush()
    }

    async fn flush(&mut self) -> TillerResult<()> {
        if self.committed {
            self.inner.flush().await
        } else {
            Ok(())
        }
    }

    fn close_signal(&self) -> Option<CloseSignal> {
        self.inner.close_signal()
    }
}
