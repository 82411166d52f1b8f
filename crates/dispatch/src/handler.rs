//! Handler and response-sink traits for the dispatch chain
//!
//! Every dispatch component (retry controller, sticky handler, empty-pool
//! gate) is a [`Handler`] decorating the next one; responses flow back
//! through [`ResponseSink`] decorators in the reverse direction. Optional
//! sink capabilities (mid-stream flush, close notification) are queried at
//! wrap time, and decorators only forward the capabilities their wrapped
//! sink actually reports.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};

use tiller_common::errors::TillerResult;

use crate::request::ForwardRequest;

/// Receiver side of a close notification: flips to `true` when the client
/// connection goes away. Sinks without the capability return `None`.
pub type CloseSignal = tokio::sync::watch::Receiver<bool>;

/// Client-facing response sink
///
/// Headers accumulate in [`headers_mut`](ResponseSink::headers_mut) until
/// [`write_head`](ResponseSink::write_head) commits them together with the
/// status line; body chunks follow.
#[async_trait]
pub trait ResponseSink: Send {
    /// Response headers staged for the next `write_head`
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commit the status line and staged headers
    async fn write_head(&mut self, status: StatusCode) -> TillerResult<()>;

    /// Write one body chunk, returning the number of bytes accepted
    async fn write_chunk(&mut self, chunk: Bytes) -> TillerResult<usize>;

    /// Whether this sink can push buffered bytes to the client mid-stream
    fn supports_flush(&self) -> bool {
        false
    }

    /// Push buffered bytes to the client. No-op for sinks without the
    /// capability.
    async fn flush(&mut self) -> TillerResult<()> {
        Ok(())
    }

    /// Close notification, when the underlying connection supports it
    fn close_signal(&self) -> Option<CloseSignal> {
        None
    }
}

/// A handler in the dispatch chain
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve the request, writing the response into `sink`
    async fn handle(
        &self,
        sink: &mut dyn ResponseSink,
        req: &mut ForwardRequest,
    ) -> TillerResult<()>;
}

/// Write a fixed response whose body is the status text
pub async fn write_status_text(
    sink: &mut dyn ResponseSink,
    status: StatusCode,
) -> TillerResult<()> {
    let body = status.canonical_reason().unwrap_or("Unknown Status");
    let headers = sink.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    sink.write_head(status).await?;
    sink.write_chunk(Bytes::from_static(body.as_bytes())).await?;
    Ok(())
}

/// In-memory response sink
///
/// Collects the committed status, headers, and body. Used by embedding
/// code that needs a materialized response, and throughout the test
/// suite.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    flush_count: usize,
    close_rx: Option<CloseSignal>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a close notification for the sink to report
    pub fn with_close_signal(mut self, rx: CloseSignal) -> Self {
        self.close_rx = Some(rx);
        self
    }

    /// Committed status, if `write_head` was called
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Body bytes committed so far
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of mid-stream flushes that reached this sink
    pub fn flush_count(&self) -> usize {
        self.flush_count
    }
}

#[async_trait]
impl ResponseSink for BufferedResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> TillerResult<()> {
        self.status = Some(status);
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> TillerResult<usize> {
        self.body.extend_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn supports_flush(&self) -> bool {
        true
    }

    async fn flush(&mut self) -> TillerResult<()> {
        self.flush_count += 1;
        Ok(())
    }

    fn close_signal(&self) -> Option<CloseSignal> {
        self.close_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_status_text() {
        let mut sink = BufferedResponse::new();
        write_status_text(&mut sink, StatusCode::SERVICE_UNAVAILABLE)
            .await
            .unwrap();

        assert_eq!(sink.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(sink.body(), b"Service Unavailable");
        assert_eq!(
            sink.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(sink.headers().get(CONTENT_LENGTH).unwrap(), "19");
    }

    #[tokio::test]
    async fn test_buffered_response_collects_chunks() {
        let mut sink = BufferedResponse::new();
        sink.write_head(StatusCode::OK).await.unwrap();
        sink.write_chunk(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write_chunk(Bytes::from_static(b"world")).await.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(sink.body(), b"hello world");
        assert_eq!(sink.flush_count(), 1);
    }
}
