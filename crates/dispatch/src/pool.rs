//! Backend pool surface and the reference round-robin pool
//!
//! The dispatch core only ever observes a pool through [`BackendPool`]:
//! a fresh endpoint snapshot per decision, and a forwarder that writes
//! the backend's response into the sink. Health-driven endpoint churn
//! happens behind this surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use tracing::{trace, warn};

use tiller_common::errors::TillerResult;

use crate::handler::{write_status_text, ResponseSink};
use crate::request::ForwardRequest;

/// Narrow read/forward interface over a load-balanced backend pool
#[async_trait]
pub trait BackendPool: Send + Sync {
    /// Snapshot of the live endpoints, in the balancer's reporting order
    fn servers(&self) -> Vec<String>;

    /// Forward the request to a chosen endpoint and write the response
    /// into `sink`. Implementations must latch `req.trace()` the moment
    /// request data reaches the backend connection; the retry protocol's
    /// duplicate-side-effect safety depends on it.
    async fn forward(
        &self,
        sink: &mut dyn ResponseSink,
        req: &mut ForwardRequest,
    ) -> TillerResult<()>;
}

/// A backend's materialized response, as produced by a [`Transport`]
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Connection-level transport to one endpoint
///
/// Implementations must latch `req.trace()` once request data has been
/// written toward the endpoint, even when the exchange subsequently
/// fails.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &str, req: &ForwardRequest) -> TillerResult<UpstreamResponse>;
}

/// Round-robin pool honoring the sticky pin slot
///
/// Selection prefers the request's sticky target when it is a current
/// member; otherwise an atomic cursor walks the endpoint list. A
/// transport failure becomes a written 502 so the retry protocol sees an
/// uncommitted failed attempt.
pub struct RoundRobinPool {
    endpoints: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    transport: Arc<dyn Transport>,
}

impl RoundRobinPool {
    pub fn new(endpoints: Vec<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
            cursor: AtomicUsize::new(0),
            transport,
        }
    }

    /// Replace the endpoint snapshot; called by health-check plumbing
    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        *self.endpoints.write() = endpoints;
    }

    fn select(&self, endpoints: &[String], sticky_target: Option<&str>) -> String {
        if let Some(pinned) = sticky_target {
            if endpoints.iter().any(|e| e == pinned) {
                return pinned.to_string();
            }
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        endpoints[index].clone()
    }
}

#[async_trait]
impl BackendPool for RoundRobinPool {
    fn servers(&self) -> Vec<String> {
        self.endpoints.read().clone()
    }

    async fn forward(
        &self,
        sink: &mut dyn ResponseSink,
        req: &mut ForwardRequest,
    ) -> TillerResult<()> {
        let endpoints = self.endpoints.read().clone();
        if endpoints.is_empty() {
            // raced against a health update; same outcome as the gate
            return write_status_text(sink, StatusCode::SERVICE_UNAVAILABLE).await;
        }

        let endpoint = self.select(&endpoints, req.sticky_target.as_deref());
        trace!(
            endpoint = %endpoint,
            sticky = req.sticky_target.is_some(),
            "Selected backend endpoint"
        );

        match self.transport.send(&endpoint, req).await {
            Ok(response) => {
                let headers = sink.headers_mut();
                for (name, value) in response.headers.iter() {
                    headers.append(name, value.clone());
                }
                sink.write_head(response.status).await?;
                if !response.body.is_empty() {
                    sink.write_chunk(response.body).await?;
                }
                Ok(())
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "Backend dispatch failed");
                write_status_text(sink, StatusCode::BAD_GATEWAY).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BufferedResponse;
    use http::{Method, Uri};
    use std::sync::Mutex;

    /// Transport recording which endpoints were dialed
    struct RecordingTransport {
        dialed: Mutex<Vec<String>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dialed: Mutex::new(Vec::new()),
            })
        }

        fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            endpoint: &str,
            req: &ForwardRequest,
        ) -> TillerResult<UpstreamResponse> {
            self.dialed.lock().unwrap().push(endpoint.to_string());
            req.trace().wrote_request();
            let mut response = UpstreamResponse::new(StatusCode::OK);
            response.body = Bytes::from(endpoint.to_string());
            Ok(response)
        }
    }

    fn endpoints() -> Vec<String> {
        vec![
            "10.0.0.1:8080".to_string(),
            "10.0.0.2:8080".to_string(),
            "10.0.0.3:8080".to_string(),
        ]
    }

    fn request() -> ForwardRequest {
        ForwardRequest::new(Method::GET, Uri::from_static("/"))
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let transport = RecordingTransport::new();
        let pool = RoundRobinPool::new(endpoints(), transport.clone());

        for _ in 0..6 {
            let mut sink = BufferedResponse::new();
            pool.forward(&mut sink, &mut request()).await.unwrap();
        }

        let dialed = transport.dialed();
        assert_eq!(dialed.len(), 6);
        assert_eq!(dialed[0], dialed[3]);
        assert_eq!(dialed[1], dialed[4]);
        assert_ne!(dialed[0], dialed[1]);
    }

    #[tokio::test]
    async fn test_sticky_target_preferred_when_member() {
        let transport = RecordingTransport::new();
        let pool = RoundRobinPool::new(endpoints(), transport.clone());

        let mut req = request();
        req.sticky_target = Some("10.0.0.3:8080".to_string());
        for _ in 0..3 {
            let mut sink = BufferedResponse::new();
            pool.forward(&mut sink, &mut req).await.unwrap();
        }

        assert_eq!(transport.dialed(), vec!["10.0.0.3:8080"; 3]);
    }

    #[tokio::test]
    async fn test_departed_sticky_target_ignored() {
        let transport = RecordingTransport::new();
        let pool = RoundRobinPool::new(endpoints(), transport.clone());

        let mut req = request();
        req.sticky_target = Some("10.0.0.9:8080".to_string());
        let mut sink = BufferedResponse::new();
        pool.forward(&mut sink, &mut req).await.unwrap();

        assert_ne!(transport.dialed()[0], "10.0.0.9:8080");
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_502() {
        struct FailingTransport;

        #[async_trait]
        impl Transport for FailingTransport {
            async fn send(
                &self,
                endpoint: &str,
                _req: &ForwardRequest,
            ) -> TillerResult<UpstreamResponse> {
                Err(tiller_common::TillerError::upstream(endpoint, "connection refused"))
            }
        }

        let pool = RoundRobinPool::new(endpoints(), Arc::new(FailingTransport));
        let mut sink = BufferedResponse::new();
        pool.forward(&mut sink, &mut request()).await.unwrap();

        assert_eq!(sink.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(sink.body(), b"Bad Gateway");
    }

    #[tokio::test]
    async fn test_response_headers_reach_sink() {
        struct HeaderTransport;

        #[async_trait]
        impl Transport for HeaderTransport {
            async fn send(
                &self,
                _endpoint: &str,
                req: &ForwardRequest,
            ) -> TillerResult<UpstreamResponse> {
                req.trace().wrote_request();
                let mut response = UpstreamResponse::new(StatusCode::CREATED);
                response.headers.insert(
                    "x-backend-id",
                    http::HeaderValue::from_static("b7"),
                );
                response.body = Bytes::from_static(b"created");
                Ok(response)
            }
        }

        let pool = RoundRobinPool::new(endpoints(), Arc::new(HeaderTransport));
        let mut sink = BufferedResponse::new();
        let mut req = request();
        pool.forward(&mut sink, &mut req).await.unwrap();

        assert_eq!(sink.status(), Some(StatusCode::CREATED));
        assert_eq!(sink.headers().get("x-backend-id").unwrap(), "b7");
        assert_eq!(sink.body(), b"created");
        assert!(req.trace().is_committed());
    }
}
