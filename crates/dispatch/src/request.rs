//! Request representation carried through the dispatch chain
//!
//! A [`ForwardRequest`] owns everything a dispatch attempt needs: the
//! request line, headers, a replayable body, the peer address, the sticky
//! pin slot the balancer consults, and the per-attempt commit trace. The
//! body is [`Bytes`], so cloning a request for a fresh attempt replays the
//! identical body without re-reading anything.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::COOKIE;
use http::{HeaderMap, HeaderValue, Method, Uri};

/// Commit triggers for one dispatch attempt
///
/// Latched by the forwarder the moment request data reaches the backend
/// connection. Once latched, the attempt's outcome must be delivered to
/// the client verbatim; silently replaying the request elsewhere would
/// risk duplicate side effects.
#[derive(Debug, Clone, Default)]
pub struct AttemptTrace {
    committed: Arc<AtomicBool>,
}

impl AttemptTrace {
    /// Request headers were written to the backend
    pub fn wrote_headers(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }

    /// The full request was written to the backend
    pub fn wrote_request(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }

    /// Whether either commit trigger has fired
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

/// One request travelling through the dispatch chain
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Direct peer address, when the listener knows it
    pub peer_addr: Option<SocketAddr>,
    /// Endpoint the sticky resolver pinned this request to, consulted by
    /// the balancer ahead of its own selection
    pub sticky_target: Option<String>,
    trace: AttemptTrace,
}

impl ForwardRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: None,
            sticky_target: None,
            trace: AttemptTrace::default(),
        }
    }

    /// Commit trace for the current attempt
    pub fn trace(&self) -> &AttemptTrace {
        &self.trace
    }

    /// Clone this request for a fresh dispatch attempt: same request line,
    /// headers, and body, with an unlatched commit trace.
    pub fn clone_for_attempt(&self) -> Self {
        let mut attempt = self.clone();
        attempt.trace = AttemptTrace::default();
        attempt
    }

    /// Client address as seen through proxies: the first `X-Forwarded-For`
    /// component when present and non-empty, otherwise the peer address
    /// host portion.
    pub fn forwarded_client_ip(&self) -> Option<String> {
        if let Some(value) = self.headers.get("x-forwarded-for") {
            if let Ok(text) = value.to_str() {
                let first = text.split(',').next().unwrap_or("").trim();
                if !first.is_empty() {
                    return Some(first.to_string());
                }
            }
        }
        self.peer_addr.map(|addr| addr.ip().to_string())
    }

    /// Value of the named request cookie
    pub fn cookie(&self, name: &str) -> Option<String> {
        for header in self.headers.get_all(COOKIE) {
            let Ok(text) = header.to_str() else { continue };
            let found = text.split(';').find_map(|pair| {
                let parts: Vec<&str> = pair.trim().splitn(2, '=').collect();
                if parts.len() == 2 && parts[0] == name {
                    Some(parts[1].to_string())
                } else {
                    None
                }
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Replace the named cookie's value in the request's own `Cookie`
    /// header, leaving other cookies untouched. No-op when the cookie is
    /// absent.
    pub fn rewrite_cookie(&mut self, name: &str, new_value: &str) {
        let rewritten: Vec<HeaderValue> = self
            .headers
            .get_all(COOKIE)
            .iter()
            .map(|header| {
                let Ok(text) = header.to_str() else {
                    return header.clone();
                };
                let joined = text
                    .split(';')
                    .map(|pair| {
                        let trimmed = pair.trim();
                        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
                        if parts.len() == 2 && parts[0] == name {
                            format!("{}={}", name, new_value)
                        } else {
                            trimmed.to_string()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                HeaderValue::from_str(&joined).unwrap_or_else(|_| header.clone())
            })
            .collect();

        self.headers.remove(COOKIE);
        for value in rewritten {
            self.headers.append(COOKIE, value);
        }
    }
}
