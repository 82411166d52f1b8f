//! Sticky routing: pin resolution and session cookie handling
//!
//! A [`StickinessPolicy`] is built once per pool. The configuration's mode
//! flags are resolved at construction into an ordered chain of pin
//! sources — rules, then client IP, then the session cookie — so request
//! handling walks a fixed chain instead of re-deriving precedence from
//! flags. Exactly one source contributes the routing decision for a given
//! request.
//!
//! On the response path, the policy's session cookie is stripped when the
//! routing key is re-derivable from the request itself (rule and IP
//! pinning), sealed when an encryption key is configured, and passed
//! through untouched otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::{debug, trace, warn};

use tiller_common::errors::TillerResult;
use tiller_config::StickinessConfig;

use crate::cookie::{sticky_cookie_name, CookieSealer};
use crate::handler::{CloseSignal, Handler, ResponseSink};
use crate::pool::BackendPool;
use crate::request::ForwardRequest;
use crate::ring::HashRing;
use crate::rules::RuleTemplate;

/// How a request's routing was pinned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pinning {
    None,
    Rule,
    Ip,
    Cookie,
}

/// Outcome of sticky resolution for one request
#[derive(Debug, Clone)]
pub struct StickyDecision {
    /// Endpoint the request is pinned to, when resolution succeeded
    pub endpoint: Option<String>,
    pub source: Pinning,
}

impl StickyDecision {
    fn unpinned() -> Self {
        Self {
            endpoint: None,
            source: Pinning::None,
        }
    }
}

/// Pin sources in precedence order, fixed at construction
enum PinSource {
    Rules(Vec<RuleTemplate>),
    ClientIp,
    Cookie,
}

/// Immutable stickiness policy for one pool
pub struct StickinessPolicy {
    cookie_name: String,
    sealer: Option<CookieSealer>,
    sources: Vec<PinSource>,
}

impl StickinessPolicy {
    /// Build the policy from configuration. Rule compilation and key
    /// derivation failures surface here, never per request.
    pub fn from_config(config: &StickinessConfig, pool_id: &str) -> TillerResult<Self> {
        let cookie_name = sticky_cookie_name(&config.cookie_name, pool_id);
        let sealer = config
            .cookie_encrypt_key
            .as_deref()
            .map(CookieSealer::new)
            .transpose()?;

        let mut sources = Vec::new();
        if !config.rules.is_empty() {
            let rules = config
                .rules
                .iter()
                .map(|rule| RuleTemplate::compile(rule))
                .collect::<TillerResult<Vec<_>>>()?;
            sources.push(PinSource::Rules(rules));
        }
        if config.use_ip {
            sources.push(PinSource::ClientIp);
        }
        // cookie stickiness is the default when no other mode is configured
        if config.use_cookie || sources.is_empty() {
            sources.push(PinSource::Cookie);
        }

        Ok(Self {
            cookie_name,
            sealer,
            sources,
        })
    }

    /// Session cookie name this policy reads and rewrites
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub(crate) fn sealer(&self) -> Option<&CookieSealer> {
        self.sealer.as_ref()
    }

    /// Resolve the endpoint this request should be pinned to, walking the
    /// pin sources in precedence order and stopping at the first that
    /// yields a decision.
    pub fn resolve(&self, req: &ForwardRequest, endpoints: &[String]) -> StickyDecision {
        for source in &self.sources {
            match source {
                PinSource::Rules(rules) => {
                    if let Some(token) = first_rule_token(rules, req) {
                        trace!(token = %token, "Sticky token from rule");
                        return StickyDecision {
                            endpoint: ring_lookup(endpoints, &token),
                            source: Pinning::Rule,
                        };
                    }
                }
                PinSource::ClientIp => {
                    if let Some(ip) = req.forwarded_client_ip() {
                        let token = format!("clientIP: {}", ip);
                        trace!(token = %token, "Sticky token from client IP");
                        return StickyDecision {
                            endpoint: ring_lookup(endpoints, &token),
                            source: Pinning::Ip,
                        };
                    }
                }
                PinSource::Cookie => {
                    let Some(raw) = req.cookie(&self.cookie_name) else {
                        continue;
                    };
                    let endpoint = match &self.sealer {
                        Some(sealer) => sealer.open(&raw),
                        None => Some(raw),
                    };
                    match endpoint {
                        Some(endpoint) => {
                            return StickyDecision {
                                endpoint: Some(endpoint),
                                source: Pinning::Cookie,
                            }
                        }
                        None => {
                            warn!(
                                cookie = %self.cookie_name,
                                "Discarding undecodable sticky cookie"
                            );
                            return StickyDecision::unpinned();
                        }
                    }
                }
            }
        }
        StickyDecision::unpinned()
    }
}

fn first_rule_token(rules: &[RuleTemplate], req: &ForwardRequest) -> Option<String> {
    for rule in rules {
        match rule.render(req) {
            Ok(rendered) => {
                let token = rendered.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
            Err(err) => {
                warn!(rule = %rule.source(), error = %err, "Sticky rule failed to render, skipping");
            }
        }
    }
    None
}

fn ring_lookup(endpoints: &[String], token: &str) -> Option<String> {
    HashRing::new(endpoints.to_vec())
        .lookup(token)
        .map(str::to_string)
}

/// Handler decorating `next` with sticky pinning for one pool
pub struct StickyHandler {
    pool: Arc<dyn BackendPool>,
    next: Arc<dyn Handler>,
    policy: Arc<StickinessPolicy>,
}

impl StickyHandler {
    pub fn new(pool: Arc<dyn BackendPool>, next: Arc<dyn Handler>, policy: StickinessPolicy) -> Self {
        Self {
            pool,
            next,
            policy: Arc::new(policy),
        }
    }
}

#[async_trait]
impl Handler for StickyHandler {
    async fn handle(
        &self,
        sink: &mut dyn ResponseSink,
        req: &mut ForwardRequest,
    ) -> TillerResult<()> {
        let servers = self.pool.servers();
        let decision = self.policy.resolve(req, &servers);

        if let Some(endpoint) = &decision.endpoint {
            debug!(
                endpoint = %endpoint,
                source = ?decision.source,
                cookie = %self.policy.cookie_name(),
                "Sticky pin resolved"
            );
            req.sticky_target = Some(endpoint.clone());

            // downstream forwarding must see the resolved address, not the
            // sealed value the client sent
            if decision.source == Pinning::Cookie
                && req.cookie(self.policy.cookie_name()).as_deref() != Some(endpoint.as_str())
            {
                req.rewrite_cookie(self.policy.cookie_name(), endpoint);
            }
        }

        let mut sink = StickySink {
            inner: sink,
            policy: &self.policy,
            source: decision.source,
        };
        self.next.handle(&mut sink, req).await
    }
}

/// Response decorator applying the policy's cookie side effects at the
/// moment the response head is committed
struct StickySink<'a> {
    inner: &'a mut dyn ResponseSink,
    policy: &'a StickinessPolicy,
    source: Pinning,
}

#[async_trait]
impl ResponseSink for StickySink<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_head(&mut self, status: StatusCode) -> TillerResult<()> {
        finalize_session_cookies(self.inner.headers_mut(), self.policy, self.source);
        self.inner.write_head(status).await
    }

    async fn write_chunk(&mut self, chunk: bytes::Bytes) -> TillerResult<usize> {
        self.inner.write_chunk(chunk).await
    }

    fn supports_flush(&self) -> bool {
        self.inner.supports_flush()
    }

    async fn flush(&mut self) -> TillerResult<()> {
        self.inner.flush().await
    }

    fn close_signal(&self) -> Option<CloseSignal> {
        self.inner.close_signal()
    }
}

/// Rewrite the backend's `Set-Cookie` headers for the policy's cookie:
/// strip under rule/IP pinning, seal when a key is configured, pass
/// through otherwise. Other cookies are untouched.
fn finalize_session_cookies(headers: &mut HeaderMap, policy: &StickinessPolicy, source: Pinning) {
    if !headers.contains_key(SET_COOKIE) {
        return;
    }

    let mut kept: Vec<HeaderValue> = Vec::new();
    for value in headers.get_all(SET_COOKIE) {
        let Ok(text) = value.to_str() else {
            kept.push(value.clone());
            continue;
        };
        let (pair, attrs) = match text.split_once(';') {
            Some((pair, attrs)) => (pair, Some(attrs)),
            None => (text, None),
        };
        let Some((name, cookie_value)) = pair.split_once('=') else {
            kept.push(value.clone());
            continue;
        };
        if name.trim() != policy.cookie_name() {
            kept.push(value.clone());
            continue;
        }

        match source {
            // the routing key is re-derivable from the request itself; the
            // client needs no pinning cookie
            Pinning::Rule | Pinning::Ip => {
                trace!(cookie = %policy.cookie_name(), "Stripping session cookie");
            }
            Pinning::Cookie | Pinning::None => match policy.sealer() {
                Some(sealer) => {
                    let sealed = sealer.seal(cookie_value);
                    let rebuilt = match attrs {
                        Some(attrs) => format!("{}={};{}", name, sealed, attrs),
                        None => format!("{}={}", name, sealed),
                    };
                    match HeaderValue::from_str(&rebuilt) {
                        Ok(header) => kept.push(header),
                        Err(_) => kept.push(value.clone()),
                    }
                }
                None => kept.push(value.clone()),
            },
        }
    }

    headers.remove(SET_COOKIE);
    for value in kept {
        headers.append(SET_COOKIE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::COOKIE;
    use http::{Method, Uri};

    fn test_endpoints() -> Vec<String> {
        vec![
            "10.0.0.1:8080".to_string(),
            "10.0.0.2:8080".to_string(),
            "10.0.0.3:8080".to_string(),
        ]
    }

    fn policy(config: StickinessConfig) -> StickinessPolicy {
        StickinessPolicy::from_config(&config, "web-pool").unwrap()
    }

    fn request() -> ForwardRequest {
        ForwardRequest::new(Method::GET, Uri::from_static("/"))
    }

    #[test]
    fn test_rule_wins_over_ip() {
        let policy = policy(StickinessConfig {
            rules: vec!["{header:x-session-group}".to_string()],
            use_ip: true,
            ..Default::default()
        });

        let mut req = request();
        req.headers
            .insert("x-session-group", HeaderValue::from_static("blue"));
        req.headers
            .insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        let endpoints = test_endpoints();
        let decision = policy.resolve(&req, &endpoints);
        assert_eq!(decision.source, Pinning::Rule);

        // the endpoint matches a pure rule-token lookup, not the IP token
        let by_rule = HashRing::new(endpoints.clone()).lookup("blue").map(str::to_string);
        assert_eq!(decision.endpoint, by_rule);
    }

    #[test]
    fn test_unmatched_rule_falls_through_to_ip() {
        let policy = policy(StickinessConfig {
            rules: vec!["{header:x-missing}".to_string()],
            use_ip: true,
            ..Default::default()
        });

        let mut req = request();
        req.headers
            .insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        let decision = policy.resolve(&req, &test_endpoints());
        assert_eq!(decision.source, Pinning::Ip);
        assert!(decision.endpoint.is_some());
    }

    #[test]
    fn test_ip_token_uses_peer_when_no_xff() {
        let policy = policy(StickinessConfig {
            use_ip: true,
            ..Default::default()
        });

        let mut req = request();
        req.peer_addr = Some("203.0.113.7:9999".parse().unwrap());

        let endpoints = test_endpoints();
        let decision = policy.resolve(&req, &endpoints);
        assert_eq!(decision.source, Pinning::Ip);
        let expected = HashRing::new(endpoints)
            .lookup("clientIP: 203.0.113.7")
            .map(str::to_string);
        assert_eq!(decision.endpoint, expected);
    }

    #[test]
    fn test_cookie_is_default_mode() {
        let policy = policy(StickinessConfig::default());
        let mut req = request();
        req.headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{}=10.0.0.2:8080", policy.cookie_name())).unwrap(),
        );

        let decision = policy.resolve(&req, &test_endpoints());
        assert_eq!(decision.source, Pinning::Cookie);
        assert_eq!(decision.endpoint.as_deref(), Some("10.0.0.2:8080"));
    }

    #[test]
    fn test_sealed_cookie_resolves_and_rejects_garbage() {
        let policy = policy(StickinessConfig {
            use_cookie: true,
            cookie_encrypt_key: Some("s3cret".to_string()),
            ..Default::default()
        });

        let sealed = policy.sealer().unwrap().seal("10.0.0.3:8080");
        let mut req = request();
        req.headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{}={}", policy.cookie_name(), sealed)).unwrap(),
        );
        let decision = policy.resolve(&req, &test_endpoints());
        assert_eq!(decision.source, Pinning::Cookie);
        assert_eq!(decision.endpoint.as_deref(), Some("10.0.0.3:8080"));

        // a cookie sealed under some other key degrades to unpinned
        let mut req = request();
        req.headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{}=bm90LXNlYWxlZA", policy.cookie_name())).unwrap(),
        );
        let decision = policy.resolve(&req, &test_endpoints());
        assert_eq!(decision.source, Pinning::None);
        assert!(decision.endpoint.is_none());
    }

    #[test]
    fn test_no_signals_means_unpinned() {
        let policy = policy(StickinessConfig {
            use_ip: true,
            ..Default::default()
        });
        let decision = policy.resolve(&request(), &test_endpoints());
        assert_eq!(decision.source, Pinning::None);
        assert!(decision.endpoint.is_none());
    }

    fn set_cookie_headers(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_finalize_strips_cookie_for_rule_pinning() {
        let policy = policy(StickinessConfig {
            rules: vec!["{path}".to_string()],
            ..Default::default()
        });

        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_str(&format!("{}=10.0.0.1:8080; Path=/", policy.cookie_name()))
                .unwrap(),
        );
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1"));

        finalize_session_cookies(&mut headers, &policy, Pinning::Rule);
        assert_eq!(set_cookie_headers(&headers), vec!["other=1"]);
    }

    #[test]
    fn test_finalize_seals_cookie_value() {
        let policy = policy(StickinessConfig {
            use_cookie: true,
            cookie_encrypt_key: Some("s3cret".to_string()),
            ..Default::default()
        });

        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_str(&format!(
                "{}=10.0.0.1:8080; Path=/; HttpOnly",
                policy.cookie_name()
            ))
            .unwrap(),
        );

        finalize_session_cookies(&mut headers, &policy, Pinning::None);
        let rewritten = set_cookie_headers(&headers);
        assert_eq!(rewritten.len(), 1);
        assert!(!rewritten[0].contains("10.0.0.1:8080"));
        assert!(rewritten[0].ends_with("; Path=/; HttpOnly"));

        let sealed = rewritten[0]
            .strip_prefix(&format!("{}=", policy.cookie_name()))
            .unwrap()
            .split(';')
            .next()
            .unwrap();
        assert_eq!(
            policy.sealer().unwrap().open(sealed).as_deref(),
            Some("10.0.0.1:8080")
        );
    }

    #[test]
    fn test_finalize_passes_plain_cookie_through() {
        let policy = policy(StickinessConfig::default());
        let raw = format!("{}=10.0.0.1:8080; Path=/", policy.cookie_name());

        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_str(&raw).unwrap());

        finalize_session_cookies(&mut headers, &policy, Pinning::Cookie);
        assert_eq!(set_cookie_headers(&headers), vec![raw]);
    }
}
