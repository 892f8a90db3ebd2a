//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop and edge headers, resolves
//! the API key to use, and forwards to the upstream URL.
//!
//! Requests without a key, or carrying a key that is already alive in the
//! pool, are pool-managed: each failed attempt is classified and the engine
//! retries, rotates or quarantines keys until an attempt succeeds, the
//! classifier says abort, or `max_attempts` runs out. Any other caller key is
//! a passthrough key: one attempt, returned as is, and registered into the
//! pool when upstream accepts it.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{ACCEPT_ENCODING, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use classifier::{Directive, Policy};
use key_pool::KeyPool;
use reqwest::Url;
use tracing::{error, info, instrument, warn};

use crate::body::{AttemptBody, ReplayBody};
use crate::config::GatewayConfig;
use crate::metrics::ServiceMetrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream and retry settings, fixed at startup
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub upstream_url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub credential_header: HeaderName,
    pub credential_query_param: String,
    pub strip_headers: Vec<String>,
}

impl ForwardSettings {
    pub fn from_config(gateway: &GatewayConfig) -> common::Result<Self> {
        let credential_header = HeaderName::from_str(&gateway.credential_header)
            .map_err(|e| common::Error::Config(format!("invalid credential_header: {e}")))?;
        Ok(Self {
            upstream_url: gateway.upstream_url.clone(),
            timeout: Duration::from_secs(gateway.timeout_secs),
            max_attempts: gateway.max_attempts,
            retry_backoff: Duration::from_millis(gateway.retry_backoff_ms),
            credential_header,
            credential_query_param: gateway.credential_query_param.clone(),
            strip_headers: gateway.strip_headers.clone(),
        })
    }
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub pool: Arc<KeyPool>,
    pub policy: Arc<Policy>,
    pub settings: Arc<ForwardSettings>,
    pub metrics: ServiceMetrics,
}

/// Upstream client. Redirects are handed back to the caller, never followed.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// A non-2xx/3xx upstream response, buffered in full so it can be classified
/// and then returned verbatim.
#[derive(Debug)]
pub struct UpstreamFailure {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamFailure {
    pub async fn read(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Decoded `error.message`, when the body is structured.
    pub fn message(&self) -> Option<String> {
        classifier::extract_message(self.content_type(), &self.body)
    }
}

impl IntoResponse for UpstreamFailure {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        for (name, value) in &self.headers {
            if !is_hop_by_hop(name.as_str()) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        response
    }
}

/// Decrements the in-flight gauge when the request finishes, however it ends.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Proxy an inbound request to upstream, rotating pool keys on failure.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.metrics.in_flight);
    let started = Instant::now();
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(state: &ProxyState, request: Request<Body>, request_id: &str) -> Response {
    let settings = &state.settings;
    let (parts, body) = request.into_parts();

    let target = match upstream_target(settings, &parts.uri) {
        Ok(target) => target,
        Err(e) => {
            error!(error = %e, "failed to build upstream url");
            return fail(
                state,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("invalid upstream url: {e}"),
                request_id,
            );
        }
    };
    let headers = outbound_headers(&parts.headers, settings);
    let caller_key =
        header_credential(&parts.headers, &settings.credential_header).or(target.query_credential);

    let Some(key) = caller_key else {
        return forward_pooled(state, &parts.method, &target.url, headers, body, request_id).await;
    };
    if is_pool_key(state, &key).await {
        info!(key = %common::fingerprint(&key), "caller key is pool-managed, using rotation");
        return forward_pooled(state, &parts.method, &target.url, headers, body, request_id).await;
    }
    forward_passthrough(
        state,
        &parts.method,
        &target.url,
        headers,
        body,
        &key,
        request_id,
    )
    .await
}

/// Storage errors count as "not a pool key" so the request still goes out.
async fn is_pool_key(state: &ProxyState, key: &str) -> bool {
    match state.pool.validate(key).await {
        Ok(alive) => alive,
        Err(e) => {
            warn!(key = %common::fingerprint(key), error = %e, "key validation failed, using caller key as passthrough");
            false
        }
    }
}

/// One attempt with the caller's own key. Never retried, never classified.
async fn forward_passthrough(
    state: &ProxyState,
    method: &Method,
    url: &str,
    headers: HeaderMap,
    body: Body,
    key: &str,
    request_id: &str,
) -> Response {
    let fingerprint = common::fingerprint(key);
    let Ok(credential) = credential_value(key) else {
        return fail(
            state,
            StatusCode::BAD_REQUEST,
            "caller API key is not a valid header value",
            request_id,
        );
    };

    let mut body = ReplayBody::from_axum(body, 0);
    let attempt_body = match body.next() {
        Ok(attempt_body) => attempt_body,
        Err(e) => return replay_failure(state, e, request_id),
    };

    let response = match send(state, method, url, headers, credential, attempt_body).await {
        Ok(response) => response,
        Err(e) => return transport_failure(state, e, request_id),
    };

    let status = response.status();
    if is_success(status) {
        crate::metrics::record_attempt("success");
        match state.pool.register(key).await {
            Ok(record) => {
                info!(key_id = %record.id, key = %fingerprint, status = status.as_u16(), "passthrough key accepted upstream, added to pool");
            }
            Err(e) => {
                warn!(key = %fingerprint, error = %e, "failed to register passthrough key");
            }
        }
    } else {
        crate::metrics::record_attempt("passthrough_failure");
        info!(key = %fingerprint, status = status.as_u16(), "passthrough request failed upstream");
    }
    stream_response(response, request_id)
}

/// Attempt loop over pool keys.
async fn forward_pooled(
    state: &ProxyState,
    method: &Method,
    url: &str,
    mut headers: HeaderMap,
    body: Body,
    request_id: &str,
) -> Response {
    // Failure bodies are classified by their message, so they must arrive
    // uncompressed.
    headers.remove(ACCEPT_ENCODING);
    let max_attempts = state.settings.max_attempts;
    let mut key = match state.pool.acquire().await {
        Ok(key) => key,
        Err(e) => return pool_failure(state, e, request_id),
    };
    let mut body = ReplayBody::from_axum(body, max_attempts.saturating_sub(1) as usize);
    let mut last_failure = None;

    for attempt in 1..=max_attempts {
        let Ok(credential) = credential_value(&key.value) else {
            error!(key_id = %key.id, key = %key.fingerprint(), "pool key is not a valid header value");
            return fail(
                state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "pool key is not a valid header value",
                request_id,
            );
        };
        let attempt_body = match body.next() {
            Ok(attempt_body) => attempt_body,
            Err(e) => return replay_failure(state, e, request_id),
        };

        let response = match send(state, method, url, headers.clone(), credential, attempt_body)
            .await
        {
            Ok(response) => response,
            Err(e) => return transport_failure(state, e, request_id),
        };

        let status = response.status();
        if is_success(status) {
            crate::metrics::record_attempt("success");
            info!(
                key_id = %key.id,
                key = %key.fingerprint(),
                attempt,
                max_attempts,
                status = status.as_u16(),
                "upstream request succeeded"
            );
            return stream_response(response, request_id);
        }

        let failure = match UpstreamFailure::read(response).await {
            Ok(failure) => failure,
            Err(e) => return transport_failure(state, e, request_id),
        };
        let message = failure.message();
        let rule = state.policy.rule_for(status.as_u16(), message.as_deref());
        let directive = rule.map_or(Directive::Abort, |rule| rule.directive);
        let reason = rule.map_or("unclassified upstream error", |rule| rule.reason);
        crate::metrics::record_attempt(directive.label());
        crate::metrics::record_upstream_error(directive.label());
        let final_attempt = attempt == max_attempts;

        match directive {
            Directive::Abort => {
                info!(
                    key_id = %key.id,
                    key = %key.fingerprint(),
                    attempt,
                    max_attempts,
                    status = status.as_u16(),
                    directive = directive.label(),
                    "{reason}, returning upstream response"
                );
                return failure.into_response();
            }
            Directive::Retry => {
                warn!(
                    key_id = %key.id,
                    key = %key.fingerprint(),
                    attempt,
                    max_attempts,
                    status = status.as_u16(),
                    directive = directive.label(),
                    "{reason}, retrying with the same key"
                );
                if !final_attempt {
                    tokio::time::sleep(state.settings.retry_backoff).await;
                }
            }
            Directive::RotateAndRetry => {
                warn!(
                    key_id = %key.id,
                    key = %key.fingerprint(),
                    attempt,
                    max_attempts,
                    status = status.as_u16(),
                    directive = directive.label(),
                    "{reason}, rotating key"
                );
                if !final_attempt {
                    key = match state.pool.acquire().await {
                        Ok(next) => next,
                        Err(e) => return reacquire_failure(state, e, failure, request_id),
                    };
                }
            }
            Directive::QuarantineAndRetry => {
                warn!(
                    key_id = %key.id,
                    key = %key.fingerprint(),
                    attempt,
                    max_attempts,
                    status = status.as_u16(),
                    directive = directive.label(),
                    "{reason}, quarantining key"
                );
                if let Err(e) = state.pool.quarantine(&key.value).await {
                    error!(key_id = %key.id, error = %e, "failed to quarantine key");
                }
                if !final_attempt {
                    key = match state.pool.acquire().await {
                        Ok(next) => next,
                        Err(e) => return reacquire_failure(state, e, failure, request_id),
                    };
                }
            }
        }
        last_failure = Some(failure);
    }

    match last_failure {
        Some(failure) => {
            warn!(
                max_attempts,
                status = failure.status.as_u16(),
                "attempts exhausted, returning last upstream failure"
            );
            failure.into_response()
        }
        None => fail(
            state,
            StatusCode::INTERNAL_SERVER_ERROR,
            "retry loop ended without a response",
            request_id,
        ),
    }
}

async fn send(
    state: &ProxyState,
    method: &Method,
    url: &str,
    mut headers: HeaderMap,
    credential: HeaderValue,
    body: AttemptBody,
) -> Result<reqwest::Response, reqwest::Error> {
    headers.insert(state.settings.credential_header.clone(), credential);
    let mut request = state
        .client
        .request(method.clone(), url)
        .headers(headers)
        .timeout(state.settings.timeout);
    if let Some(body) = body.into_reqwest() {
        request = request.body(body);
    }
    request.send().await
}

fn is_success(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

fn credential_value(key: &str) -> Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
    let mut value = HeaderValue::from_str(key)?;
    value.set_sensitive(true);
    Ok(value)
}

/// Stream an upstream response back to the caller, minus hop-by-hop headers.
fn stream_response(response: reqwest::Response, request_id: &str) -> Response {
    let mut builder = Response::builder().status(response.status());
    for (name, value) in response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Gateway-generated error; counted in `errors_total`.
fn fail(state: &ProxyState, status: StatusCode, message: &str, request_id: &str) -> Response {
    state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    error_response(status, message, request_id)
}

fn transport_failure(state: &ProxyState, e: reqwest::Error, request_id: &str) -> Response {
    if e.is_timeout() {
        crate::metrics::record_upstream_error("timeout");
        error!(error = %e, timeout = ?state.settings.timeout, "upstream timeout");
        fail(
            state,
            StatusCode::GATEWAY_TIMEOUT,
            &format!("upstream timeout after {:?}", state.settings.timeout),
            request_id,
        )
    } else {
        crate::metrics::record_upstream_error("connection");
        error!(error = %e, "upstream request failed");
        fail(
            state,
            StatusCode::BAD_GATEWAY,
            &format!("upstream error: {e}"),
            request_id,
        )
    }
}

fn pool_failure(state: &ProxyState, e: key_pool::Error, request_id: &str) -> Response {
    match e {
        key_pool::Error::PoolExhausted => {
            error!("no alive keys in pool");
            fail(
                state,
                StatusCode::SERVICE_UNAVAILABLE,
                "no alive API keys in pool",
                request_id,
            )
        }
        other => {
            error!(error = %other, "key acquisition failed");
            fail(
                state,
                StatusCode::SERVICE_UNAVAILABLE,
                "key pool unavailable",
                request_id,
            )
        }
    }
}

/// `acquire()` failed after an upstream failure was already in hand. Only an
/// empty pool is reported by the gateway; storage trouble returns the
/// upstream failure as is.
fn reacquire_failure(
    state: &ProxyState,
    e: key_pool::Error,
    failure: UpstreamFailure,
    request_id: &str,
) -> Response {
    if matches!(e, key_pool::Error::PoolExhausted) {
        return pool_failure(state, e, request_id);
    }
    warn!(
        error = %e,
        status = failure.status.as_u16(),
        "could not acquire next key, returning upstream failure"
    );
    failure.into_response()
}

fn replay_failure(state: &ProxyState, e: crate::body::ReplayError, request_id: &str) -> Response {
    error!(error = %e, "request body replay failed");
    fail(
        state,
        StatusCode::INTERNAL_SERVER_ERROR,
        &e.to_string(),
        request_id,
    )
}

/// Upstream URL plus the key found in the query string, if any.
struct UpstreamTarget {
    url: String,
    query_credential: Option<String>,
}

/// Base URL + inbound path and query. The credential query parameter is
/// removed; every other parameter is kept.
fn upstream_target(settings: &ForwardSettings, uri: &Uri) -> Result<UpstreamTarget, String> {
    let base = settings.upstream_url.trim_end_matches('/');
    let path = uri.path();
    let Some(query) = uri.query() else {
        return Ok(UpstreamTarget {
            url: format!("{base}{path}"),
            query_credential: None,
        });
    };

    let mut url = Url::parse(&format!("{base}{path}?{query}")).map_err(|e| e.to_string())?;
    let param = settings.credential_query_param.as_str();
    let mut found = false;
    let mut credential = None;
    let mut kept = Vec::new();
    for (name, value) in url.query_pairs() {
        if name == param {
            found = true;
            if credential.is_none() && !value.is_empty() {
                credential = Some(value.into_owned());
            }
        } else {
            kept.push((name.into_owned(), value.into_owned()));
        }
    }

    if !found {
        return Ok(UpstreamTarget {
            url: format!("{base}{path}?{query}"),
            query_credential: None,
        });
    }
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(UpstreamTarget {
        url: url.into(),
        query_credential: credential,
    })
}

fn header_credential(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Inbound headers minus hop-by-hop, `host`, the credential header and the
/// configured edge headers.
fn outbound_headers(inbound: &HeaderMap, settings: &ForwardSettings) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let stripped = is_hop_by_hop(name.as_str())
            || *name == HOST
            || *name == settings.credential_header
            || settings
                .strip_headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name.as_str()));
        if !stripped {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
