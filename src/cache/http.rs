use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};

use crate::cache::{cache_key, Cache};
use crate::wire::{
    gateway_timeout_response, parse_http_time, ProxyRequest, ProxyResponse, RoundTripper,
};
use crate::Result;

/// Marker header set on responses served from the cache.
pub const X_FROM_CACHE: &str = "X-From-Cache";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Freshness {
    /// The cached response can be served as-is.
    Fresh,
    /// The cached response needs validating against the origin first.
    Stale,
    /// The cached response must not be used for this request.
    Transparent,
}

/// HTTP-semantics cache wrapped around another transport.
///
/// Responses are stored in full wire form keyed by the request URL
/// (fragment included), so any change to the transformation options is a
/// different entry while signature query parameters never reach the key.
pub struct CachingTransport {
    inner: Arc<dyn RoundTripper>,
    cache: Arc<dyn Cache>,
    mark_cached_responses: bool,
}

impl CachingTransport {
    pub fn new(inner: Arc<dyn RoundTripper>, cache: Arc<dyn Cache>) -> Self {
        CachingTransport {
            inner,
            cache,
            mark_cached_responses: true,
        }
    }

    async fn cached_response(&self, key: &str) -> Option<ProxyResponse> {
        let raw = self.cache.get(key).await?;
        match ProxyResponse::from_wire(&raw) {
            Ok(resp) => Some(resp),
            Err(_) => {
                // Undecodable entries are dropped and treated as misses.
                tracing::warn!(key, "corrupt cache entry, deleting");
                self.cache.delete(key).await;
                None
            }
        }
    }

    async fn store(&self, key: &str, req: &ProxyRequest, resp: &mut ProxyResponse) {
        for vary_key in all_comma_sep_values(&resp.headers, "vary") {
            let req_value = req.header(&vary_key);
            if !req_value.is_empty() {
                resp.set_header(&format!("X-Varied-{vary_key}"), req_value);
            }
        }
        self.cache.set(key, &resp.to_wire()).await;
    }
}

#[async_trait]
impl RoundTripper for CachingTransport {
    async fn round_trip(&self, req: &ProxyRequest) -> Result<ProxyResponse> {
        let key = cache_key(&req.url);
        let cacheable = (req.method == Method::GET || req.method == Method::HEAD)
            && req.header("range").is_empty();

        let cached = if cacheable {
            self.cached_response(&key).await
        } else {
            // Writes through this URL invalidate whatever we held.
            self.cache.delete(&key).await;
            None
        };

        let mut resp = match cached {
            Some(mut cached_resp) => {
                if self.mark_cached_responses {
                    cached_resp.set_header(X_FROM_CACHE, "1");
                }

                let mut conditional: Option<ProxyRequest> = None;
                if vary_matches(&cached_resp, req) {
                    match freshness(&cached_resp.headers, &req.headers) {
                        Freshness::Fresh => return Ok(cached_resp),
                        Freshness::Stale => {
                            conditional = conditional_request(req, &cached_resp);
                        }
                        Freshness::Transparent => {}
                    }
                }

                let send = conditional.as_ref().unwrap_or(req);
                match self.inner.round_trip(send).await {
                    Ok(fresh_resp)
                        if req.method == Method::GET
                            && fresh_resp.status == StatusCode::NOT_MODIFIED =>
                    {
                        // Revalidated: refresh end-to-end headers and serve
                        // the cached body as a 200.
                        for name in end_to_end_headers(&fresh_resp.headers) {
                            if let Some(value) = fresh_resp.headers.get(&name) {
                                cached_resp.headers.insert(name, value.clone());
                            }
                        }
                        cached_resp.status = StatusCode::OK;
                        cached_resp
                    }
                    Ok(fresh_resp)
                        if fresh_resp.status.is_server_error()
                            && can_stale_on_error(&cached_resp.headers, &req.headers) =>
                    {
                        cached_resp.status = StatusCode::OK;
                        return Ok(cached_resp);
                    }
                    Ok(fresh_resp) => fresh_resp,
                    Err(err) => {
                        if can_stale_on_error(&cached_resp.headers, &req.headers) {
                            cached_resp.status = StatusCode::OK;
                            return Ok(cached_resp);
                        }
                        self.cache.delete(&key).await;
                        return Err(err);
                    }
                }
            }
            None => {
                let req_cc = parse_cache_control(&req.headers);
                if req_cc.contains_key("only-if-cached") {
                    gateway_timeout_response()
                } else {
                    self.inner.round_trip(req).await?
                }
            }
        };

        if resp.status.is_server_error() {
            self.cache.delete(&key).await;
        } else if cacheable
            && resp.status.is_success()
            && can_store(
                &parse_cache_control(&req.headers),
                &parse_cache_control(&resp.headers),
            )
        {
            self.store(&key, req, &mut resp).await;
        }
        Ok(resp)
    }
}

/// Whether the cached response may satisfy `req` given the headers the
/// response varies on. Stored entries record the original request values
/// as `X-Varied-*` headers.
fn vary_matches(cached: &ProxyResponse, req: &ProxyRequest) -> bool {
    for header in all_comma_sep_values(&cached.headers, "vary") {
        if header.is_empty() {
            continue;
        }
        if req.header(&header) != cached.header(&format!("X-Varied-{header}")) {
            return false;
        }
    }
    true
}

/// Build the conditional revalidation request, using the cached
/// validators unless the client already supplied its own.
fn conditional_request(req: &ProxyRequest, cached: &ProxyResponse) -> Option<ProxyRequest> {
    let mut out: Option<ProxyRequest> = None;

    let etag = cached.header("etag");
    if !etag.is_empty() && req.header("etag").is_empty() {
        let clone = out.get_or_insert_with(|| req.clone());
        clone.set_header("if-none-match", etag);
    }
    let last_modified = cached.header("last-modified");
    if !last_modified.is_empty() && req.header("last-modified").is_empty() {
        let clone = out.get_or_insert_with(|| req.clone());
        clone.set_header("if-modified-since", last_modified);
    }
    out
}

fn response_date(headers: &HeaderMap) -> Option<SystemTime> {
    headers
        .get("date")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_time)
}

fn seconds_since(t: SystemTime) -> i64 {
    match SystemTime::now().duration_since(t) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn parse_seconds(v: &str) -> Option<i64> {
    v.parse().ok()
}

/// Freshness of a cached response for a request, per the cache-control
/// directives on both sides. `no-cache` on the request bypasses the
/// cache entirely; on the response it forces revalidation.
/// `only-if-cached` short-circuits to fresh. Lifetime comes from
/// `max-age` (falling back to `Expires`), overridden by a request
/// `max-age`, and adjusted by `min-fresh` / `max-stale`.
fn freshness(resp_headers: &HeaderMap, req_headers: &HeaderMap) -> Freshness {
    let resp_cc = parse_cache_control(resp_headers);
    let req_cc = parse_cache_control(req_headers);

    if req_cc.contains_key("no-cache") {
        return Freshness::Transparent;
    }
    if resp_cc.contains_key("no-cache") {
        return Freshness::Stale;
    }
    if req_cc.contains_key("only-if-cached") {
        return Freshness::Fresh;
    }

    let Some(date) = response_date(resp_headers) else {
        return Freshness::Stale;
    };
    let mut current_age = seconds_since(date);

    let mut lifetime = 0i64;
    if let Some(max_age) = resp_cc.get("max-age").and_then(|v| parse_seconds(v)) {
        lifetime = max_age;
    } else if let Some(expires) = resp_headers
        .get("expires")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_time)
    {
        lifetime = expires
            .duration_since(date)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
    }

    if let Some(max_age) = req_cc.get("max-age").and_then(|v| parse_seconds(v)) {
        lifetime = max_age;
    }
    if let Some(min_fresh) = req_cc.get("min-fresh").and_then(|v| parse_seconds(v)) {
        current_age += min_fresh;
    }
    if let Some(max_stale) = req_cc.get("max-stale") {
        if max_stale.is_empty() {
            return Freshness::Fresh;
        }
        if let Some(slack) = parse_seconds(max_stale) {
            current_age -= slack;
        }
    }

    if lifetime > current_age {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}

/// stale-if-error (RFC 5861) on either side permits serving the cached
/// response when the origin fails.
fn can_stale_on_error(resp_headers: &HeaderMap, req_headers: &HeaderMap) -> bool {
    let resp_cc = parse_cache_control(resp_headers);
    let req_cc = parse_cache_control(req_headers);

    let mut lifetime: i64 = -1;
    for cc in [&resp_cc, &req_cc] {
        if let Some(v) = cc.get("stale-if-error") {
            if v.is_empty() {
                return true;
            }
            match parse_seconds(v) {
                Some(secs) => lifetime = secs,
                None => return false,
            }
        }
    }

    if lifetime >= 0 {
        if let Some(date) = response_date(resp_headers) {
            return lifetime > seconds_since(date);
        }
    }
    false
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Response header names that are end-to-end: everything except the
/// fixed hop-by-hop set and whatever the `Connection` header names.
fn end_to_end_headers(resp_headers: &HeaderMap) -> Vec<axum::http::HeaderName> {
    let mut hop_by_hop: Vec<String> = HOP_BY_HOP.iter().map(|s| s.to_string()).collect();
    for extra in all_comma_sep_values(resp_headers, "connection") {
        if !extra.is_empty() {
            hop_by_hop.push(extra.to_lowercase());
        }
    }

    resp_headers
        .keys()
        .filter(|name| !hop_by_hop.iter().any(|h| h == name.as_str()))
        .cloned()
        .collect()
}

fn can_store(req_cc: &HashMap<String, String>, resp_cc: &HashMap<String, String>) -> bool {
    !req_cc.contains_key("no-store") && !resp_cc.contains_key("no-store")
}

fn parse_cache_control(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cc = HashMap::new();
    let value = headers
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => {
                cc.insert(k.trim().to_string(), v.trim_matches([',', ' ']).to_string());
            }
            None => {
                cc.insert(part.to_string(), String::new());
            }
        }
    }
    cc
}

/// All comma separated values across every occurrence of a header.
fn all_comma_sep_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    let mut vals = Vec::new();
    for value in headers.get_all(name) {
        if let Ok(s) = value.to_str() {
            vals.extend(s.split(',').map(|f| f.trim().to_string()));
        }
    }
    vals
}
