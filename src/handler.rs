use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use url::Url;

use crate::cache::X_FROM_CACHE;
use crate::config::{find_conf_path, ProxyConfig};
use crate::request::{new_request, ImageRequest};
use crate::sign::{Signer, PARAM_TOKEN, PARAM_VERSION_TS};
use crate::transform::content_type;
use crate::wire::{http_time, parse_http_time, ProxyRequest, ProxyResponse, RoundTripper};
use crate::{ProxyError, Result};

const TIMEOUT_BODY: &str = "Gateway timeout waiting for remote resource.";

/// The front of the service: ACL checks, dispatch through the caching
/// client, and response head shaping.
pub struct Proxy {
    client: Arc<dyn RoundTripper>,
    config: ProxyConfig,
    signer: Signer,
}

impl Proxy {
    pub fn new(client: Arc<dyn RoundTripper>, config: ProxyConfig) -> Self {
        let signer = Signer::new(
            config.secrets.simple_key.as_bytes().to_vec(),
            config.secrets.magic_num,
        );
        Proxy {
            client,
            config,
            signer,
        }
    }

    /// Access control for a normalized request. Returns whether the
    /// signature checked out; a bad signature is currently logged, not
    /// rejected.
    fn allowed(&self, req: &ImageRequest, original: &Request<Body>) -> Result<bool> {
        if !req.options.format.is_empty() && content_type(&req.options.format).is_none() {
            return Err(ProxyError::Forbidden(format!(
                "invalid file format {}",
                req.options.format
            )));
        }

        if !self.config.referrers.is_empty() && !valid_referrer(&self.config.referrers, original) {
            return Err(ProxyError::Forbidden(
                "request does not contain an allowed referrer".to_string(),
            ));
        }

        if !self.config.whitelist.is_empty() && !valid_host(&self.config.whitelist, &req.url) {
            return Err(ProxyError::Forbidden(format!(
                "request host not allowed: {}",
                req.url
            )));
        }

        Ok(self.valid_signature(original))
    }

    fn valid_signature(&self, original: &Request<Body>) -> bool {
        let query = original.uri().query().unwrap_or("");
        let mut ts = String::new();
        let mut token = String::new();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            match k.as_ref() {
                PARAM_VERSION_TS => ts = v.into_owned(),
                PARAM_TOKEN => token = v.into_owned(),
                _ => {}
            }
        }
        if token.len() <= 5 {
            return false;
        }
        self.signer
            .verify(original.uri().path(), &ts, &token, true)
    }
}

/// `*.suffix` entries match any subdomain; anything else matches the
/// host exactly.
fn valid_host(hosts: &[String], url: &Url) -> bool {
    let host = url.host_str().unwrap_or("");
    hosts.iter().map(String::as_str).any(|allowed| {
        host == allowed || (allowed.starts_with("*.") && host.ends_with(&allowed[2..]))
    })
}

fn valid_referrer(hosts: &[String], req: &Request<Body>) -> bool {
    let referrer = req
        .headers()
        .get("referer")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match Url::parse(referrer) {
        Ok(url) => valid_host(hosts, &url),
        // Malformed or blank header: deny.
        Err(_) => false,
    }
}

/// Whether the inbound conditional headers already cover the response:
/// a matching entity tag, or a modification date no newer than what the
/// client has seen.
fn check_304(req_headers: &HeaderMap, resp: &ProxyResponse) -> bool {
    let etag = resp.header("etag");
    let if_none_match = req_headers
        .get("if-none-match")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !etag.is_empty() && etag == if_none_match {
        return true;
    }

    let last_modified = parse_http_time(resp.header("last-modified"));
    let if_modified_since = req_headers
        .get("if-modified-since")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_time);
    match (last_modified, if_modified_since) {
        (Some(lm), Some(ims)) => ims >= lm,
        _ => false,
    }
}

fn copy_header(out: &mut Response<Body>, from: &ProxyResponse, name: &str) {
    let value = from.header(name);
    if value.is_empty() {
        return;
    }
    if let (Ok(n), Ok(v)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
        out.headers_mut().insert(n, v);
    }
}

async fn favicon() -> Response<Body> {
    let data = match find_conf_path("conf/favicon.ico") {
        Some(path) => tokio::fs::read(path).await.ok(),
        None => None,
    };
    let Some(data) = data else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let now = SystemTime::now();
    let headers = [
        ("Content-Type", "image/x-icon".to_string()),
        ("Date", http_time(now)),
        (
            "Expires",
            http_time(now + Duration::from_secs(32 * 24 * 3600)),
        ),
    ];
    (headers, data).into_response()
}

async fn health_check() -> &'static str {
    "OK"
}

async fn serve_image(State(proxy): State<Arc<Proxy>>, original: Request<Body>) -> Response<Body> {
    let start = Instant::now();

    let query = original.uri().query().unwrap_or("");
    let query_ts = url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == PARAM_VERSION_TS)
        .map(|(_, v)| v.into_owned());
    let accept = original
        .headers()
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let req = match new_request(
        original.uri().path(),
        query_ts.as_deref(),
        accept,
        proxy.config.default_base_url.as_ref(),
    ) {
        Ok(req) => req,
        Err(err) => {
            tracing::info!(uri = %original.uri(), error = %err, "rejecting request");
            return (StatusCode::NOT_FOUND, "404 page not found").into_response();
        }
    };

    let sign_ok = match proxy.allowed(&req, &original) {
        Ok(sign_ok) => sign_ok,
        Err(err) => {
            tracing::error!(uri = %original.uri(), error = %err, "request not allowed");
            return (StatusCode::FORBIDDEN, err.to_string()).into_response();
        }
    };

    tracing::debug!("--> {req}");
    let inner_req = ProxyRequest::get(req.to_url());
    let round_trip = proxy.client.round_trip(&inner_req);
    let resp = match proxy.config.timeout {
        Some(deadline) => match tokio::time::timeout(deadline, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(url = %req, "deadline exceeded");
                return (StatusCode::GATEWAY_TIMEOUT, TIMEOUT_BODY).into_response();
            }
        },
        None => round_trip.await,
    };
    let resp = match resp {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!(url = %req, error = %err, "round trip failed");
            return (StatusCode::NOT_FOUND, "404 page not found").into_response();
        }
    };

    let from_cache = resp.header(X_FROM_CACHE) == "1";
    let mut out = Response::new(Body::empty());
    for name in [
        "Cache-Control",
        "Last-Modified",
        "Expires",
        "Etag",
        "Link",
        X_FROM_CACHE,
    ] {
        copy_header(&mut out, &resp, name);
    }

    if check_304(original.headers(), &resp) {
        *out.status_mut() = StatusCode::NOT_MODIFIED;
        out.headers_mut()
            .append("Vary", HeaderValue::from_static("Accept"));
        log_request(&original, StatusCode::NOT_MODIFIED, from_cache, sign_ok, start);
        return out;
    }

    copy_header(&mut out, &resp, "Content-Length");
    copy_header(&mut out, &resp, "Content-Type");
    out.headers_mut()
        .append("Vary", HeaderValue::from_static("Accept"));
    out.headers_mut().append(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    *out.status_mut() = resp.status;
    *out.body_mut() = Body::from(resp.body.clone());

    log_request(&original, resp.status, from_cache, sign_ok, start);
    out
}

fn log_request(
    original: &Request<Body>,
    status: StatusCode,
    from_cache: bool,
    sign_ok: bool,
    start: Instant,
) {
    tracing::info!(
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        status = status.as_u16(),
        cache = from_cache,
        url = %original.uri(),
        sign = sign_ok,
        "served"
    );
}

/// Build the axum router: the two fixed endpoints plus the catch-all
/// image handler.
pub fn router(proxy: Proxy) -> Router {
    let state = Arc::new(proxy);
    Router::new()
        .route("/favicon.ico", get(favicon))
        .route("/health-check", get(health_check))
        .fallback(serve_image)
        .with_state(state)
}
