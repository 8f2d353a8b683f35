use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use url::Url;

use crate::{ProxyError, Result};

/// An internal request travelling down the transport chain. The URL
/// fragment carries the serialized transformation options; everything
/// below the front handler keys off this struct instead of the inbound
/// hyper request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl ProxyRequest {
    pub fn get(url: Url) -> Self {
        ProxyRequest {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            self.headers.insert(n, v);
        }
    }

    /// The request URL without its fragment, i.e. the URL the origin
    /// actually sees.
    pub fn origin_url(&self) -> Url {
        let mut u = self.url.clone();
        u.set_fragment(None);
        u
    }
}

/// A fully buffered HTTP response. The outer cache persists these in
/// HTTP/1.1 wire form; the inner transport synthesizes them for
/// transformed images.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode) -> Self {
        ProxyResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            self.headers.insert(n, v);
        }
    }

    pub fn append_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            self.headers.append(n, v);
        }
    }

    /// Serialize as an HTTP/1.1 wire response: status line, headers,
    /// blank line, body. This is the on-disk format of the outer cache.
    pub fn to_wire(&self) -> Vec<u8> {
        let reason = self.status.canonical_reason().unwrap_or("");
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse the wire form back. Tolerates bare-LF line endings so
    /// entries written by other tooling still load.
    pub fn from_wire(data: &[u8]) -> Result<ProxyResponse> {
        let corrupt = || ProxyError::CorruptCacheEntry;

        let (head, body) = split_head_body(data).ok_or_else(corrupt)?;
        let head = std::str::from_utf8(head).map_err(|_| corrupt())?;
        let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));

        let status_line = lines.next().ok_or_else(corrupt)?;
        let mut parts = status_line.splitn(3, ' ');
        let proto = parts.next().ok_or_else(corrupt)?;
        if !proto.starts_with("HTTP/") {
            return Err(corrupt());
        }
        let status = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or_else(corrupt)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(corrupt)?;
            let name = name.trim().parse::<HeaderName>().map_err(|_| corrupt())?;
            let value = HeaderValue::from_str(value.trim()).map_err(|_| corrupt())?;
            headers.append(name, value);
        }

        Ok(ProxyResponse {
            status,
            headers,
            body: Bytes::copy_from_slice(body),
        })
    }
}

fn split_head_body(data: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(idx) = find(data, b"\r\n\r\n") {
        return Some((&data[..idx], &data[idx + 4..]));
    }
    if let Some(idx) = find(data, b"\n\n") {
        return Some((&data[..idx], &data[idx + 2..]));
    }
    // A headers-only response may end with a single terminator.
    Some((data, &[]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Object seen by both cache layers: anything that can satisfy a
/// `ProxyRequest` with a buffered response.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: &ProxyRequest) -> Result<ProxyResponse>;
}

pub fn http_time(t: SystemTime) -> String {
    httpdate::fmt_http_date(t)
}

pub fn parse_http_time(s: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(s).ok()
}

/// Synthetic 404 for unknown object-store keys, cacheable downstream
/// for one hour.
pub fn not_found_response() -> ProxyResponse {
    let now = SystemTime::now();
    let mut resp = ProxyResponse::new(StatusCode::NOT_FOUND);
    resp.set_header("Date", &http_time(now));
    resp.set_header("Expires", &http_time(now + Duration::from_secs(3600)));
    resp.set_header("Cache-Control", "max-age=3600");
    resp
}

pub fn gateway_timeout_response() -> ProxyResponse {
    ProxyResponse::new(StatusCode::GATEWAY_TIMEOUT)
}
