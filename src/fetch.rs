use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use url::Url;

use crate::wire::{http_time, ProxyResponse};
use crate::{ProxyError, Result};

/// Host sentinel routing a request to the object store instead of a
/// remote HTTP origin.
pub const OBJECT_STORE_HOST: &str = "awss3";

/// Origin responses are told to live for a month downstream.
pub const ORIGIN_MAX_AGE: u64 = 2_592_000;

/// Default cap on origin image size (8 MiB).
pub const DEFAULT_MAX_ORIGIN_BYTES: usize = 8 * 1024 * 1024;

/// An object fetched from the store, with the metadata that becomes
/// cache headers.
#[derive(Debug, Clone)]
pub struct StoreObject {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such key")]
    NotFound,
    #[error("object store error: {0}")]
    Other(String),
}

/// Minimal byte-range KV view of the object store. The real client is
/// an external collaborator; anything that can produce
/// `(content, etag, last-modified)` per key plugs in here.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> std::result::Result<StoreObject, StoreError>;
}

/// Object store backed by an HTTP gateway exposing
/// `GET {endpoint}/{bucket}/{key}`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        HttpObjectStore {
            client,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> std::result::Result<StoreObject, StoreError> {
        let url = format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            key
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(StoreError::Other(format!("status {}", resp.status())));
        }

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());
        let body = resp
            .bytes()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?
            .to_vec();

        Ok(StoreObject {
            body,
            etag,
            last_modified,
        })
    }
}

/// In-memory object store for tests and embedding.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: HashMap<String, StoreObject>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, body: Vec<u8>) {
        self.objects.insert(
            key.into(),
            StoreObject {
                body,
                etag: Some("\"stored\"".to_string()),
                last_modified: Some(SystemTime::now()),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> std::result::Result<StoreObject, StoreError> {
        self.objects.get(key).cloned().ok_or(StoreError::NotFound)
    }
}

/// Origin-cache entry: a length-prefixed block of cache-relevant
/// headers followed by the raw image bytes.
///
/// Wire form: `BE16(len(headers)) || headers || image`, headers being
/// `Key: value\n` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageWithMeta {
    pub headers: Vec<u8>,
    pub image: Vec<u8>,
}

impl ImageWithMeta {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.headers.len() + self.image.len());
        out.extend_from_slice(&(self.headers.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.headers);
        out.extend_from_slice(&self.image);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<ImageWithMeta> {
        if data.len() < 2 {
            return Err(ProxyError::CorruptCacheEntry);
        }
        let head_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
        if data.len() < 2 + head_len {
            return Err(ProxyError::CorruptCacheEntry);
        }
        Ok(ImageWithMeta {
            headers: data[2..2 + head_len].to_vec(),
            image: data[2 + head_len..].to_vec(),
        })
    }

    /// Apply the stored header lines to a response.
    pub fn apply_headers(&self, resp: &mut ProxyResponse) {
        for line in String::from_utf8_lossy(&self.headers).lines() {
            if let Some((name, value)) = line.split_once(':') {
                resp.set_header(name.trim(), value.trim());
            }
        }
    }
}

/// Header block for a store object: a synthetic month-long
/// Cache-Control plus whatever validators the store reported.
pub fn store_meta_headers(obj: &StoreObject) -> Vec<u8> {
    let mut buf = String::new();
    let _ = writeln!(buf, "Cache-Control: max-age={ORIGIN_MAX_AGE}");
    if let Some(etag) = &obj.etag {
        let _ = writeln!(buf, "ETag: {etag}");
    }
    if let Some(lm) = obj.last_modified {
        let _ = writeln!(buf, "Last-Modified: {}", http_time(lm));
    }
    buf.into_bytes()
}

/// Header block for an HTTP origin response, projected down to the
/// validator whitelist plus the synthetic Cache-Control.
pub fn response_meta_headers(resp: &ProxyResponse) -> Vec<u8> {
    let mut buf = String::new();
    for key in ["Last-Modified", "ETag"] {
        let value = resp.header(key);
        if !value.is_empty() {
            let _ = writeln!(buf, "{key}: {value}");
        }
    }
    let _ = writeln!(buf, "Cache-Control: max-age={ORIGIN_MAX_AGE}");
    buf.into_bytes()
}

/// Fetch origin bytes over HTTP, forwarding the given request headers
/// and enforcing the size cap while streaming.
pub async fn fetch_http_origin(
    client: &reqwest::Client,
    url: &Url,
    req_headers: &axum::http::HeaderMap,
    max_bytes: usize,
) -> Result<ProxyResponse> {
    let resp = client
        .get(url.as_str())
        .headers(req_headers.clone())
        .send()
        .await
        .map_err(|e| ProxyError::Network(e.to_string()))?;

    let status = resp.status();
    let mut headers = axum::http::HeaderMap::new();
    for (name, value) in resp.headers() {
        headers.append(name.clone(), value.clone());
    }

    if let Some(len) = resp.content_length() {
        if len as usize > max_bytes {
            return Err(ProxyError::Network("origin body exceeds size limit".to_string()));
        }
    }

    let mut buf = BytesMut::with_capacity(8192);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream
        .next()
        .await
        .transpose()
        .map_err(|e| ProxyError::Network(e.to_string()))?
    {
        if buf.len() + chunk.len() > max_bytes {
            return Err(ProxyError::Network("origin body exceeds size limit".to_string()));
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(ProxyResponse {
        status,
        headers,
        body: buf.freeze(),
    })
}
