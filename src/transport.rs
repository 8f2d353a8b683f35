use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;

use crate::cache::{data_cache_key, Cache};
use crate::fetch::{
    fetch_http_origin, response_meta_headers, store_meta_headers, ImageWithMeta, ObjectStore,
    StoreError, OBJECT_STORE_HOST,
};
use crate::options::parse_options;
use crate::transform::{content_type, detect_format, transform};
use crate::wire::{http_time, not_found_response, ProxyRequest, ProxyResponse, RoundTripper};
use crate::{ProxyError, Result};

/// Synthetic responses advertise a 30 day shelf life.
const SYNTHETIC_EXPIRES: Duration = Duration::from_secs(30 * 24 * 3600);

/// Transport that turns origin images into transformed responses.
///
/// A request without a fragment is a plain proxy fetch. A request with
/// a fragment names original bytes (the URL, fragment stripped) and a
/// transformation (the fragment); originals are kept in their own
/// `v2:`-prefixed cache so one origin fetch feeds every variant.
pub struct TransformingTransport {
    client: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn Cache>,
    max_origin_bytes: usize,
}

impl TransformingTransport {
    pub fn new(
        client: reqwest::Client,
        store: Arc<dyn ObjectStore>,
        cache: Arc<dyn Cache>,
        max_origin_bytes: usize,
    ) -> Self {
        TransformingTransport {
            client,
            store,
            cache,
            max_origin_bytes,
        }
    }

    async fn cached_origin(&self, key: &str) -> Option<ImageWithMeta> {
        let data = self.cache.get(key).await?;
        match ImageWithMeta::from_bytes(&data) {
            Ok(entry) => Some(entry),
            Err(_) => {
                tracing::warn!(key, "corrupt origin cache entry, deleting");
                self.cache.delete(key).await;
                None
            }
        }
    }

    /// Fetch from the object store, serving the origin cache first.
    async fn object_store_round_trip(&self, req: &ProxyRequest) -> Result<ProxyResponse> {
        let origin_url = req.origin_url();
        let origin_key = data_cache_key(&origin_url);

        let entry = match self.cached_origin(&origin_key).await {
            Some(entry) => {
                tracing::debug!(key = %origin_key, "origin cache hit");
                entry
            }
            None => {
                let store_key = origin_url.path().trim_start_matches('/');
                match self.store.get(store_key).await {
                    Ok(obj) => {
                        let entry = ImageWithMeta {
                            headers: store_meta_headers(&obj),
                            image: obj.body,
                        };
                        self.cache.set(&origin_key, &entry.to_bytes()).await;
                        entry
                    }
                    Err(StoreError::NotFound) => {
                        tracing::info!(key = store_key, "object store key not found");
                        return Ok(not_found_response());
                    }
                    Err(err) => return Err(ProxyError::Store(err.to_string())),
                }
            }
        };

        self.respond_transformed(req, entry).await
    }

    /// Fetch an HTTP origin for a transforming request, serving the
    /// origin cache first. Non-success origin responses propagate
    /// untouched and are never cached here.
    async fn http_origin_round_trip(&self, req: &ProxyRequest) -> Result<ProxyResponse> {
        let origin_url = req.origin_url();
        let origin_key = data_cache_key(&origin_url);

        let entry = match self.cached_origin(&origin_key).await {
            Some(entry) => entry,
            None => {
                let resp = fetch_http_origin(
                    &self.client,
                    &origin_url,
                    &axum::http::HeaderMap::new(),
                    self.max_origin_bytes,
                )
                .await?;
                if !resp.status.is_success() {
                    return Ok(resp);
                }
                let entry = ImageWithMeta {
                    headers: response_meta_headers(&resp),
                    image: resp.body.to_vec(),
                };
                self.cache.set(&origin_key, &entry.to_bytes()).await;
                entry
            }
        };

        self.respond_transformed(req, entry).await
    }

    /// Run the transformer over origin bytes and wrap the result in a
    /// synthetic cacheable response. Encoding happens off the async
    /// runtime; a panicking codec fails this request only.
    async fn respond_transformed(
        &self,
        req: &ProxyRequest,
        entry: ImageWithMeta,
    ) -> Result<ProxyResponse> {
        let fragment = req.url.fragment().unwrap_or("").to_string();
        let opt = parse_options(&fragment, false);

        let image = entry.image.clone();
        let task = tokio::task::spawn_blocking(move || {
            if fragment.is_empty() {
                let (converted, format) = detect_format(&image, &opt)?;
                Ok((converted.unwrap_or(image), format))
            } else {
                transform(&image, &opt)
            }
        });
        let (body, format) = match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(err),
            Err(join_err) => {
                return Err(ProxyError::Transform(format!(
                    "transform task panicked: {join_err}"
                )))
            }
        };

        let now = SystemTime::now();
        let mut resp = ProxyResponse::new(StatusCode::OK);
        resp.set_header(
            "Content-Type",
            content_type(&format).unwrap_or("application/octet-stream"),
        );
        resp.set_header("Date", &http_time(now));
        resp.set_header("Expires", &http_time(now + SYNTHETIC_EXPIRES));
        entry.apply_headers(&mut resp);
        resp.set_header("Content-Length", &body.len().to_string());
        resp.set_header("Vary", "Accept");
        resp.body = Bytes::from(body);
        Ok(resp)
    }
}

#[async_trait]
impl RoundTripper for TransformingTransport {
    async fn round_trip(&self, req: &ProxyRequest) -> Result<ProxyResponse> {
        if req.url.host_str() == Some(OBJECT_STORE_HOST) {
            return self.object_store_round_trip(req).await;
        }

        if req.url.fragment().unwrap_or("").is_empty() {
            // No transformation requested: plain proxy fetch, cached
            // (if at all) by the layer above.
            return fetch_http_origin(
                &self.client,
                &req.origin_url(),
                &req.headers,
                self.max_origin_bytes,
            )
            .await;
        }

        self.http_origin_round_trip(req).await
    }
}
