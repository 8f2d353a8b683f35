pub mod disk;
pub mod http;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use url::Url;

pub use disk::DiskCache;
pub use http::{CachingTransport, X_FROM_CACHE};

/// Byte store shared by both cache tiers. Implementations are
/// best-effort: `set` and `delete` log failures instead of surfacing
/// them, and a failed read is a miss.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: &[u8]);
    async fn delete(&self, key: &str);
    async fn exists(&self, key: &str) -> bool;
}

/// Outer-cache key for a request URL. The fragment (the serialized
/// options) is part of the identity; `#` is flattened so the key stays a
/// plain string.
pub fn cache_key(url: &Url) -> String {
    url.as_str().replace('#', "_")
}

/// Origin-cache key for the untransformed image bytes behind a URL.
pub fn data_cache_key(url: &Url) -> String {
    format!("v2:{}", cache_key(url))
}

/// Cache that drops everything. Used when no cache directory is
/// configured.
pub struct NopCache;

#[async_trait]
impl Cache for NopCache {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    async fn set(&self, _key: &str, _value: &[u8]) {}

    async fn delete(&self, _key: &str) {}

    async fn exists(&self, _key: &str) -> bool {
        false
    }
}

/// Unbounded in-memory cache, mainly for tests and embedding.
#[derive(Default)]
pub struct MemoryCache {
    items: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.items
            .read()
            .expect("cache lock poisoned")
            .get(key)
            .cloned()
    }

    async fn set(&self, key: &str, value: &[u8]) {
        self.items
            .write()
            .expect("cache lock poisoned")
            .insert(key.to_string(), value.to_vec());
    }

    async fn delete(&self, key: &str) {
        self.items.write().expect("cache lock poisoned").remove(key);
    }

    async fn exists(&self, key: &str) -> bool {
        self.items
            .read()
            .expect("cache lock poisoned")
            .contains_key(key)
    }
}
