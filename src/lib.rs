pub mod cache;
pub mod config;
pub mod fetch;
pub mod gif;
pub mod handler;
pub mod options;
pub mod request;
pub mod sign;
pub mod transform;
pub mod transport;
pub mod wire;

use thiserror::Error;

pub use cache::{Cache, CachingTransport, DiskCache, MemoryCache, NopCache};
pub use config::{CliArgs, ProxyConfig, Secrets};
pub use handler::{router, Proxy};
pub use options::{parse_options, Options};
pub use request::{new_request, ImageRequest};
pub use sign::Signer;
pub use transport::TransformingTransport;
pub use wire::{ProxyRequest, ProxyResponse, RoundTripper};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed request URL: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("object store error: {0}")]
    Store(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("corrupt cache entry")]
    CorruptCacheEntry,
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
