use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, File, FileFormat};
use serde::Deserialize;
use url::Url;

use crate::fetch::DEFAULT_MAX_ORIGIN_BYTES;
use crate::{ProxyError, Result};

pub const DEFAULT_ADDR: &str = "localhost:8080";

/// Secrets file, looked up relative to the working directory.
const SECRETS_FILE: &str = "conf/improxy.ini";

/// How many parent directories to try when resolving `conf/` paths.
/// Test binaries and the server run with different working
/// directories.
const MAX_PARENT_HOPS: usize = 3;

/// Command-line arguments for the proxy binary.
#[derive(Debug, Parser)]
#[command(name = "improxy", version, about = "Caching image transformation proxy")]
pub struct CliArgs {
    /// TCP address to listen on.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Comma separated list of allowed remote hosts.
    #[arg(long, default_value = "")]
    pub whitelist: String,

    /// Comma separated list of allowed referring hosts.
    #[arg(long, default_value = "")]
    pub referrers: String,

    /// Log file path; logs go to stdout when empty.
    #[arg(long, default_value = "")]
    pub logfile: String,

    /// Location to cache images; caching is disabled when empty.
    #[arg(long, default_value = "")]
    pub cache: String,

    /// Time limit in seconds for requests served by this proxy;
    /// 0 means no limit.
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,
}

/// Deployment secrets loaded from the INI file: the signing key and
/// XOR nonce, plus where the object store lives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub simple_key: String,
    #[serde(default)]
    pub magic_num: u32,
    #[serde(default)]
    pub store_endpoint: String,
    #[serde(default)]
    pub store_bucket: String,
    #[serde(default)]
    pub store_region: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
}

/// Runtime configuration threaded through the proxy constructors.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub whitelist: Vec<String>,
    pub referrers: Vec<String>,
    pub default_base_url: Option<Url>,
    pub timeout: Option<Duration>,
    pub max_origin_bytes: usize,
    pub secrets: Secrets,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            whitelist: Vec::new(),
            referrers: Vec::new(),
            default_base_url: Url::parse("http://awss3").ok(),
            timeout: None,
            max_origin_bytes: DEFAULT_MAX_ORIGIN_BYTES,
            secrets: Secrets::default(),
        }
    }
}

pub fn comma_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve a `conf/…` resource by walking up from the working
/// directory.
pub fn find_conf_path(rel: &str) -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    for _ in 0..=MAX_PARENT_HOPS {
        let candidate = dir.join(rel);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

/// Load the secrets INI. A missing file is not fatal: signatures then
/// never verify and the object store client points nowhere, which is
/// fine for HTTP-only deployments.
pub fn load_secrets() -> Result<Secrets> {
    let Some(path) = find_conf_path(SECRETS_FILE) else {
        tracing::warn!("{SECRETS_FILE} not found; running without secrets");
        return Ok(Secrets::default());
    };

    let cfg = Config::builder()
        .add_source(File::from(path.as_path()).format(FileFormat::Ini))
        .build()
        .map_err(|e| ProxyError::Config(e.to_string()))?;
    cfg.try_deserialize()
        .map_err(|e| ProxyError::Config(e.to_string()))
}
