use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::fs;

use crate::cache::Cache;

pub const DEFAULT_HOT_SET_MAX: u64 = 1024 * 1024 * 1024;

/// Disk-backed byte store with a bounded in-memory hot set.
///
/// Keys are hashed to `base/xx/yy/<md5hex>` so directories stay small.
/// Writes go to a temp file and rename into place; the hot set is only
/// populated on read, so a write invalidates any hot entry for the key.
/// File mtimes are refreshed on read, which is what the offline janitor
/// uses to age entries out.
pub struct DiskCache {
    base: PathBuf,
    hot: RwLock<HotSet>,
}

struct HotSet {
    map: HashMap<String, Vec<u8>>,
    size: u64,
    max: u64,
}

impl HotSet {
    /// Admit a value read from disk. Values larger than the whole hot
    /// set are not admitted; otherwise entries are dropped in arbitrary
    /// order until the value fits.
    fn admit(&mut self, key: &str, value: &[u8]) {
        let value_size = value.len() as u64;
        if value_size > self.max {
            tracing::debug!(key, size = value_size, "value exceeds hot set capacity");
            return;
        }
        while self.size + value_size > self.max {
            let Some(evict) = self.map.keys().next().cloned() else {
                break;
            };
            self.remove(&evict);
        }
        if self.size + value_size > self.max {
            // Accounting drift; drop the hot set rather than the server.
            tracing::error!(key, "hot set accounting out of sync, clearing");
            self.map.clear();
            self.size = 0;
        }
        self.size += value_size;
        self.map.insert(key.to_string(), value.to_vec());
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.map.remove(key) {
            self.size -= old.len() as u64;
        }
    }
}

impl DiskCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self::with_hot_set_max(base, DEFAULT_HOT_SET_MAX)
    }

    pub fn with_hot_set_max(base: impl Into<PathBuf>, max: u64) -> Self {
        DiskCache {
            base: base.into(),
            hot: RwLock::new(HotSet {
                map: HashMap::new(),
                size: 0,
                max,
            }),
        }
    }

    fn file_name(key: &str) -> String {
        hex::encode(Md5::digest(key.as_bytes()))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = Self::file_name(key);
        self.base.join(&name[0..2]).join(&name[2..4]).join(name)
    }

    /// Remove now-empty hash directories after a delete.
    async fn prune_dirs(&self, path: &Path) {
        let mut dir = path.parent();
        for _ in 0..2 {
            let Some(d) = dir else { break };
            // remove_dir fails on non-empty directories, which is the
            // signal to stop pruning.
            if fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    fn touch(path: &Path) {
        let now = SystemTime::now();
        if let Ok(f) = std::fs::File::options().append(true).open(path) {
            let _ = f.set_modified(now);
        }
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(hit) = self
            .hot
            .read()
            .expect("hot set lock poisoned")
            .map
            .get(key)
        {
            return Some(hit.clone());
        }

        let path = self.path_for(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(key, error = %err, "disk cache read failed");
                }
                return None;
            }
        };

        Self::touch(&path);
        self.hot
            .write()
            .expect("hot set lock poisoned")
            .admit(key, &data);
        Some(data)
    }

    async fn set(&self, key: &str, value: &[u8]) {
        let path = self.path_for(key);
        let write = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, value).await?;
            fs::rename(&tmp, &path).await
        };
        if let Err(err) = write.await {
            tracing::warn!(key, error = %err, "disk cache write failed");
            return;
        }
        // The hot set is populated on read only; a stale entry for this
        // key must go.
        self.hot.write().expect("hot set lock poisoned").remove(key);
    }

    async fn delete(&self, key: &str) {
        self.hot.write().expect("hot set lock poisoned").remove(key);

        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => self.prune_dirs(&path).await,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(key, error = %err, "disk cache delete failed"),
        }
    }

    async fn exists(&self, key: &str) -> bool {
        if self
            .hot
            .read()
            .expect("hot set lock poisoned")
            .map
            .contains_key(key)
        {
            return true;
        }
        match fs::metadata(self.path_for(key)).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }
}
