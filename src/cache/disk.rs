// Disk tier: one JSON file per entry, named by the SHA-256 of type + key.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::types::{CacheEntry, CacheType};
use super::CacheError;

#[derive(Debug, Clone)]
pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str, cache_type: CacheType) -> PathBuf {
        let digest = Sha256::digest(format!("{}:{}", cache_type.as_str(), key).as_bytes());
        self.dir.join(format!("{digest:x}.json"))
    }

    pub async fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.path_for(&entry.key, entry.cache_type);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, key: &str, cache_type: CacheType) -> Result<Option<CacheEntry>, CacheError> {
        match tokio::fs::read(self.path_for(key, cache_type)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(&self, key: &str, cache_type: CacheType) -> Result<bool, CacheError> {
        match tokio::fs::remove_file(self.path_for(key, cache_type)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable entry; unreadable files are deleted.
    pub async fn entries(&self) -> Result<Vec<(PathBuf, CacheEntry)>, CacheError> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes).ok(),
                Err(_) => None,
            };
            match parsed {
                Some(entry) => out.push((path, entry)),
                None => {
                    warn!(path = %path.display(), "removing unreadable cache file");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        Ok(out)
    }

    pub async fn prune_expired(&self, now: i64) -> Result<usize, CacheError> {
        let mut removed = 0;
        for (path, entry) in self.entries().await? {
            if entry.is_expired(now) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        debug!(removed, "pruned expired disk entries");
        Ok(removed)
    }

    pub async fn purge_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut removed = 0;
        for (path, entry) in self.entries().await? {
            if entry.key.starts_with(prefix) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<usize, CacheError> {
        let entries = self.entries().await?;
        for (path, _) in &entries {
            tokio::fs::remove_file(path).await?;
        }
        Ok(entries.len())
    }
}
