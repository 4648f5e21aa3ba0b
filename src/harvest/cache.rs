use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::debug;

/// Per-provider pricelist dumps on disk, fresh while younger than the TTL
/// (judged by file mtime).
#[derive(Debug, Clone)]
pub struct PricelistCache {
    dir: PathBuf,
    ttl: Duration,
}

impl PricelistCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn path(&self, source_code: &str) -> PathBuf {
        self.dir.join(format!("{source_code}_pricelist.json"))
    }

    pub fn age(path: &Path) -> Option<Duration> {
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or_default())
    }

    /// Cached bytes when present and within the TTL.
    pub fn load_fresh(&self, source_code: &str) -> Option<Vec<u8>> {
        let path = self.path(source_code);
        let age = Self::age(&path)?;
        if age >= self.ttl {
            debug!(source = source_code, age_secs = age.as_secs(), "cached pricelist is stale");
            return None;
        }
        fs::read(&path).ok()
    }

    pub fn store(&self, source_code: &str, bytes: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;
        let path = self.path(source_code);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_until_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PricelistCache::new(dir.path(), Duration::from_secs(3600));
        assert!(cache.load_fresh("cardkingdom").is_none());
        cache.store("cardkingdom", b"[]").unwrap();
        assert_eq!(cache.load_fresh("cardkingdom").as_deref(), Some(&b"[]"[..]));

        let expired = PricelistCache::new(dir.path(), Duration::ZERO);
        assert!(expired.load_fresh("cardkingdom").is_none());
    }
}
