//! Best-effort on-disk JSON cache for idempotent lookups.
//!
//! One file per key. Reading an entry refreshes its mtime, so `prune`
//! removes entries that have not been *used* for a while rather than ones
//! that were merely written long ago.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::CacheError;

pub const DEFAULT_PRUNE_DAYS: u64 = 30;

#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `sha256(url)[..16]`, optionally prefixed, plus `.json`.
    pub fn key_for(url: &str, prefix: Option<&str>) -> String {
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        match prefix {
            Some(p) if !p.is_empty() => format!("{p}_{}.json", &digest[..16]),
            _ => format!("{}.json", &digest[..16]),
        }
    }

    /// A corrupt or unreadable entry is treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.dir.join(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return None,
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                touch(&path);
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "corrupt cache entry ignored");
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec(value)?;
        fs::write(self.dir.join(key), bytes)?;
        debug!(key, "cache entry written");
        Ok(())
    }

    /// Remove entries not used in the last `days` days. A missing cache
    /// directory has nothing to prune.
    pub fn prune(&self, days: u64) -> Result<Vec<String>, CacheError> {
        self.prune_before(SystemTime::now() - Duration::from_secs(days * 86_400))
    }

    fn prune_before(&self, cutoff: SystemTime) -> Result<Vec<String>, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            if meta.modified()? < cutoff {
                fs::remove_file(entry.path())?;
                removed.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        removed.sort();
        info!(dir = %self.dir.display(), removed = removed.len(), "cache pruned");
        Ok(removed)
    }
}

fn touch(path: &Path) {
    let result = fs::File::options()
        .append(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "could not refresh cache entry mtime");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_key_for() {
        let key = FileCache::key_for("https://example.org/q?x=1", None);
        assert_eq!(key.len(), 16 + ".json".len());
        assert!(key.ends_with(".json"));

        let prefixed = FileCache::key_for("https://example.org/q?x=1", Some("1234AB"));
        assert_eq!(prefixed, format!("1234AB_{key}"));
        assert_ne!(key, FileCache::key_for("https://example.org/q?x=2", None));
    }

    #[test]
    fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("nested"));
        assert!(cache.get::<Value>("a.json").is_none());

        cache.put("a.json", &json!({"docs": [1, 2]})).unwrap();
        assert_eq!(cache.get::<Value>("a.json"), Some(json!({"docs": [1, 2]})));
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let cache = FileCache::new(dir.path());
        assert!(cache.get::<Value>("bad.json").is_none());
    }

    #[test]
    fn test_prune() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        cache.put("old.json", &json!(1)).unwrap();
        cache.put("new.json", &json!(2)).unwrap();

        let old = SystemTime::now() - Duration::from_secs(40 * 86_400);
        fs::File::options()
            .append(true)
            .open(dir.path().join("old.json"))
            .unwrap()
            .set_modified(old)
            .unwrap();

        let removed = cache.prune(DEFAULT_PRUNE_DAYS).unwrap();
        assert_eq!(removed, vec!["old.json".to_string()]);
        assert!(cache.get::<Value>("new.json").is_some());
    }

    #[test]
    fn test_prune_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("absent"));
        assert!(cache.prune(1).unwrap().is_empty());
    }
}
