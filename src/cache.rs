//! The cache contract: opaque to the core beyond this trait. Local disk
//! caches, remote content-addressed stores, or any combination are all
//! just `Cache` implementations from the scheduler's point of view.

use async_trait::async_trait;
use camino::Utf8Path;

use crate::target::BuildTarget;

/// A binary key for a single cache entry, typically the target's output
/// hash combined with the configuration hash (§4.7).
pub type CacheKey = Vec<u8>;

/// Pluggable content-addressed cache. Implementations must provide
/// at-most-once effective store semantics for a given `(target, key)`;
/// the engine may call `store` redundantly (e.g. after a retry) and
/// relies on the cache to de-duplicate rather than duplicate bytes.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Stores every file in `files` under `key`, indexed against
    /// `target` for cache implementations that shard by target.
    async fn store(&self, target: &BuildTarget, key: &CacheKey, files: &[&Utf8Path]) -> anyhow::Result<()>;

    /// Attempts to populate `files` from the cache. Returns whether
    /// every requested file was present; a partial hit is treated as a
    /// miss by the caller.
    async fn retrieve(&self, target: &BuildTarget, key: &CacheKey, files: &[&Utf8Path]) -> anyhow::Result<bool>;

    async fn store_file(
        &self,
        target: &BuildTarget,
        key: &CacheKey,
        contents: &[u8],
        filename: &str,
    ) -> anyhow::Result<()>;

    async fn retrieve_file(
        &self,
        target: &BuildTarget,
        key: &CacheKey,
        filename: &str,
    ) -> anyhow::Result<Option<Vec<u8>>>;

    async fn clean(&self, target: &BuildTarget) -> anyhow::Result<()>;

    async fn clean_all(&self) -> anyhow::Result<()>;

    /// Must drain any in-flight asynchronous writes before returning, so
    /// the process can exit without losing a store that raced shutdown.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// An always-miss cache: useful as the default when no cache backend is
/// configured, and as a baseline in tests.
#[derive(Default)]
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn store(&self, _target: &BuildTarget, _key: &CacheKey, _files: &[&Utf8Path]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn retrieve(&self, _target: &BuildTarget, _key: &CacheKey, _files: &[&Utf8Path]) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn store_file(
        &self,
        _target: &BuildTarget,
        _key: &CacheKey,
        _contents: &[u8],
        _filename: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn retrieve_file(
        &self,
        _target: &BuildTarget,
        _key: &CacheKey,
        _filename: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn clean(&self, _target: &BuildTarget) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clean_all(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An in-memory cache, keyed by `(label, key, filename)`, used by the
/// scheduler's own tests to exercise the hit/miss path without touching
/// a filesystem.
#[derive(Default)]
pub struct InMemoryCache {
    files: parking_lot::Mutex<std::collections::HashMap<(String, CacheKey, String), Vec<u8>>>,
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn store(&self, target: &BuildTarget, key: &CacheKey, files: &[&Utf8Path]) -> anyhow::Result<()> {
        for file in files {
            let contents = std::fs::read(file)?;
            self.store_file(target, key, &contents, file.as_str()).await?;
        }
        Ok(())
    }

    async fn retrieve(&self, target: &BuildTarget, key: &CacheKey, files: &[&Utf8Path]) -> anyhow::Result<bool> {
        for file in files {
            if self.retrieve_file(target, key, file.as_str()).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn store_file(
        &self,
        target: &BuildTarget,
        key: &CacheKey,
        contents: &[u8],
        filename: &str,
    ) -> anyhow::Result<()> {
        self.files.lock().insert(
            (target.label.to_string(), key.clone(), filename.to_string()),
            contents.to_vec(),
        );
        Ok(())
    }

    async fn retrieve_file(
        &self,
        target: &BuildTarget,
        key: &CacheKey,
        filename: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .files
            .lock()
            .get(&(target.label.to_string(), key.clone(), filename.to_string()))
            .cloned())
    }

    async fn clean(&self, target: &BuildTarget) -> anyhow::Result<()> {
        let label = target.label.to_string();
        self.files.lock().retain(|(l, _, _), _| l != &label);
        Ok(())
    }

    async fn clean_all(&self) -> anyhow::Result<()> {
        self.files.lock().clear();
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::parse;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn null_cache_always_misses() {
        let cache = NullCache;
        let target = BuildTarget::new(parse("//a:x", "").unwrap(), BTreeSet::new());
        let got = cache.retrieve_file(&target, &vec![1, 2, 3], "out.txt").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn in_memory_cache_round_trips_a_file() {
        let cache = InMemoryCache::default();
        let target = BuildTarget::new(parse("//a:x", "").unwrap(), BTreeSet::new());
        let key = vec![9, 9, 9];
        cache.store_file(&target, &key, b"hello", "out.txt").await.unwrap();
        let got = cache.retrieve_file(&target, &key, "out.txt").await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn in_memory_cache_misses_unknown_key() {
        let cache = InMemoryCache::default();
        let target = BuildTarget::new(parse("//a:x", "").unwrap(), BTreeSet::new());
        let got = cache.retrieve_file(&target, &vec![1], "missing.txt").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn clean_removes_only_that_targets_entries() {
        let cache = InMemoryCache::default();
        let a = BuildTarget::new(parse("//a:x", "").unwrap(), BTreeSet::new());
        let b = BuildTarget::new(parse("//b:y", "").unwrap(), BTreeSet::new());
        let key = vec![1];
        cache.store_file(&a, &key, b"a", "out").await.unwrap();
        cache.store_file(&b, &key, b"b", "out").await.unwrap();
        cache.clean(&a).await.unwrap();
        assert_eq!(cache.retrieve_file(&a, &key, "out").await.unwrap(), None);
        assert_eq!(cache.retrieve_file(&b, &key, "out").await.unwrap(), Some(b"b".to_vec()));
    }
}
