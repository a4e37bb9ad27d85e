//! In-memory artifact cache, LRU with TTL. A hit returns the stored
//! artifact with `metadata.cacheHit` stamped true so consumers can tell it
//! apart from a fresh generation.

use crate::config::CacheConfig;
use dreamweave_providers::ValidatedArtifact;
use lru::LruCache;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CachedArtifact {
    artifact: ValidatedArtifact,
    stored_at: Instant,
}

pub struct ArtifactCache {
    enabled: bool,
    ttl: Duration,
    inner: Mutex<LruCache<u64, CachedArtifact>>,
}

impl ArtifactCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: config.enabled,
            ttl: config.ttl,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn key(prompt: &str, style: Option<&str>, quality: Option<&str>) -> u64 {
        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        style.unwrap_or("").hash(&mut hasher);
        quality.unwrap_or("").hash(&mut hasher);
        hasher.finish()
    }

    /// Look up a cached artifact. Hits come back with `cacheHit` stamped.
    pub fn get(&self, key: u64) -> Option<ValidatedArtifact> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&key) {
            Some(cached) if cached.stored_at.elapsed() <= self.ttl => {
                let mut artifact = cached.artifact.clone();
                if artifact.content.get("metadata").is_some() {
                    artifact.content["metadata"]["cacheHit"] = json!(true);
                }
                Some(artifact)
            }
            Some(_) => {
                inner.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: u64, artifact: ValidatedArtifact) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.put(
            key,
            CachedArtifact {
                artifact,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
