use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached upstream response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CachedResponse {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

/// Provider interface for the response cache. Failures in a provider must
/// degrade to direct upstream calls, so the API is infallible from the
/// caller's perspective.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Fresh entry for `key`, or `None`.
    async fn get(&self, key: &str) -> Option<CachedResponse>;

    /// Store an entry under `key`, attributed to `scope` (the endpoint)
    /// for cardinality accounting. Returns `false` when the write was
    /// refused (cap reached or a fresher entry already exists).
    async fn put(&self, key: &str, scope: &str, response: CachedResponse) -> bool;
}

/// Process-local cache over a sharded map.
pub struct MemoryResponseCache {
    entries: DashMap<String, (String, CachedResponse)>,
    scope_counts: DashMap<String, usize>,
    max_entries_per_scope: usize,
}

impl MemoryResponseCache {
    pub fn new(max_entries_per_scope: usize) -> Self {
        Self {
            entries: DashMap::new(),
            scope_counts: DashMap::new(),
            max_entries_per_scope,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drop_entry(&self, key: &str) {
        if let Some((_, (scope, _))) = self.entries.remove(key) {
            if let Some(mut count) = self.scope_counts.get_mut(&scope) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        let entry = self.entries.get(key)?;
        let (_, response) = entry.value();
        if response.is_fresh(Instant::now()) {
            return Some(response.clone());
        }
        drop(entry);
        self.drop_entry(key);
        None
    }

    async fn put(&self, key: &str, scope: &str, response: CachedResponse) -> bool {
        if let Some(existing) = self.entries.get(key) {
            // A fresher filler already wrote; a late upstream result must
            // not clobber it.
            if existing.value().1.stored_at > response.stored_at {
                return false;
            }
            drop(existing);
            self.drop_entry(key);
        }

        {
            let mut count = self.scope_counts.entry(scope.to_string()).or_insert(0);
            if *count >= self.max_entries_per_scope {
                debug!(scope = %scope, "Response cache cap reached, refusing write");
                return false;
            }
            *count += 1;
        }

        self.entries
            .insert(key.to_string(), (scope.to_string(), response));
        true
    }
}

/// Build the cache key for a proxied GET.
///
/// The Authorization header enters only as a digest: entries stay
/// partitioned per principal without the token itself being stored.
pub fn cache_key(
    environment: &str,
    endpoint: &str,
    path: &str,
    query: &str,
    auth_header: Option<&str>,
    accept_language: Option<&str>,
) -> String {
    let mut key = format!("proxy:{environment}:{endpoint}:{path}:{query}");
    if let Some(auth) = auth_header {
        let digest = Sha256::digest(auth.as_bytes());
        key.push_str(":auth:");
        for byte in digest {
            key.push_str(&format!("{byte:02x}"));
        }
    }
    if let Some(lang) = accept_language {
        key.push_str(&format!(":lang:{lang}"));
    }
    key
}
