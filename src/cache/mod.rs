//! In-memory HTTP response cache.
//!
//! An index-based slab-backed LRU (arena + index, not an intrusive pointer
//! list) guarded by a single `tokio::sync::RwLock`: the LRU reordering a
//! `get` performs can't be made lock-free the way the routing table's
//! swap-on-write can, so this follows the rate limiter's explicit-lock
//! idiom instead of `dashmap`.

use bytes::Bytes;
use http::HeaderMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;

use crate::config::CacheSectionConfig;

/// Identifies a cached response: method + path + query + a canonical
/// signature of whatever headers the response's `Vary` named.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: String,
    pub path: String,
    pub query: String,
    pub vary_signature: String,
}

impl CacheKey {
    pub fn new(method: &str, path: &str, query: &str, vary_signature: String) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            vary_signature,
        }
    }
}

/// Parsed `Cache-Control` directives relevant to proxy caching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControlDirectives {
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub is_private: bool,
    pub is_public: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

/// Parse a `Cache-Control` header value into its directives. Unknown or
/// malformed tokens are ignored rather than rejected outright.
pub fn parse_cache_control(value: &str) -> CacheControlDirectives {
    let mut directives = CacheControlDirectives::default();
    for token in value.split(',') {
        let token = token.trim().to_ascii_lowercase();
        if token == "no-cache" {
            directives.no_cache = true;
        } else if token == "no-store" {
            directives.no_store = true;
        } else if token == "must-revalidate" {
            directives.must_revalidate = true;
        } else if token == "private" {
            directives.is_private = true;
        } else if token == "public" {
            directives.is_public = true;
        } else if let Some(v) = token.strip_prefix("max-age=") {
            directives.max_age = v.trim().parse().ok();
        } else if let Some(v) = token.strip_prefix("s-maxage=") {
            directives.s_maxage = v.trim().parse().ok();
        }
    }
    directives
}

fn parse_cache_control_header(headers: &HeaderMap) -> CacheControlDirectives {
    headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(parse_cache_control)
        .unwrap_or_default()
}

/// Seconds remaining until an HTTP-date `Expires` value, or `None` if the
/// header is missing, unparseable, or already in the past.
fn parse_expires_ttl(value: &str) -> Option<Duration> {
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

/// Cache-Control flags carried forward from the response that produced an
/// entry, consulted again on every subsequent hit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFlags {
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub content_length: usize,
    pub flags: CacheFlags,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn size_bytes(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

struct Slot {
    key: CacheKey,
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list of slab indices, most-recently-used at `head`.
struct Lru {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Lru {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().unwrap();
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(Slot {
                    key: key.clone(),
                    entry,
                    prev: None,
                    next: None,
                });
                idx
            }
            None => {
                self.slots.push(Some(Slot {
                    key: key.clone(),
                    entry,
                    prev: None,
                    next: None,
                }));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        idx
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let idx = self.index.remove(key)?;
        self.detach(idx);
        let slot = self.slots[idx].take().unwrap();
        self.free.push(idx);
        Some(slot.entry)
    }

    fn evict_tail(&mut self) -> Option<(CacheKey, CacheEntry)> {
        let idx = self.tail?;
        self.detach(idx);
        let slot = self.slots[idx].take().unwrap();
        self.free.push(idx);
        self.index.remove(&slot.key);
        Some((slot.key, slot.entry))
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[derive(Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stores: AtomicU64,
    pub evictions: AtomicU64,
    pub expired: AtomicU64,
    pub current_size_bytes: AtomicUsize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

pub struct HttpCache {
    config: CacheSectionConfig,
    lru: RwLock<Lru>,
    stats: CacheStats,
    /// Lowercased header names the most recent response for a given
    /// `(method, path)` named in its `Vary` header, used to build the
    /// lookup key for the *next* request to that resource.
    vary: RwLock<HashMap<(String, String), Vec<String>>>,
}

const CACHEABLE_METHODS: &[&str] = &["GET", "HEAD"];
const CACHEABLE_STATUS: &[u16] = &[200, 203, 300, 301, 302, 404, 410];

impl HttpCache {
    pub fn new(config: CacheSectionConfig) -> Self {
        Self {
            config,
            lru: RwLock::new(Lru::new()),
            stats: CacheStats::default(),
            vary: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn should_cache_request(&self, method: &str, path: &str, headers: &HeaderMap) -> bool {
        if !self.config.enabled {
            return false;
        }
        if !CACHEABLE_METHODS.contains(&method) {
            return false;
        }
        if self
            .config
            .no_cache_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return false;
        }
        if let Some(rule) = self.matching_rule(path) {
            if rule.no_cache {
                return false;
            }
        }
        if self
            .config
            .cache_bypass_headers
            .iter()
            .any(|h| headers.contains_key(h.as_str()))
        {
            return false;
        }
        true
    }

    pub fn should_cache_response(&self, status: u16, headers: &HeaderMap, content_length: usize) -> bool {
        if !CACHEABLE_STATUS.contains(&status) {
            return false;
        }
        if (content_length as u64) >= self.config.max_size {
            return false;
        }
        let directives = parse_cache_control_header(headers);
        if directives.no_store {
            return false;
        }
        if directives.is_private && !self.config.cache_private_responses {
            return false;
        }
        if directives.no_cache && self.config.respect_cache_control {
            return false;
        }
        true
    }

    fn matching_rule<'a>(&'a self, path: &str) -> Option<&'a crate::config::CacheRule> {
        self.config
            .rules
            .iter()
            .filter(|r| path.starts_with(&r.path_prefix))
            .max_by_key(|r| r.path_prefix.len())
    }

    fn clamp_ttl(&self, ttl: Duration) -> Duration {
        let min = Duration::from_secs(self.config.min_ttl);
        let max = Duration::from_secs(self.config.max_ttl);
        if min > max {
            return min;
        }
        ttl.clamp(min, max)
    }

    /// TTL derivation, in order: an explicit per-path rule override; the
    /// response's `Cache-Control: s-maxage`; `max-age`; `Expires`; the
    /// configured default. Always clamped to `[min_ttl, max_ttl]`.
    pub fn ttl_for_response(&self, path: &str, headers: &HeaderMap) -> Duration {
        if let Some(rule) = self.matching_rule(path) {
            if let Some(secs) = rule.ttl {
                return self.clamp_ttl(Duration::from_secs(secs));
            }
        }
        if self.config.respect_cache_control {
            let directives = parse_cache_control_header(headers);
            if let Some(secs) = directives.s_maxage.or(directives.max_age) {
                return self.clamp_ttl(Duration::from_secs(secs));
            }
            if let Some(ttl) = headers
                .get(http::header::EXPIRES)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_expires_ttl)
            {
                return self.clamp_ttl(ttl);
            }
        }
        self.clamp_ttl(Duration::from_secs(self.config.ttl))
    }

    /// Whether an entry must be revalidated with the upstream rather than
    /// served as an unconditional hit: `must-revalidate`, or the request
    /// carries a conditional header that disagrees with the entry.
    pub fn needs_revalidation(&self, entry: &CacheEntry, request_headers: &HeaderMap) -> bool {
        if entry.flags.must_revalidate {
            return true;
        }
        if let Some(etag) = entry.etag.as_deref() {
            if let Some(if_none_match) = request_headers
                .get(http::header::IF_NONE_MATCH)
                .and_then(|v| v.to_str().ok())
            {
                return if_none_match != etag;
            }
        }
        if let Some(last_modified) = entry.last_modified.as_deref() {
            if let Some(if_modified_since) = request_headers
                .get(http::header::IF_MODIFIED_SINCE)
                .and_then(|v| v.to_str().ok())
            {
                return if_modified_since != last_modified;
            }
        }
        false
    }

    /// Record the header names a response's `Vary` named for `(method,
    /// path)`, so the next lookup for that resource qualifies on them.
    /// Returns `false` for `Vary: *`, which the caller must treat as
    /// uncacheable rather than recorded.
    pub async fn record_vary(&self, method: &str, path: &str, vary_value: &str) -> bool {
        let names: Vec<String> = vary_value
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if names.iter().any(|n| n == "*") {
            return false;
        }
        if names.is_empty() {
            return true;
        }
        self.vary
            .write()
            .await
            .insert((method.to_string(), path.to_string()), names);
        true
    }

    /// Build the `vary_signature` a request should look up under, from
    /// the header names previously recorded for this resource (empty if
    /// no response for it has ever named a `Vary` header).
    pub async fn vary_signature(&self, method: &str, path: &str, request_headers: &HeaderMap) -> String {
        let names = {
            let vary = self.vary.read().await;
            vary.get(&(method.to_string(), path.to_string())).cloned()
        };
        match names {
            Some(names) => vary_signature_from_names(&names, request_headers),
            None => String::new(),
        }
    }

    pub fn make_entry(
        &self,
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        ttl: Duration,
        directives: &CacheControlDirectives,
    ) -> CacheEntry {
        let etag = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("etag"))
            .map(|(_, v)| v.clone());
        let last_modified = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("last-modified"))
            .map(|(_, v)| v.clone());
        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone());
        let content_length = body.len();
        let now = Instant::now();
        CacheEntry {
            status,
            headers,
            body,
            created_at: now,
            expires_at: now + ttl,
            etag,
            last_modified,
            content_type,
            content_length,
            flags: CacheFlags {
                private: directives.is_private,
                no_cache: directives.no_cache,
                no_store: directives.no_store,
                must_revalidate: directives.must_revalidate,
            },
            hit_count: 0,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut lru = self.lru.write().await;
        let idx = *lru.index.get(key)?;
        let expired = lru.slots[idx].as_ref().unwrap().entry.is_expired();
        if expired {
            lru.remove(key);
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        lru.touch(idx);
        let slot = lru.slots[idx].as_mut().unwrap();
        slot.entry.hit_count += 1;
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(slot.entry.clone())
    }

    pub async fn put(&self, key: CacheKey, entry: CacheEntry) {
        let size = entry.size_bytes();
        let mut lru = self.lru.write().await;

        if let Some(old) = lru.remove(&key) {
            self.stats
                .current_size_bytes
                .fetch_sub(old.size_bytes(), Ordering::Relaxed);
        }

        while lru.len() >= self.config.max_entries
            || self.stats.current_size_bytes.load(Ordering::Relaxed) + size
                > self.config.max_size as usize
        {
            match lru.evict_tail() {
                Some((_, evicted)) => {
                    self.stats
                        .current_size_bytes
                        .fetch_sub(evicted.size_bytes(), Ordering::Relaxed);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        lru.insert(key, entry);
        self.stats
            .current_size_bytes
            .fetch_add(size, Ordering::Relaxed);
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn remove(&self, key: &CacheKey) -> bool {
        let mut lru = self.lru.write().await;
        if let Some(entry) = lru.remove(key) {
            self.stats
                .current_size_bytes
                .fetch_sub(entry.size_bytes(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub async fn clear(&self) {
        let mut lru = self.lru.write().await;
        *lru = Lru::new();
        self.stats.current_size_bytes.store(0, Ordering::Relaxed);
        self.vary.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.lru.read().await.len()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

fn vary_signature_from_names(names: &[String], headers: &HeaderMap) -> String {
    let mut parts = Vec::with_capacity(names.len());
    for name in names {
        let value = headers.get(name.as_str()).and_then(|v| v.to_str().ok()).unwrap_or("");
        parts.push(format!("{name}={value}"));
    }
    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_entries: usize, max_size: u64, ttl: u64) -> CacheSectionConfig {
        CacheSectionConfig {
            enabled: true,
            r#type: "lru".into(),
            max_size,
            max_entries,
            ttl,
            min_ttl: 0,
            max_ttl: 86_400,
            respect_cache_control: true,
            cache_private_responses: false,
            cache_bypass_headers: vec!["Authorization".into()],
            no_cache_paths: vec![],
            rules: vec![],
        }
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::new("GET", path, "", String::new())
    }

    fn no_directives() -> CacheControlDirectives {
        CacheControlDirectives::default()
    }

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                http::HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[tokio::test]
    async fn test_put_then_get_hit() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let entry = cache.make_entry(
            200,
            vec![],
            Bytes::from_static(b"hello"),
            Duration::from_secs(60),
            &no_directives(),
        );
        cache.put(key("/a"), entry).await;
        let got = cache.get(&key("/a")).await.unwrap();
        assert_eq!(got.body, Bytes::from_static(b"hello"));
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_miss_increments_stats() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        assert!(cache.get(&key("/missing")).await.is_none());
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_evicted_on_get() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let entry = cache.make_entry(
            200,
            vec![],
            Bytes::from_static(b"x"),
            Duration::from_millis(1),
            &no_directives(),
        );
        cache.put(key("/a"), entry).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(&key("/a")).await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_evicts_lru_when_max_entries_exceeded() {
        let cache = HttpCache::new(cfg(2, 1_000_000, 60));
        for p in ["/a", "/b", "/c"] {
            let entry = cache.make_entry(
                200,
                vec![],
                Bytes::from_static(b"x"),
                Duration::from_secs(60),
                &no_directives(),
            );
            cache.put(key(p), entry).await;
        }
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&key("/a")).await.is_none(), "oldest entry should be evicted");
        assert!(cache.get(&key("/c")).await.is_some());
    }

    #[tokio::test]
    async fn test_touch_on_get_preserves_recently_used() {
        let cache = HttpCache::new(cfg(2, 1_000_000, 60));
        for p in ["/a", "/b"] {
            let entry = cache.make_entry(
                200,
                vec![],
                Bytes::from_static(b"x"),
                Duration::from_secs(60),
                &no_directives(),
            );
            cache.put(key(p), entry).await;
        }
        let _ = cache.get(&key("/a")).await;
        let entry = cache.make_entry(
            200,
            vec![],
            Bytes::from_static(b"x"),
            Duration::from_secs(60),
            &no_directives(),
        );
        cache.put(key("/c"), entry).await;
        assert!(cache.get(&key("/a")).await.is_some(), "/a was touched, should survive");
        assert!(cache.get(&key("/b")).await.is_none(), "/b should have been evicted");
    }

    #[test]
    fn test_should_cache_request_respects_rule_no_cache() {
        let mut c = cfg(10, 1_000_000, 60);
        c.rules.push(crate::config::CacheRule {
            path_prefix: "/admin".into(),
            ttl: None,
            no_cache: true,
        });
        let cache = HttpCache::new(c);
        let empty = HeaderMap::new();
        assert!(!cache.should_cache_request("GET", "/admin/users", &empty));
        assert!(cache.should_cache_request("GET", "/static/a.js", &empty));
        assert!(!cache.should_cache_request("POST", "/static/a.js", &empty));
    }

    #[test]
    fn test_should_cache_request_respects_no_cache_paths() {
        let mut c = cfg(10, 1_000_000, 60);
        c.no_cache_paths.push("/api/auth/".into());
        let cache = HttpCache::new(c);
        let empty = HeaderMap::new();
        assert!(!cache.should_cache_request("GET", "/api/auth/session", &empty));
        assert!(cache.should_cache_request("GET", "/api/widgets", &empty));
    }

    #[test]
    fn test_should_cache_request_rejects_bypass_header() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let authed = headers_with(&[("authorization", "Bearer x")]);
        assert!(!cache.should_cache_request("GET", "/widgets", &authed));
    }

    #[test]
    fn test_ttl_for_response_rule_override_wins() {
        let mut c = cfg(10, 1_000_000, 60);
        c.rules.push(crate::config::CacheRule {
            path_prefix: "/static".into(),
            ttl: Some(3600),
            no_cache: false,
        });
        let cache = HttpCache::new(c);
        let empty = HeaderMap::new();
        assert_eq!(cache.ttl_for_response("/static/a.js", &empty), Duration::from_secs(3600));
        assert_eq!(cache.ttl_for_response("/other", &empty), Duration::from_secs(60));
    }

    #[test]
    fn test_ttl_for_response_prefers_s_maxage_over_max_age() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let headers = headers_with(&[("cache-control", "max-age=30, s-maxage=120")]);
        assert_eq!(cache.ttl_for_response("/x", &headers), Duration::from_secs(120));
    }

    #[test]
    fn test_ttl_for_response_falls_back_to_max_age() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let headers = headers_with(&[("cache-control", "max-age=45")]);
        assert_eq!(cache.ttl_for_response("/x", &headers), Duration::from_secs(45));
    }

    #[test]
    fn test_ttl_for_response_clamps_to_configured_bounds() {
        let mut c = cfg(10, 1_000_000, 60);
        c.min_ttl = 10;
        c.max_ttl = 20;
        let cache = HttpCache::new(c);
        let headers = headers_with(&[("cache-control", "max-age=999")]);
        assert_eq!(cache.ttl_for_response("/x", &headers), Duration::from_secs(20));
    }

    #[test]
    fn test_ttl_for_response_ignores_cache_control_when_not_respected() {
        let mut c = cfg(10, 1_000_000, 60);
        c.respect_cache_control = false;
        let cache = HttpCache::new(c);
        let headers = headers_with(&[("cache-control", "max-age=999")]);
        assert_eq!(cache.ttl_for_response("/x", &headers), Duration::from_secs(60));
    }

    #[test]
    fn test_should_cache_response_status_and_size() {
        let cache = HttpCache::new(cfg(10, 100, 60));
        let empty = HeaderMap::new();
        assert!(cache.should_cache_response(200, &empty, 50));
        assert!(!cache.should_cache_response(500, &empty, 50));
        assert!(!cache.should_cache_response(200, &empty, 500));
    }

    #[test]
    fn test_should_cache_response_respects_no_store() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let headers = headers_with(&[("cache-control", "no-store")]);
        assert!(!cache.should_cache_response(200, &headers, 10));
    }

    #[test]
    fn test_should_cache_response_private_unless_configured() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let headers = headers_with(&[("cache-control", "private")]);
        assert!(!cache.should_cache_response(200, &headers, 10));

        let mut c = cfg(10, 1_000_000, 60);
        c.cache_private_responses = true;
        let cache = HttpCache::new(c);
        assert!(cache.should_cache_response(200, &headers, 10));
    }

    #[test]
    fn test_needs_revalidation_on_etag_mismatch() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let entry = cache.make_entry(
            200,
            vec![("etag".into(), "\"abc\"".into())],
            Bytes::from_static(b"x"),
            Duration::from_secs(60),
            &no_directives(),
        );
        let matching = headers_with(&[("if-none-match", "\"abc\"")]);
        let stale = headers_with(&[("if-none-match", "\"xyz\"")]);
        assert!(!cache.needs_revalidation(&entry, &matching));
        assert!(cache.needs_revalidation(&entry, &stale));
    }

    #[test]
    fn test_needs_revalidation_must_revalidate_always_true() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let mut directives = no_directives();
        directives.must_revalidate = true;
        let entry = cache.make_entry(
            200,
            vec![],
            Bytes::from_static(b"x"),
            Duration::from_secs(60),
            &directives,
        );
        assert!(cache.needs_revalidation(&entry, &HeaderMap::new()));
    }

    #[tokio::test]
    async fn test_vary_signature_empty_until_recorded() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let req = headers_with(&[("accept-encoding", "gzip")]);
        assert_eq!(cache.vary_signature("GET", "/a", &req).await, "");
        assert!(cache.record_vary("GET", "/a", "Accept-Encoding").await);
        assert_eq!(
            cache.vary_signature("GET", "/a", &req).await,
            "accept-encoding=gzip"
        );
    }

    #[tokio::test]
    async fn test_vary_star_is_uncacheable() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        assert!(!cache.record_vary("GET", "/a", "*").await);
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let cache = HttpCache::new(cfg(10, 1_000_000, 60));
        let entry = cache.make_entry(
            200,
            vec![],
            Bytes::from_static(b"x"),
            Duration::from_secs(60),
            &no_directives(),
        );
        cache.put(key("/a"), entry).await;
        cache.record_vary("GET", "/a", "Accept-Encoding").await;
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.stats().current_size_bytes.load(Ordering::Relaxed), 0);
        assert_eq!(
            cache.vary_signature("GET", "/a", &HeaderMap::new()).await,
            ""
        );
    }
}
