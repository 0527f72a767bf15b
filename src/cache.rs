//! The response cache, the resolved-address cache and their entries.
//!
//! Both are bounded LRU stores. They live on the reactor thread and are
//! only ever touched from there, so neither takes a lock. The resolver
//! workers keep their own thread-local address caches on top of the
//! reactor-side one (see [`crate::resolver`]).

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::parser::Response;

/// Completed responses kept for revalidation.
pub const RESPONSE_CACHE_ENTRIES: usize = 10_000;

/// Resolved `host:port` endpoints kept on the reactor side to skip the
/// worker pool entirely.
pub const ADDR_CACHE_ENTRIES: usize = 10_000;

/// Per-worker thread-local address cache size.
pub const DNS_CACHE_ENTRIES: usize = 1_000;

/// Immutable snapshot of a completed origin response, plus the validators
/// needed to ask the origin whether it is still fresh.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    wire: Vec<u8>,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl CachedResponse {
    /// Snapshot a completed, cacheable response. Returns `None` when the
    /// response carries no validator to revalidate with.
    pub fn from_response(response: &Response) -> Option<CachedResponse> {
        let etag = response.header("etag").map(str::to_owned);
        let last_modified = response.header("last-modified").map(str::to_owned);
        if etag.is_none() && last_modified.is_none() {
            return None;
        }
        Some(CachedResponse {
            wire: response.raw().to_vec(),
            etag,
            last_modified,
        })
    }

    /// The exact bytes the origin sent, replayed to clients on a 304.
    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    /// Wire text of the conditional GET revalidating this entry.
    ///
    /// `If-None-Match` wins when an entity tag is known, otherwise the
    /// request falls back to `If-Modified-Since`.
    pub fn validating_request(&self, uri: &str, host: &str) -> Vec<u8> {
        let condition = match (&self.etag, &self.last_modified) {
            (Some(etag), _) => format!("If-None-Match: {etag}"),
            (None, Some(date)) => format!("If-Modified-Since: {date}"),
            (None, None) => unreachable!("cached entry without validator"),
        };
        format!("GET {uri} HTTP/1.1\r\nHost: {host}\r\n{condition}\r\n\r\n").into_bytes()
    }
}

/// Cache key: the upstream authority plus the origin-form URI.
pub fn response_key(host: &str, port: u16, uri: &str) -> String {
    format!("{host}:{port}{uri}")
}

/// Completed responses by `host:port + URI`, bounded, LRU-evicted.
pub struct ResponseCache {
    entries: LruCache<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> ResponseCache {
        ResponseCache {
            entries: LruCache::new(NonZeroUsize::new(capacity).expect("cache capacity")),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&CachedResponse> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: String, entry: CachedResponse) {
        self.entries.put(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reactor-owned `host:port` → address cache.
///
/// Keyed by host *and* port: one hostname may be proxied to on several
/// ports and the resolved endpoints must not be conflated.
pub struct AddrCache {
    entries: LruCache<String, SocketAddr>,
}

impl AddrCache {
    pub fn new(capacity: usize) -> AddrCache {
        AddrCache {
            entries: LruCache::new(NonZeroUsize::new(capacity).expect("cache capacity")),
        }
    }

    pub fn get(&mut self, host: &str, port: u16) -> Option<SocketAddr> {
        self.entries.get(&format!("{host}:{port}")).copied()
    }

    pub fn put(&mut self, host: &str, port: u16, addr: SocketAddr) {
        self.entries.put(format!("{host}:{port}"), addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(wire: &[u8]) -> CachedResponse {
        let mut response = Response::new(wire);
        response.finalize();
        CachedResponse::from_response(&response).expect("cacheable response")
    }

    #[test]
    fn put_then_get_returns_stored_value() {
        let mut cache = ResponseCache::new(4);
        let entry = cached(b"HTTP/1.1 200 OK\r\nETag: \"a\"\r\nContent-Length: 2\r\n\r\nhi");
        cache.put("example.test:80/".to_string(), entry);
        assert!(cache.contains("example.test:80/"));
        let got = cache.get("example.test:80/").unwrap();
        assert!(got.wire().starts_with(b"HTTP/1.1 200 OK"));
    }

    #[test]
    fn eviction_spares_recently_accessed_entries() {
        let mut cache = ResponseCache::new(2);
        let entry = cached(b"HTTP/1.1 200 OK\r\nETag: \"x\"\r\nContent-Length: 0\r\n\r\n");
        cache.put("a:80/".to_string(), entry.clone());
        cache.put("b:80/".to_string(), entry.clone());
        // touch "a" so "b" is now the least recently used
        assert!(cache.get("a:80/").is_some());
        cache.put("c:80/".to_string(), entry);
        assert!(cache.contains("a:80/"));
        assert!(!cache.contains("b:80/"));
        assert!(cache.contains("c:80/"));
    }

    #[test]
    fn validating_request_prefers_etag() {
        let entry = cached(b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Length: 2\r\n\r\nhi");
        let wire = entry.validating_request("/index", "example.test");
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("GET /index HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.test\r\n"));
        assert!(text.contains("If-None-Match: \"v1\"\r\n"));
        assert!(!text.contains("If-Modified-Since"));
    }

    #[test]
    fn validating_request_falls_back_to_last_modified() {
        let entry = cached(
            b"HTTP/1.1 200 OK\r\nLast-Modified: Tue, 02 Jan 2024 00:00:00 GMT\r\nContent-Length: 0\r\n\r\n",
        );
        let wire = entry.validating_request("/", "example.test");
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("If-Modified-Since: Tue, 02 Jan 2024 00:00:00 GMT\r\n"));
    }

    #[test]
    fn addr_cache_distinguishes_ports() {
        let mut cache = AddrCache::new(8);
        let a1: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let a2: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        cache.put("example.test", 8080, a1);
        cache.put("example.test", 9090, a2);
        assert_eq!(cache.get("example.test", 8080), Some(a1));
        assert_eq!(cache.get("example.test", 9090), Some(a2));
        assert_eq!(cache.get("example.test", 80), None);
    }
}
