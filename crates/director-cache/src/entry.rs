//! Cache entries: per-key objects, their variants, and delivery.

use bytes::Bytes;
use director_core::{HttpExchange, HttpStatus, ResponseSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Lifecycle of a cached object (per variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Just being constructed; no completed body yet.
    Spawning,
    /// Valid and ready to be delivered.
    Active,
    /// Expired; the next request triggers a rebuild.
    Stale,
    /// Stale, and a rebuild is already in progress.
    Updating,
}

impl ObjectState {
    /// Value of the `X-Cache-Lookup` response header for this state.
    pub(crate) fn lookup_str(self) -> &'static str {
        match self {
            ObjectState::Spawning => "miss",
            ObjectState::Active => "hit",
            ObjectState::Stale => "stale",
            ObjectState::Updating => "stale-updating",
        }
    }
}

/// A completed response representation.
#[derive(Clone)]
pub(crate) struct Stored {
    pub status: HttpStatus,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub etag: Option<String>,
    pub mtime: Option<SystemTime>,
    pub ctime: Instant,
    pub hits: Arc<AtomicU64>,
}

impl Stored {
    pub fn from_snapshot(snapshot: &ResponseSnapshot, now: Instant) -> Self {
        let headers: Vec<(String, String)> = snapshot
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("X-Director-Cache")
                    && !name.to_ascii_lowercase().starts_with("x-cache-")
                    && !name.eq_ignore_ascii_case("Age")
            })
            .cloned()
            .collect();

        let etag = snapshot.header("ETag").map(str::to_string);
        let mtime = snapshot
            .header("Last-Modified")
            .and_then(|v| httpdate::parse_http_date(v).ok());

        Self {
            status: snapshot.status,
            headers,
            body: snapshot.body.clone(),
            etag,
            mtime,
            ctime: now,
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serves this representation to `exchange` and finishes the request.
    ///
    /// For GET requests the client's conditional headers are evaluated
    /// first; a 304 or 412 short-circuits the body.
    pub fn deliver(&self, exchange: &Arc<dyn HttpExchange>, lookup: ObjectState, now: Instant) {
        let hits = self.hits.fetch_add(1, Ordering::Relaxed) + 1;

        if exchange.method() == "GET" {
            if let Some(status) = self.check_client_cache(exchange) {
                exchange.set_status(status);
                if let Some(etag) = &self.etag {
                    exchange.push_header("ETag", etag);
                }
                if let Some(mtime) = self.mtime {
                    exchange.push_header("Last-Modified", &httpdate::fmt_http_date(mtime));
                }
                self.add_cache_headers(exchange, lookup, hits, now);
                exchange.finish();
                return;
            }
        }

        exchange.set_status(self.status);
        for (name, value) in &self.headers {
            exchange.push_header(name, value);
        }
        self.add_cache_headers(exchange, lookup, hits, now);
        exchange.overwrite_header("Content-Length", &self.body.len().to_string());

        if exchange.method() != "HEAD" {
            exchange.write_body(&self.body);
        }
        exchange.finish();
    }

    fn add_cache_headers(
        &self,
        exchange: &Arc<dyn HttpExchange>,
        lookup: ObjectState,
        hits: u64,
        now: Instant,
    ) {
        exchange.push_header("X-Cache-Lookup", lookup.lookup_str());
        exchange.push_header("X-Cache-Hits", &hits.to_string());
        let age = now.saturating_duration_since(self.ctime).as_secs();
        exchange.push_header("Age", &age.to_string());
    }

    /// Evaluates the client's conditional request headers against this
    /// representation. Returns the short-circuit status, if any.
    fn check_client_cache(&self, exchange: &Arc<dyn HttpExchange>) -> Option<HttpStatus> {
        if let (Some(value), Some(etag)) = (exchange.request_header("If-None-Match"), &self.etag) {
            if value == *etag {
                return Some(HttpStatus::NOT_MODIFIED);
            }
        }

        if let (Some(value), Some(mtime)) = (exchange.request_header("If-Modified-Since"), self.mtime)
        {
            if let Ok(since) = httpdate::parse_http_date(&value) {
                if mtime <= since {
                    return Some(HttpStatus::NOT_MODIFIED);
                }
            }
        }

        if let Some(value) = exchange.request_header("If-Match") {
            if value != "*" && self.etag.as_deref() != Some(value.as_str()) {
                return Some(HttpStatus::PRECONDITION_FAILED);
            }
        }

        if let (Some(value), Some(mtime)) =
            (exchange.request_header("If-Unmodified-Since"), self.mtime)
        {
            if let Ok(since) = httpdate::parse_http_date(&value) {
                if mtime > since {
                    return Some(HttpStatus::PRECONDITION_FAILED);
                }
            }
        }

        None
    }
}

/// A request parked on a variant until its build completes.
pub(crate) struct Waiter {
    pub exchange: Arc<dyn HttpExchange>,
    pub parked_at: Instant,
}

/// One representation of a key, distinguished by the `Vary` request
/// headers.
pub(crate) struct Variant {
    /// Stable id within the entry; build tokens refer to variants by id so
    /// a removal never invalidates an unrelated token.
    pub id: u64,
    /// (header name, value) pairs that select this variant; empty until the
    /// first commit establishes the `Vary` list. A request without the
    /// header matches an empty recorded value.
    pub matchers: Vec<(String, String)>,
    pub state: ObjectState,
    pub building: bool,
    pub stored: Option<Stored>,
    pub interests: Vec<Waiter>,
}

impl Variant {
    pub fn spawning(id: u64) -> Self {
        Self {
            id,
            matchers: Vec::new(),
            state: ObjectState::Spawning,
            building: true,
            stored: None,
            interests: Vec::new(),
        }
    }

    pub fn matches(&self, exchange: &Arc<dyn HttpExchange>) -> bool {
        self.matchers.iter().all(|(name, value)| {
            exchange.request_header(name).unwrap_or_default() == *value
        })
    }
}

/// All variants stored under one cache key.
pub(crate) struct Entry {
    /// Request-header names from the origin's `Vary` response header.
    pub vary: Vec<String>,
    pub variants: Vec<Variant>,
    next_id: u64,
}

impl Entry {
    pub fn new() -> Self {
        Self {
            vary: Vec::new(),
            variants: Vec::new(),
            next_id: 0,
        }
    }

    pub fn spawn_variant(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.variants.push(Variant::spawning(id));
        id
    }

    pub fn variant_mut(&mut self, id: u64) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == id)
    }

    /// The variant serving `exchange`, per the current vary list.
    pub fn select(&self, exchange: &Arc<dyn HttpExchange>) -> Option<u64> {
        if self.vary.is_empty() {
            return self.variants.first().map(|v| v.id);
        }
        self.variants
            .iter()
            .find(|v| v.matches(exchange))
            .map(|v| v.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use director_core::testing::MockExchange;

    fn stored_with(etag: Option<&str>, mtime: Option<SystemTime>) -> Stored {
        Stored {
            status: HttpStatus::OK,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: Bytes::from_static(b"cached"),
            etag: etag.map(str::to_string),
            mtime,
            ctime: Instant::now(),
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    #[test]
    fn delivery_writes_body_and_cache_headers() {
        let stored = stored_with(None, None);
        let ex: Arc<dyn HttpExchange> = Arc::new(MockExchange::get("/x"));
        stored.deliver(&ex, ObjectState::Active, Instant::now());

        assert!(ex.is_finished());
        assert_eq!(ex.response_header("X-Cache-Lookup").as_deref(), Some("hit"));
        assert_eq!(ex.response_header("X-Cache-Hits").as_deref(), Some("1"));
        assert_eq!(ex.response_header("Content-Length").as_deref(), Some("6"));
    }

    #[test]
    fn head_requests_get_headers_but_no_body() {
        let stored = stored_with(None, None);
        let mock = Arc::new(MockExchange::new("HEAD", "/x", ""));
        let ex: Arc<dyn HttpExchange> = mock.clone();
        stored.deliver(&ex, ObjectState::Active, Instant::now());
        assert!(mock.body().is_empty());
        assert_eq!(mock.status_code(), Some(200));
    }

    #[test]
    fn if_none_match_yields_not_modified() {
        let stored = stored_with(Some("\"v1\""), None);
        let mock = Arc::new(MockExchange::get("/x").with_request_header("If-None-Match", "\"v1\""));
        let ex: Arc<dyn HttpExchange> = mock.clone();
        stored.deliver(&ex, ObjectState::Active, Instant::now());
        assert_eq!(mock.status_code(), Some(304));
        assert!(mock.body().is_empty());
    }

    #[test]
    fn if_match_mismatch_yields_precondition_failed() {
        let stored = stored_with(Some("\"v2\""), None);
        let mock = Arc::new(MockExchange::get("/x").with_request_header("If-Match", "\"v1\""));
        let ex: Arc<dyn HttpExchange> = mock.clone();
        stored.deliver(&ex, ObjectState::Active, Instant::now());
        assert_eq!(mock.status_code(), Some(412));
    }

    #[test]
    fn if_modified_since_respects_stored_mtime() {
        let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let stored = stored_with(None, Some(mtime));
        let header = httpdate::fmt_http_date(mtime + std::time::Duration::from_secs(60));

        let mock =
            Arc::new(MockExchange::get("/x").with_request_header("If-Modified-Since", &header));
        let ex: Arc<dyn HttpExchange> = mock.clone();
        stored.deliver(&ex, ObjectState::Active, Instant::now());
        assert_eq!(mock.status_code(), Some(304));
    }

    #[test]
    fn variant_matching_uses_all_matchers() {
        let mut variant = Variant::spawning(0);
        variant.matchers = vec![("Accept-Encoding".into(), "gzip".into())];

        let gzip: Arc<dyn HttpExchange> =
            Arc::new(MockExchange::get("/x").with_request_header("Accept-Encoding", "gzip"));
        let plain: Arc<dyn HttpExchange> = Arc::new(MockExchange::get("/x"));

        assert!(variant.matches(&gzip));
        assert!(!variant.matches(&plain));
    }
}
