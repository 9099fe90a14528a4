use std::collections::HashMap;

use bytes::Bytes;
use itertools::Itertools;
use parking_lot::Mutex;
use ring::digest;

use crate::client::redis::RedisHandle;
use crate::http::{
	Body, HeaderMap, HeaderValue, Request, Response, StatusCode, header, x_headers,
};
use crate::types::config::StoreMode;
use crate::types::features::CacheConfig;
use crate::*;

/// Response cache with LRU eviction, bounded by `max_size` entries. Conditional mode emits
/// `ETag` and answers `If-None-Match` / `If-Modified-Since` with 304.
pub struct ResponseCache {
	config: CacheConfig,
	entries: Mutex<LruMap>,
	redis: Option<RedisHandle>,
	bucket: Strng,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedResponse {
	pub status: u16,
	pub headers: Vec<(String, Vec<u8>)>,
	pub body: Bytes,
	pub stored_at_unix: u64,
	pub etag: String,
}

/// HashMap + monotonic counter LRU; writes are rare relative to reads but every hit updates
/// recency, so the whole map sits behind one mutex with short critical sections.
#[derive(Default)]
struct LruMap {
	entries: HashMap<String, (Arc<CachedResponse>, Instant, u64)>,
	tick: u64,
}

impl LruMap {
	fn get(&mut self, key: &str, ttl: Duration) -> Option<Arc<CachedResponse>> {
		self.tick += 1;
		let tick = self.tick;
		match self.entries.get_mut(key) {
			Some((resp, stored, last_use)) => {
				if stored.elapsed() >= ttl {
					self.entries.remove(key);
					return None;
				}
				*last_use = tick;
				Some(resp.clone())
			},
			None => None,
		}
	}

	fn insert(&mut self, key: String, resp: Arc<CachedResponse>, max_size: usize) {
		self.tick += 1;
		self.entries.insert(key, (resp, Instant::now(), self.tick));
		while self.entries.len() > max_size {
			let Some(oldest) = self
				.entries
				.iter()
				.min_by_key(|(_, (_, _, last_use))| *last_use)
				.map(|(k, _)| k.clone())
			else {
				break;
			};
			self.entries.remove(&oldest);
		}
	}
}

impl ResponseCache {
	pub fn new(bucket: Strng, config: CacheConfig, redis: Option<RedisHandle>) -> Self {
		ResponseCache {
			config,
			entries: Mutex::new(LruMap::default()),
			redis,
			bucket,
		}
	}

	pub fn config(&self) -> &CacheConfig {
		&self.config
	}

	pub fn method_cacheable(&self, method: &http::Method) -> bool {
		self
			.config
			.methods
			.iter()
			.any(|m| m.eq_ignore_ascii_case(method.as_str()))
	}

	/// `sha256(method:host:path?sorted_query|sorted-key-headers)`, hex encoded.
	pub fn fingerprint(&self, req: &Request) -> String {
		let uri = req.uri();
		let sorted_query = uri
			.query()
			.map(|q| q.split('&').sorted().join("&"))
			.unwrap_or_default();
		let key_headers = self
			.config
			.key_headers
			.iter()
			.sorted()
			.filter_map(|name| {
				req
					.headers()
					.get(name.as_str())
					.and_then(|v| v.to_str().ok())
					.map(|v| format!("{name}={v}"))
			})
			.join(",");
		let input = format!(
			"{}:{}:{}?{}|{}",
			req.method(),
			uri.host().unwrap_or(""),
			uri.path(),
			sorted_query,
			key_headers
		);
		hex::encode(digest::digest(&digest::SHA256, input.as_bytes()))
	}

	pub async fn lookup(&self, fingerprint: &str, req: &Request) -> Option<Response> {
		let cached = match self.config.mode {
			StoreMode::Local => self.entries.lock().get(fingerprint, self.config.ttl),
			StoreMode::Distributed => self.lookup_distributed(fingerprint).await,
		}?;

		if self.config.conditional && not_modified(req, &cached) {
			let mut resp = ::http::Response::builder()
				.status(StatusCode::NOT_MODIFIED)
				.body(Body::empty())
				.expect("static response must build");
			resp
				.headers_mut()
				.insert(header::ETAG, etag_value(&cached.etag));
			return Some(resp);
		}
		Some(self.render(&cached))
	}

	async fn lookup_distributed(&self, fingerprint: &str) -> Option<Arc<CachedResponse>> {
		let redis = self.redis.as_ref()?;
		let key = format!("gw:cache:{}:{}", self.bucket, fingerprint);
		match redis.get_json::<CachedResponse>(&key).await {
			Ok(found) => found.map(Arc::new),
			Err(err) => {
				warn!(%err, "redis cache read failed");
				None
			},
		}
	}

	/// Admission: configured methods, 2xx status, body within `max_body_size`.
	pub fn admissible(&self, method: &http::Method, status: StatusCode, body_len: usize) -> bool {
		self.method_cacheable(method)
			&& status.is_success()
			&& body_len as u64 <= self.config.max_body_size
	}

	pub async fn store(
		&self,
		fingerprint: String,
		status: StatusCode,
		headers: &HeaderMap,
		body: Bytes,
	) {
		let etag = format!(
			"\"{}\"",
			&hex::encode(digest::digest(&digest::SHA256, &body))[..32]
		);
		let cached = CachedResponse {
			status: status.as_u16(),
			headers: headers
				.iter()
				.filter(|(name, _)| !is_hop_header(name.as_str()))
				.map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
				.collect(),
			body,
			stored_at_unix: std::time::SystemTime::now()
				.duration_since(std::time::UNIX_EPOCH)
				.map(|d| d.as_secs())
				.unwrap_or_default(),
			etag,
		};
		match self.config.mode {
			StoreMode::Local => {
				self
					.entries
					.lock()
					.insert(fingerprint, Arc::new(cached), self.config.max_size);
			},
			StoreMode::Distributed => {
				if let Some(redis) = &self.redis {
					let key = format!("gw:cache:{}:{}", self.bucket, fingerprint);
					if let Err(err) = redis.set_json(&key, &cached, self.config.ttl).await {
						warn!(%err, "redis cache store failed");
					}
				}
			},
		}
	}

	fn render(&self, cached: &CachedResponse) -> Response {
		let mut builder = ::http::Response::builder()
			.status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK));
		for (name, value) in &cached.headers {
			if let Ok(v) = HeaderValue::from_bytes(value) {
				builder = builder.header(name.as_str(), v);
			}
		}
		let mut resp = builder
			.body(Body::from(cached.body.clone()))
			.expect("cached response must rebuild");
		if self.config.conditional {
			resp
				.headers_mut()
				.insert(header::ETAG, etag_value(&cached.etag));
		}
		resp
			.headers_mut()
			.insert(x_headers::X_CACHE, HeaderValue::from_static("HIT"));
		resp
	}

	pub fn len(&self) -> usize {
		self.entries.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Evicts expired entries; run by the cache janitor.
	pub fn gc(&self) {
		let ttl = self.config.ttl;
		self
			.entries
			.lock()
			.entries
			.retain(|_, (_, stored, _)| stored.elapsed() < ttl);
	}
}

fn etag_value(etag: &str) -> HeaderValue {
	HeaderValue::try_from(etag).unwrap_or(HeaderValue::from_static("\"\""))
}

fn not_modified(req: &Request, cached: &CachedResponse) -> bool {
	if let Some(inm) = req
		.headers()
		.get(header::IF_NONE_MATCH)
		.and_then(|v| v.to_str().ok())
	{
		return inm
			.split(',')
			.any(|tag| tag.trim() == cached.etag || tag.trim() == "*");
	}
	if let Some(ims) = req
		.headers()
		.get(header::IF_MODIFIED_SINCE)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
	{
		return cached.stored_at_unix <= ims.timestamp().max(0) as u64;
	}
	false
}

fn is_hop_header(name: &str) -> bool {
	matches!(
		name,
		"connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "te" | "trailer"
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cache(max_size: usize) -> ResponseCache {
		ResponseCache::new(
			"default".into(),
			CacheConfig {
				max_size,
				conditional: true,
				..Default::default()
			},
			None,
		)
	}

	fn req(uri: &str) -> Request {
		::http::Request::builder()
			.uri(uri)
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn fingerprint_ignores_query_order() {
		let c = cache(16);
		let a = c.fingerprint(&req("http://h/p?a=1&b=2"));
		let b = c.fingerprint(&req("http://h/p?b=2&a=1"));
		assert_eq!(a, b);
		let other = c.fingerprint(&req("http://h/p?a=1&b=3"));
		assert_ne!(a, other);
	}

	#[test]
	fn fingerprint_includes_key_headers() {
		let c = ResponseCache::new(
			"default".into(),
			CacheConfig {
				key_headers: vec!["accept-language".into()],
				..Default::default()
			},
			None,
		);
		let en = ::http::Request::builder()
			.uri("http://h/p")
			.header("accept-language", "en")
			.body(Body::empty())
			.unwrap();
		let de = ::http::Request::builder()
			.uri("http://h/p")
			.header("accept-language", "de")
			.body(Body::empty())
			.unwrap();
		assert_ne!(c.fingerprint(&en), c.fingerprint(&de));
	}

	#[tokio::test]
	async fn store_then_lookup_is_byte_identical() {
		let c = cache(16);
		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
		let fp = c.fingerprint(&req("http://h/p"));
		c.store(
			fp.clone(),
			StatusCode::OK,
			&headers,
			Bytes::from_static(b"hello"),
		)
		.await;

		let resp = c.lookup(&fp, &req("http://h/p")).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
		assert_eq!(&body[..], b"hello");
	}

	#[tokio::test]
	async fn lru_evicts_oldest() {
		let c = cache(2);
		for i in 0..3 {
			let fp = c.fingerprint(&req(&format!("http://h/p{i}")));
			c.store(fp, StatusCode::OK, &HeaderMap::new(), Bytes::from_static(b"x"))
				.await;
		}
		assert_eq!(c.len(), 2);
		// The first entry was evicted.
		let fp0 = c.fingerprint(&req("http://h/p0"));
		assert!(c.lookup(&fp0, &req("http://h/p0")).await.is_none());
	}

	#[tokio::test]
	async fn conditional_returns_304_on_matching_etag() {
		let c = cache(4);
		let fp = c.fingerprint(&req("http://h/p"));
		c.store(
			fp.clone(),
			StatusCode::OK,
			&HeaderMap::new(),
			Bytes::from_static(b"hello"),
		)
		.await;
		let first = c.lookup(&fp, &req("http://h/p")).await.unwrap();
		let etag = first.headers().get(header::ETAG).unwrap().clone();

		let conditional = ::http::Request::builder()
			.uri("http://h/p")
			.header(header::IF_NONE_MATCH, etag)
			.body(Body::empty())
			.unwrap();
		let resp = c.lookup(&fp, &conditional).await.unwrap();
		assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
	}

	#[test]
	fn admission_rules() {
		let c = cache(4);
		assert!(c.admissible(&http::Method::GET, StatusCode::OK, 10));
		assert!(!c.admissible(&http::Method::POST, StatusCode::OK, 10));
		assert!(!c.admissible(&http::Method::GET, StatusCode::BAD_GATEWAY, 10));
		assert!(!c.admissible(&http::Method::GET, StatusCode::OK, 2 << 20));
	}
}
