use std::collections::HashMap;

use parking_lot::Mutex;

use crate::client::redis::RedisHandle;
use crate::expr::RequestContext;
use crate::http::{BufferedResponse, Request};
use crate::proxy::ProxyError;
use crate::types::config::StoreMode;
use crate::types::features::{IdempotencyConfig, IdempotencyScope};
use crate::*;

/// Replays stored responses for mutating requests carrying an idempotency key. The first
/// request with a key stores its fully buffered response; repeats replay it until TTL expiry.
pub struct IdempotencyStore {
	config: IdempotencyConfig,
	entries: Mutex<HashMap<String, StoredEntry>>,
	redis: Option<RedisHandle>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredEnvelope {
	status: u16,
	headers: Vec<(String, Vec<u8>)>,
	body: Bytes,
}

struct StoredEntry {
	envelope: StoredEnvelope,
	stored_at: Instant,
}

impl IdempotencyStore {
	pub fn new(config: IdempotencyConfig, redis: Option<RedisHandle>) -> Self {
		IdempotencyStore {
			config,
			entries: Mutex::new(HashMap::new()),
			redis,
		}
	}

	pub fn config(&self) -> &IdempotencyConfig {
		&self.config
	}

	pub fn method_applies(&self, method: &http::Method) -> bool {
		self
			.config
			.methods
			.iter()
			.any(|m| m.eq_ignore_ascii_case(method.as_str()))
	}

	/// Extracts the idempotency key; `Enforce` rejects mutating requests without one (422).
	pub fn extract_key(
		&self,
		ctx: &RequestContext,
		req: &Request,
	) -> Result<Option<String>, ProxyError> {
		let header = req
			.headers()
			.get(self.config.header_name.as_str())
			.and_then(|v| v.to_str().ok());
		match header {
			Some(key) if !key.is_empty() => {
				let scope = match self.config.scope {
					IdempotencyScope::Global => "global".to_string(),
					IdempotencyScope::Client => ctx
						.client_id()
						.map(|c| c.to_string())
						.unwrap_or_else(|| ctx.client_ip.to_string()),
				};
				Ok(Some(format!("{scope}:{key}")))
			},
			_ if self.config.enforce => Err(ProxyError::Rejected {
				status: http::StatusCode::UNPROCESSABLE_ENTITY,
				message: format!("missing {} header", self.config.header_name),
			}),
			_ => Ok(None),
		}
	}

	pub async fn lookup(&self, key: &str) -> Option<BufferedResponse> {
		match self.config.mode {
			StoreMode::Local => {
				let mut entries = self.entries.lock();
				let entry = entries.get(key)?;
				if entry.stored_at.elapsed() >= self.config.ttl {
					entries.remove(key);
					return None;
				}
				Some(render(&entry.envelope))
			},
			StoreMode::Distributed => {
				let redis = self.redis.as_ref()?;
				match redis
					.get_json::<StoredEnvelope>(&redis_key(key))
					.await
				{
					Ok(found) => found.map(|e| render(&e)),
					Err(err) => {
						error!(%err, "redis idempotency read failed");
						None
					},
				}
			},
		}
	}

	/// Distributed lookups that must fail closed: a Redis outage rejects rather than risking a
	/// duplicate side effect.
	pub async fn strict_lookup(&self, key: &str) -> Result<Option<BufferedResponse>, ProxyError> {
		if self.config.mode == StoreMode::Local {
			return Ok(self.lookup(key).await);
		}
		let Some(redis) = self.redis.as_ref() else {
			return Err(ProxyError::DependencyUnavailable("redis".to_string()));
		};
		match redis.get_json::<StoredEnvelope>(&redis_key(key)).await {
			Ok(found) => Ok(found.map(|e| render(&e))),
			Err(err) => {
				error!(%err, "redis idempotency read failed, failing closed");
				Err(ProxyError::DependencyUnavailable("redis".to_string()))
			},
		}
	}

	pub async fn store(&self, key: String, resp: &BufferedResponse) {
		if resp.body.len() as u64 > self.config.max_body_size {
			return;
		}
		let envelope = StoredEnvelope {
			status: resp.status.as_u16(),
			headers: resp
				.headers
				.iter()
				.map(|(n, v)| (n.to_string(), v.as_bytes().to_vec()))
				.collect(),
			body: resp.body.clone(),
		};
		match self.config.mode {
			StoreMode::Local => {
				self.entries.lock().insert(
					key,
					StoredEntry {
						envelope,
						stored_at: Instant::now(),
					},
				);
			},
			StoreMode::Distributed => {
				if let Some(redis) = &self.redis
					&& let Err(err) = redis
						.set_json(&redis_key(&key), &envelope, self.config.ttl)
						.await
				{
					warn!(%err, "redis idempotency store failed");
				}
			},
		}
	}

	pub fn gc(&self) {
		let ttl = self.config.ttl;
		self
			.entries
			.lock()
			.retain(|_, e| e.stored_at.elapsed() < ttl);
	}
}

fn redis_key(key: &str) -> String {
	format!("gw:idem:{key}")
}

fn render(envelope: &StoredEnvelope) -> BufferedResponse {
	let mut headers = http::HeaderMap::new();
	for (name, value) in &envelope.headers {
		if let (Ok(n), Ok(v)) = (
			http::HeaderName::try_from(name.as_str()),
			http::HeaderValue::from_bytes(value),
		) {
			headers.insert(n, v);
		}
	}
	BufferedResponse {
		status: http::StatusCode::from_u16(envelope.status).unwrap_or(http::StatusCode::OK),
		headers,
		body: envelope.body.clone(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::{Body, HeaderMap, StatusCode};

	fn store(enforce: bool) -> IdempotencyStore {
		IdempotencyStore::new(
			IdempotencyConfig {
				enforce,
				..Default::default()
			},
			None,
		)
	}

	fn ctx() -> RequestContext {
		RequestContext::new("1.2.3.4:1".parse().unwrap(), ::http::Version::HTTP_11)
	}

	fn req_with_key(key: Option<&str>) -> Request {
		let mut b = ::http::Request::builder().method("POST").uri("/");
		if let Some(k) = key {
			b = b.header("Idempotency-Key", k);
		}
		b.body(Body::empty()).unwrap()
	}

	#[tokio::test]
	async fn replays_stored_response() {
		let s = store(false);
		let key = s
			.extract_key(&ctx(), &req_with_key(Some("abc")))
			.unwrap()
			.unwrap();
		assert!(s.lookup(&key).await.is_none());
		s.store(
			key.clone(),
			&BufferedResponse {
				status: StatusCode::CREATED,
				headers: HeaderMap::new(),
				body: Bytes::from_static(b"{\"id\":1}"),
			},
		)
		.await;
		let replay = s.lookup(&key).await.unwrap();
		assert_eq!(replay.status, StatusCode::CREATED);
		assert_eq!(&replay.body[..], b"{\"id\":1}");
	}

	#[test]
	fn enforce_rejects_missing_header_with_422() {
		let s = store(true);
		let err = s.extract_key(&ctx(), &req_with_key(None)).unwrap_err();
		match err {
			ProxyError::Rejected { status, .. } => {
				assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY)
			},
			other => panic!("unexpected: {other}"),
		}
	}

	#[test]
	fn keys_are_scoped_per_client() {
		let s = store(false);
		let mut a = ctx();
		a.identity = Some(crate::expr::Identity {
			client_id: "alice".into(),
			auth_type: crate::expr::AuthType::ApiKey,
			claims: Default::default(),
		});
		let mut b = ctx();
		b.identity = Some(crate::expr::Identity {
			client_id: "bob".into(),
			auth_type: crate::expr::AuthType::ApiKey,
			claims: Default::default(),
		});
		let ka = s.extract_key(&a, &req_with_key(Some("k"))).unwrap().unwrap();
		let kb = s.extract_key(&b, &req_with_key(Some("k"))).unwrap().unwrap();
		assert_ne!(ka, kb);
	}

	#[tokio::test]
	async fn oversized_bodies_are_not_stored() {
		let s = IdempotencyStore::new(
			IdempotencyConfig {
				max_body_size: 4,
				..Default::default()
			},
			None,
		);
		s.store(
			"k".to_string(),
			&BufferedResponse {
				status: StatusCode::OK,
				headers: HeaderMap::new(),
				body: Bytes::from_static(b"too large"),
			},
		)
		.await;
		assert!(s.lookup("k").await.is_none());
	}
}
