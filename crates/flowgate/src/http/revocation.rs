use std::collections::HashMap;

use parking_lot::RwLock;
use ring::digest;

use crate::client::redis::RedisHandle;
use crate::http::Request;
use crate::proxy::ProxyError;
use crate::types::config::{RevocationConfig, StoreMode};
use crate::*;

/// Revoked-token store consulted on every bearer-token request. Keys are the token's `jti`
/// claim, or the first 32 hex chars of `SHA256(token)` when no `jti` is present. Distributed
/// failures fail open so a Redis outage never locks out all users.
pub struct RevocationStore {
	config: RevocationConfig,
	local: RwLock<HashMap<String, Instant>>,
	redis: Option<RedisHandle>,
}

impl RevocationStore {
	pub fn new(config: RevocationConfig, redis: Option<RedisHandle>) -> Self {
		RevocationStore {
			config,
			local: RwLock::new(HashMap::new()),
			redis,
		}
	}

	/// The revocation key for a raw bearer token and its (optionally parsed) claims.
	pub fn token_key(token: &str, jti: Option<&str>) -> String {
		match jti {
			Some(jti) if !jti.is_empty() => jti.to_string(),
			_ => hex::encode(digest::digest(&digest::SHA256, token.as_bytes()))[..32].to_string(),
		}
	}

	/// TTL = min(configured default, remaining token lifetime).
	pub fn effective_ttl(&self, exp_unix: Option<u64>) -> Duration {
		let default = self.config.default_ttl;
		let Some(exp) = exp_unix else {
			return default;
		};
		let now = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or_default();
		let remaining = Duration::from_secs(exp.saturating_sub(now));
		default.min(remaining)
	}

	pub async fn revoke(&self, key: String, ttl: Duration) {
		match self.config.mode {
			StoreMode::Local => {
				self.local.write().insert(key, Instant::now() + ttl);
			},
			StoreMode::Distributed => {
				if let Some(redis) = &self.redis {
					if let Err(err) = redis.set_flag(&redis_key(&key), ttl).await {
						warn!(%err, "redis revoke write failed");
					}
				}
				// Keep a local copy so this instance enforces immediately either way.
				self.local.write().insert(key, Instant::now() + ttl);
			},
		}
	}

	pub async fn unrevoke(&self, key: &str) {
		self.local.write().remove(key);
		if self.config.mode == StoreMode::Distributed
			&& let Some(redis) = &self.redis
			&& let Err(err) = redis.del(&redis_key(key)).await
		{
			warn!(%err, "redis revoke delete failed");
		}
	}

	pub async fn is_revoked(&self, key: &str) -> bool {
		{
			let local = self.local.read();
			if let Some(expiry) = local.get(key)
				&& *expiry > Instant::now()
			{
				return true;
			}
		}
		if self.config.mode == StoreMode::Distributed
			&& let Some(redis) = &self.redis
		{
			match redis.exists(&redis_key(key)).await {
				Ok(found) => return found,
				Err(err) => {
					// Fail open: never report "revoked" because the store is unreachable.
					warn!(%err, "redis revocation check failed, failing open");
					return false;
				},
			}
		}
		false
	}

	/// Checks the request's bearer token, if any. Claims parsed earlier are consulted for jti.
	pub async fn check_request(
		&self,
		token: Option<&str>,
		jti: Option<&str>,
	) -> Result<(), ProxyError> {
		let Some(token) = token else {
			return Ok(());
		};
		let key = Self::token_key(token, jti);
		if self.is_revoked(&key).await {
			return Err(ProxyError::Rejected {
				status: http::StatusCode::UNAUTHORIZED,
				message: "Token has been revoked".to_string(),
			});
		}
		Ok(())
	}

	pub fn snapshot(&self) -> Vec<(String, u64)> {
		let now = Instant::now();
		self
			.local
			.read()
			.iter()
			.filter(|(_, expiry)| **expiry > now)
			.map(|(k, expiry)| (k.clone(), expiry.duration_since(now).as_secs()))
			.collect()
	}

	pub fn gc(&self) {
		let now = Instant::now();
		self.local.write().retain(|_, expiry| *expiry > now);
	}
}

fn redis_key(key: &str) -> String {
	format!("gw:revoked:{key}")
}
