use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::types::config::RedisConfig;
use crate::*;

/// Sliding-window admission as a Lua script so the trim/count/insert sequence is atomic on the
/// Redis side. KEYS[1] = window zset, ARGV = [now_micros, window_micros, limit].
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, now .. '-' .. math.random(1000000))
  redis.call('PEXPIRE', key, math.ceil(window / 1000))
  return 1
end
return 0
"#;

/// Thin wrapper over a shared connection manager. Callers decide fail-open/fail-closed;
/// this layer only reports errors.
#[derive(Clone)]
pub struct RedisHandle {
	manager: ConnectionManager,
	timeout: Duration,
	sliding_window: redis::Script,
}

impl Debug for RedisHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisHandle").finish()
	}
}

impl RedisHandle {
	pub async fn connect(config: &RedisConfig) -> anyhow::Result<RedisHandle> {
		let url = if config.address.starts_with("redis://") {
			config.address.clone()
		} else {
			format!("redis://{}", config.address)
		};
		let client = redis::Client::open(url)?;
		let manager = ConnectionManager::new(client).await?;
		Ok(RedisHandle {
			manager,
			timeout: config.timeout,
			sliding_window: redis::Script::new(SLIDING_WINDOW_SCRIPT),
		})
	}

	async fn with_timeout<T>(
		&self,
		fut: impl Future<Output = redis::RedisResult<T>>,
	) -> anyhow::Result<T> {
		tokio::time::timeout(self.timeout, fut)
			.await
			.context("redis call timed out")?
			.context("redis call failed")
	}

	/// Returns whether the request is admitted under `limit` per `window`.
	pub async fn sliding_window(
		&self,
		key: &str,
		limit: u64,
		window: Duration,
	) -> anyhow::Result<bool> {
		let now_micros = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_micros() as u64)
			.unwrap_or_default();
		let mut conn = self.manager.clone();
		let admitted: i64 = self
			.with_timeout(
				self
					.sliding_window
					.key(key)
					.arg(now_micros)
					.arg(window.as_micros() as u64)
					.arg(limit)
					.invoke_async(&mut conn),
			)
			.await?;
		Ok(admitted == 1)
	}

	pub async fn get_json<T: serde::de::DeserializeOwned>(
		&self,
		key: &str,
	) -> anyhow::Result<Option<T>> {
		let mut conn = self.manager.clone();
		let raw: Option<Vec<u8>> = self.with_timeout(conn.get(key)).await?;
		match raw {
			Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			None => Ok(None),
		}
	}

	pub async fn set_json<T: serde::Serialize>(
		&self,
		key: &str,
		value: &T,
		ttl: Duration,
	) -> anyhow::Result<()> {
		let bytes = serde_json::to_vec(value)?;
		let mut conn = self.manager.clone();
		let _: () = self
			.with_timeout(conn.set_ex(key, bytes, ttl.as_secs().max(1)))
			.await?;
		Ok(())
	}

	pub async fn set_flag(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
		let mut conn = self.manager.clone();
		let _: () = self
			.with_timeout(conn.set_ex(key, 1u8, ttl.as_secs().max(1)))
			.await?;
		Ok(())
	}

	pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
		let mut conn = self.manager.clone();
		let found: bool = self.with_timeout(conn.exists(key)).await?;
		Ok(found)
	}

	pub async fn del(&self, key: &str) -> anyhow::Result<()> {
		let mut conn = self.manager.clone();
		let _: () = self.with_timeout(conn.del(key)).await?;
		Ok(())
	}

	/// Shared counter for distributed circuit breakers; returns the post-increment value.
	pub async fn incr_window(&self, key: &str, window: Duration) -> anyhow::Result<u64> {
		let mut conn = self.manager.clone();
		let value: u64 = self.with_timeout(conn.incr(key, 1u64)).await?;
		if value == 1 {
			let mut conn = self.manager.clone();
			let _: () = self
				.with_timeout(conn.expire(key, window.as_secs().max(1) as i64))
				.await?;
		}
		Ok(value)
	}
}
