use std::collections::HashMap;

use parking_lot::Mutex;

use crate::client::redis::RedisHandle;
use crate::expr::{RequestContext, extract_key};
use crate::http::Request;
use crate::proxy::ProxyError;
use crate::types::config::StoreMode;
use crate::types::features::{RateLimitAlgorithm, RateLimitConfig, SpikeArrestConfig, TierLimit};
use crate::*;

/// Per-route rate limiter, sharded by key. Token-bucket state advances tokens by
/// `elapsed * rate / period` capped at `burst`; sliding-window keeps a ring of admit
/// timestamps. Distributed mode always uses sliding-window semantics through Redis.
pub struct RateLimiter {
	route: Strng,
	config: RateLimitConfig,
	global_tiers: HashMap<Strng, TierLimit>,
	shards: Mutex<HashMap<String, KeyState>>,
	redis: Option<RedisHandle>,
}

#[derive(Debug)]
enum KeyState {
	Bucket { tokens: f64, last_refill: Instant },
	Window { hits: std::collections::VecDeque<Instant> },
}

impl std::fmt::Debug for RateLimiter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RateLimiter").field("route", &self.route).finish()
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
	Allow,
	/// Rejected; retry after the hinted duration.
	Reject { limit: u64, retry_after: Duration },
}

pub(crate) struct Limits {
	rate: u64,
	period: Duration,
	burst: u64,
}

impl RateLimiter {
	pub fn new(
		route: Strng,
		config: RateLimitConfig,
		global_tiers: HashMap<Strng, TierLimit>,
		redis: Option<RedisHandle>,
	) -> Self {
		RateLimiter {
			route,
			config,
			global_tiers,
			shards: Mutex::new(HashMap::new()),
			redis,
		}
	}

	pub async fn check(
		&self,
		ctx: &mut RequestContext,
		req: &Request,
	) -> Result<(), ProxyError> {
		let key = extract_key(&self.config.key, ctx, req).unwrap_or_else(|| "anonymous".to_string());
		let limits = self.limits_for(ctx, req);

		if self.config.mode == StoreMode::Distributed {
			return self.check_distributed(&key, &limits).await;
		}

		match self.admit(&key, &limits) {
			Decision::Allow => Ok(()),
			Decision::Reject { limit, retry_after } => {
				// Throttle: queue up to max_wait instead of rejecting outright.
				if let Some(max_wait) = self.config.max_wait
					&& retry_after <= max_wait
				{
					tokio::time::sleep(retry_after).await;
					if self.admit(&key, &limits) == Decision::Allow {
						return Ok(());
					}
				}
				Err(ProxyError::RateLimitExceeded {
					limit,
					remaining: 0,
					reset_seconds: retry_after.as_secs().max(1),
				})
			},
		}
	}

	/// Tiered limits look the tier up via `tier_key`, falling back to `default_tier`.
	fn limits_for(&self, ctx: &mut RequestContext, req: &Request) -> Limits {
		let base = Limits {
			rate: self.config.rate,
			period: self.config.period,
			burst: self.config.burst.max(self.config.rate),
		};
		let Some(tier_key) = &self.config.tier_key else {
			return base;
		};
		let tier_name = extract_key(tier_key, ctx, req)
			.map(Strng::from)
			.or_else(|| self.config.default_tier.clone());
		let Some(tier_name) = tier_name else {
			return base;
		};
		let tier = self
			.config
			.tiers
			.get(&tier_name)
			.or_else(|| self.global_tiers.get(&tier_name));
		match tier {
			Some(t) => Limits {
				rate: t.rate,
				period: t.period.unwrap_or(self.config.period),
				burst: t.burst.unwrap_or(t.rate).max(t.rate),
			},
			None => base,
		}
	}

	fn admit(&self, key: &str, limits: &Limits) -> Decision {
		let now = Instant::now();
		let mut shards = self.shards.lock();
		match self.config.algorithm {
			RateLimitAlgorithm::TokenBucket => {
				let state = shards.entry(key.to_string()).or_insert(KeyState::Bucket {
					tokens: limits.burst as f64,
					last_refill: now,
				});
				let KeyState::Bucket { tokens, last_refill } = state else {
					*state = KeyState::Bucket {
						tokens: limits.burst as f64,
						last_refill: now,
					};
					return Decision::Allow;
				};
				let rate_per_second = limits.rate as f64 / limits.period.as_secs_f64();
				*tokens = (*tokens + now.duration_since(*last_refill).as_secs_f64() * rate_per_second)
					.min(limits.burst as f64);
				*last_refill = now;
				if *tokens >= 1.0 {
					*tokens -= 1.0;
					Decision::Allow
				} else {
					let deficit = 1.0 - *tokens;
					Decision::Reject {
						limit: limits.burst,
						retry_after: Duration::from_secs_f64(deficit / rate_per_second),
					}
				}
			},
			RateLimitAlgorithm::SlidingWindow => {
				let state = shards.entry(key.to_string()).or_insert(KeyState::Window {
					hits: Default::default(),
				});
				let KeyState::Window { hits } = state else {
					*state = KeyState::Window {
						hits: Default::default(),
					};
					return Decision::Allow;
				};
				while hits
					.front()
					.is_some_and(|t| now.duration_since(*t) >= limits.period)
				{
					hits.pop_front();
				}
				if (hits.len() as u64) < limits.rate {
					hits.push_back(now);
					Decision::Allow
				} else {
					let retry_after = hits
						.front()
						.map(|t| limits.period.saturating_sub(now.duration_since(*t)))
						.unwrap_or(limits.period);
					Decision::Reject {
						limit: limits.rate,
						retry_after,
					}
				}
			},
		}
	}

	async fn check_distributed(&self, key: &str, limits: &Limits) -> Result<(), ProxyError> {
		let Some(redis) = &self.redis else {
			// Validator guarantees redis for distributed mode; a missing handle means the
			// connection was never established. Advisory reads fail open.
			warn!(route = %self.route, "distributed rate limit without redis connection, failing open");
			return Ok(());
		};
		let redis_key = format!("gw:rl:route:{}:{}", self.route, key);
		match redis
			.sliding_window(&redis_key, limits.rate, limits.period)
			.await
		{
			Ok(true) => Ok(()),
			Ok(false) => Err(ProxyError::RateLimitExceeded {
				limit: limits.rate,
				remaining: 0,
				reset_seconds: limits.period.as_secs().max(1),
			}),
			Err(err) => {
				warn!(route = %self.route, %err, "redis rate limit check failed, failing open");
				Ok(())
			},
		}
	}

	/// Drops idle key shards; run periodically by the limiter janitor.
	pub fn gc(&self, idle_for: Duration) {
		let now = Instant::now();
		self.shards.lock().retain(|_, state| match state {
			KeyState::Bucket { last_refill, .. } => now.duration_since(*last_refill) < idle_for,
			KeyState::Window { hits } => hits
				.back()
				.is_some_and(|t| now.duration_since(*t) < idle_for),
		});
	}
}

/// Spike arrester: enforces a minimum gap of `period / rate` between requests per key,
/// smoothing bursts that a token bucket would admit.
pub struct SpikeArrester {
	config: SpikeArrestConfig,
	last_admit: Mutex<HashMap<String, Instant>>,
}

impl SpikeArrester {
	pub fn new(config: SpikeArrestConfig) -> Self {
		SpikeArrester {
			config,
			last_admit: Mutex::new(HashMap::new()),
		}
	}

	pub fn check(&self, ctx: &mut RequestContext, req: &Request) -> Result<(), ProxyError> {
		let key = extract_key(&self.config.key, ctx, req).unwrap_or_else(|| "anonymous".to_string());
		let gap = self.config.period.div_f64(self.config.rate.max(1) as f64);
		let now = Instant::now();
		let mut last = self.last_admit.lock();
		match last.get(&key) {
			Some(prev) if now.duration_since(*prev) < gap => {
				let wait = gap - now.duration_since(*prev);
				Err(ProxyError::RateLimitExceeded {
					limit: self.config.rate,
					remaining: 0,
					reset_seconds: wait.as_secs().max(1),
				})
			},
			_ => {
				last.insert(key, now);
				Ok(())
			},
		}
	}

	pub fn gc(&self, idle_for: Duration) {
		let now = Instant::now();
		self
			.last_admit
			.lock()
			.retain(|_, t| now.duration_since(*t) < idle_for);
	}
}
