use parking_lot::Mutex;

use crate::client::redis::RedisHandle;
use crate::proxy::ProxyError;
use crate::types::config::StoreMode;
use crate::types::features::CircuitBreakerConfig;
use crate::*;

/// Per-route circuit breaker.
///
/// Closed admits everything and counts consecutive failures; Open rejects fast until `timeout`
/// elapses; HalfOpen admits up to `max_requests` concurrent probes. All probes succeeding
/// closes the circuit; any probe failure reopens it.
pub struct CircuitBreaker {
	config: CircuitBreakerConfig,
	state: Mutex<BreakerState>,
	/// Distributed mode shares failure counts under `gw:cb:{route}`; a sibling's failures
	/// count towards this instance's threshold.
	shared: Option<(RedisHandle, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
	current: State,
	consecutive_failures: u32,
	opened_at: Option<Instant>,
	half_open_in_flight: u32,
	half_open_successes: u32,
}

/// Held by the caller for the duration of the upstream attempt; report the outcome through it.
#[must_use]
pub struct Permit {
	breaker: Arc<CircuitBreaker>,
	probe: bool,
}

impl CircuitBreaker {
	pub fn new(config: CircuitBreakerConfig) -> Self {
		Self::with_redis("".into(), config, None)
	}

	pub fn with_redis(route: Strng, config: CircuitBreakerConfig, redis: Option<RedisHandle>) -> Self {
		let shared = match (config.mode, redis) {
			(StoreMode::Distributed, Some(redis)) => Some((redis, format!("gw:cb:{route}"))),
			_ => None,
		};
		CircuitBreaker {
			config,
			state: Mutex::new(BreakerState {
				current: State::Closed,
				consecutive_failures: 0,
				opened_at: None,
				half_open_in_flight: 0,
				half_open_successes: 0,
			}),
			shared,
		}
	}

	pub fn state(&self) -> State {
		self.state.lock().current
	}

	/// Admits the request or rejects fast with the circuit-open error.
	pub fn acquire(self: &Arc<Self>) -> Result<Permit, ProxyError> {
		let mut s = self.state.lock();
		match s.current {
			State::Closed => Ok(Permit {
				breaker: self.clone(),
				probe: false,
			}),
			State::Open => {
				let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or_default();
				if elapsed >= self.config.timeout {
					s.current = State::HalfOpen;
					s.half_open_in_flight = 1;
					s.half_open_successes = 0;
					debug!("circuit breaker half-open, admitting probe");
					Ok(Permit {
						breaker: self.clone(),
						probe: true,
					})
				} else {
					Err(ProxyError::CircuitOpen {
						retry_after: self.config.timeout - elapsed,
					})
				}
			},
			State::HalfOpen => {
				if s.half_open_in_flight < self.config.max_requests {
					s.half_open_in_flight += 1;
					Ok(Permit {
						breaker: self.clone(),
						probe: true,
					})
				} else {
					Err(ProxyError::CircuitOpen {
						retry_after: self.config.timeout,
					})
				}
			},
		}
	}

	fn record_success(&self, probe: bool) {
		let mut s = self.state.lock();
		match s.current {
			State::Closed => s.consecutive_failures = 0,
			State::HalfOpen if probe => {
				s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
				s.half_open_successes += 1;
				if s.half_open_in_flight == 0 {
					info!("circuit breaker closed after successful probes");
					s.current = State::Closed;
					s.consecutive_failures = 0;
					s.opened_at = None;
				}
			},
			_ => {},
		}
	}

	fn record_failure(self: &Arc<Self>, probe: bool) {
		let mut s = self.state.lock();
		match s.current {
			State::Closed => {
				s.consecutive_failures += 1;
				if s.consecutive_failures >= self.config.failure_threshold {
					warn!(
						failures = s.consecutive_failures,
						"circuit breaker opened"
					);
					s.current = State::Open;
					s.opened_at = Some(Instant::now());
				} else if let Some((redis, key)) = &self.shared {
					// Share the failure; a sibling-heavy count opens this instance too.
					let redis = redis.clone();
					let key = key.clone();
					let breaker = self.clone();
					let window = self.config.timeout;
					let threshold = self.config.failure_threshold as u64;
					tokio::spawn(async move {
						match redis.incr_window(&key, window).await {
							Ok(total) if total >= threshold => breaker.force_open(),
							Ok(_) => {},
							Err(err) => warn!(%err, "redis breaker count failed"),
						}
					});
				}
			},
			State::HalfOpen if probe => {
				warn!("circuit breaker probe failed, reopening");
				s.current = State::Open;
				s.opened_at = Some(Instant::now());
				s.half_open_in_flight = 0;
			},
			_ => {},
		}
	}
}

impl CircuitBreaker {
	fn force_open(self: &Arc<Self>) {
		let mut s = self.state.lock();
		if s.current == State::Closed {
			warn!("circuit breaker opened from shared failure count");
			s.current = State::Open;
			s.opened_at = Some(Instant::now());
		}
	}
}

impl Permit {
	/// A failure is a backend 5xx, dial error, or per-try timeout.
	pub fn record(self, success: bool) {
		if success {
			self.breaker.record_success(self.probe);
		} else {
			self.breaker.record_failure(self.probe);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn breaker(threshold: u32, timeout: Duration) -> Arc<CircuitBreaker> {
		Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: threshold,
			timeout,
			max_requests: 1,
			mode: Default::default(),
		}))
	}

	#[test]
	fn opens_after_consecutive_failures() {
		let cb = breaker(3, Duration::from_secs(1));
		for _ in 0..3 {
			cb.acquire().unwrap().record(false);
		}
		assert_eq!(cb.state(), State::Open);
		assert!(matches!(
			cb.acquire().unwrap_err(),
			ProxyError::CircuitOpen { .. }
		));
	}

	#[test]
	fn success_resets_failure_count() {
		let cb = breaker(3, Duration::from_secs(1));
		cb.acquire().unwrap().record(false);
		cb.acquire().unwrap().record(false);
		cb.acquire().unwrap().record(true);
		cb.acquire().unwrap().record(false);
		assert_eq!(cb.state(), State::Closed);
	}

	#[test]
	fn probe_after_timeout_then_close() {
		let cb = breaker(1, Duration::from_millis(10));
		cb.acquire().unwrap().record(false);
		assert_eq!(cb.state(), State::Open);
		std::thread::sleep(Duration::from_millis(20));
		let probe = cb.acquire().unwrap();
		assert_eq!(cb.state(), State::HalfOpen);
		probe.record(true);
		assert_eq!(cb.state(), State::Closed);
	}

	#[test]
	fn probe_failure_reopens() {
		let cb = breaker(1, Duration::from_millis(10));
		cb.acquire().unwrap().record(false);
		std::thread::sleep(Duration::from_millis(20));
		cb.acquire().unwrap().record(false);
		assert_eq!(cb.state(), State::Open);
	}

	#[test]
	fn half_open_limits_concurrent_probes() {
		let cb = breaker(1, Duration::from_millis(10));
		cb.acquire().unwrap().record(false);
		std::thread::sleep(Duration::from_millis(20));
		let _probe = cb.acquire().unwrap();
		assert!(cb.acquire().is_err());
	}
}
