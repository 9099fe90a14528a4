use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::http::{Method, StatusCode};
use crate::types::features::{RetryBudgetConfig, RetryPolicyConfig};
use crate::*;

/// Compiled retry policy. Backoff grows geometrically from `initial_backoff` by
/// `backoff_multiplier`, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct Policy {
	pub max_retries: u32,
	pub initial_backoff: Duration,
	pub backoff_multiplier: f64,
	pub max_backoff: Duration,
	pub codes: Vec<StatusCode>,
	pub methods: Vec<Method>,
	pub per_try_timeout: Option<Duration>,
	pub hedging: Option<Hedging>,
}

#[derive(Debug, Clone)]
pub struct Hedging {
	pub max_requests: u32,
	pub delay: Duration,
}

impl Policy {
	pub fn compile(config: &RetryPolicyConfig) -> anyhow::Result<Policy> {
		Ok(Policy {
			max_retries: config.max_retries,
			initial_backoff: config.initial_backoff,
			backoff_multiplier: config.backoff_multiplier,
			max_backoff: config.max_backoff,
			codes: config
				.retryable_statuses
				.iter()
				.map(|s| StatusCode::from_u16(*s))
				.collect::<Result<_, _>>()?,
			methods: config
				.retryable_methods
				.iter()
				.map(|m| Method::from_bytes(m.as_bytes()))
				.collect::<Result<_, _>>()?,
			per_try_timeout: config.per_try_timeout,
			hedging: config.hedging.as_ref().map(|h| Hedging {
				max_requests: h.max_requests,
				delay: h.delay,
			}),
		})
	}

	pub fn method_retryable(&self, method: &Method) -> bool {
		self.methods.is_empty() || self.methods.contains(method)
	}

	pub fn status_retryable(&self, status: StatusCode) -> bool {
		self.codes.contains(&status)
	}

	pub fn backoff(&self, attempt: u32) -> Duration {
		let mult = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
		let backoff = self.initial_backoff.mul_f64(mult);
		backoff.min(self.max_backoff)
	}
}

/// Sliding `{total_requests, retries}` counters over a window; shared across every route that
/// names the pool. A retry is admitted iff `retries + 1 <= max(min_retries, ratio * total)`.
pub struct RetryBudget {
	config: RetryBudgetConfig,
	samples: Mutex<Samples>,
}

#[derive(Default)]
struct Samples {
	requests: VecDeque<Instant>,
	retries: VecDeque<Instant>,
}

impl RetryBudget {
	pub fn new(config: RetryBudgetConfig) -> Self {
		RetryBudget {
			config,
			samples: Mutex::new(Samples::default()),
		}
	}

	/// Every request (including the first try) is recorded here.
	pub fn record_request(&self) {
		let mut s = self.samples.lock();
		let now = Instant::now();
		trim(&mut s.requests, now, self.config.window);
		s.requests.push_back(now);
	}

	/// Admits and records a retry atomically.
	pub fn try_admit_retry(&self) -> bool {
		let mut s = self.samples.lock();
		let now = Instant::now();
		trim(&mut s.requests, now, self.config.window);
		trim(&mut s.retries, now, self.config.window);
		let total = s.requests.len() as f64;
		let allowed = (self.config.ratio * total).max(self.config.min_retries as f64);
		if (s.retries.len() as u64) + 1 <= allowed as u64 {
			s.retries.push_back(now);
			true
		} else {
			false
		}
	}

	/// Trims expired samples; run by the janitor every window/10.
	pub fn gc(&self) {
		let mut s = self.samples.lock();
		let now = Instant::now();
		trim(&mut s.requests, now, self.config.window);
		trim(&mut s.retries, now, self.config.window);
	}

	pub fn snapshot(&self) -> (usize, usize) {
		let s = self.samples.lock();
		(s.requests.len(), s.retries.len())
	}
}

fn trim(q: &mut VecDeque<Instant>, now: Instant, window: Duration) {
	while q.front().is_some_and(|t| now.duration_since(*t) >= window) {
		q.pop_front();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn budget(ratio: f64, min_retries: u64) -> RetryBudget {
		RetryBudget::new(RetryBudgetConfig {
			ratio,
			min_retries,
			window: Duration::from_secs(10),
		})
	}

	#[test]
	fn min_retries_always_admitted() {
		let b = budget(0.0, 3);
		assert!(b.try_admit_retry());
		assert!(b.try_admit_retry());
		assert!(b.try_admit_retry());
		assert!(!b.try_admit_retry());
	}

	#[test]
	fn ratio_scales_with_request_volume() {
		let b = budget(0.1, 1);
		for _ in 0..100 {
			b.record_request();
		}
		let mut admitted = 0;
		while b.try_admit_retry() {
			admitted += 1;
			assert!(admitted < 1000, "budget failed to converge");
		}
		// 10% of 100 requests
		assert_eq!(admitted, 10);
	}

	#[test]
	fn budget_invariant_holds() {
		let b = budget(0.25, 2);
		for total in 0..50u64 {
			b.record_request();
			while b.try_admit_retry() {}
			let (requests, retries) = b.snapshot();
			let allowed = ((requests as f64) * 0.25).max(2.0) as usize;
			assert!(retries <= allowed, "retries {retries} > allowed {allowed} at total {total}");
		}
	}

	#[test]
	fn backoff_grows_and_caps() {
		let p = Policy::compile(&RetryPolicyConfig {
			max_retries: 5,
			initial_backoff: Duration::from_millis(100),
			backoff_multiplier: 2.0,
			max_backoff: Duration::from_millis(500),
			..Default::default()
		})
		.unwrap();
		assert_eq!(p.backoff(1), Duration::from_millis(100));
		assert_eq!(p.backoff(2), Duration::from_millis(200));
		assert_eq!(p.backoff(3), Duration::from_millis(400));
		assert_eq!(p.backoff(4), Duration::from_millis(500));
	}

	#[test]
	fn retryable_matchers() {
		let p = Policy::compile(&RetryPolicyConfig::default()).unwrap();
		assert!(p.method_retryable(&Method::GET));
		assert!(!p.method_retryable(&Method::POST));
		assert!(p.status_retryable(StatusCode::BAD_GATEWAY));
		assert!(!p.status_retryable(StatusCode::OK));
	}
}
