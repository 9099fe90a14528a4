use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::proxy::ProxyError;
use crate::types::config::LoadSheddingConfig;
use crate::*;

/// Load shedder: a hard concurrency cap plus an optional AIMD limit driven by observed
/// latency. When the adaptive limit is enabled, each completion above `latency_target`
/// multiplicatively decreases the limit; completions under target additively raise it.
pub struct LoadShedder {
	config: LoadSheddingConfig,
	in_flight: AtomicU64,
	shed_total: AtomicU64,
	adaptive: Mutex<AdaptiveState>,
}

struct AdaptiveState {
	limit: f64,
}

/// Decrements the in-flight gauge when the request completes.
#[must_use]
pub struct InFlightGuard<'a> {
	shedder: &'a LoadShedder,
}

impl LoadShedder {
	pub fn new(config: LoadSheddingConfig) -> Self {
		let initial = if config.max_concurrency > 0 {
			config.max_concurrency as f64
		} else {
			1024.0
		};
		LoadShedder {
			config,
			in_flight: AtomicU64::new(0),
			shed_total: AtomicU64::new(0),
			adaptive: Mutex::new(AdaptiveState { limit: initial }),
		}
	}

	pub fn admit(&self) -> Result<InFlightGuard<'_>, ProxyError> {
		if !self.config.enabled {
			self.in_flight.fetch_add(1, Ordering::Relaxed);
			return Ok(InFlightGuard { shedder: self });
		}
		let current = self.in_flight.load(Ordering::Relaxed);
		if self.config.max_concurrency > 0 && current >= self.config.max_concurrency {
			self.shed_total.fetch_add(1, Ordering::Relaxed);
			return Err(ProxyError::Overloaded);
		}
		if self.config.adaptive {
			let limit = self.adaptive.lock().limit;
			if (current as f64) >= limit {
				self.shed_total.fetch_add(1, Ordering::Relaxed);
				return Err(ProxyError::Overloaded);
			}
		}
		self.in_flight.fetch_add(1, Ordering::Relaxed);
		Ok(InFlightGuard { shedder: self })
	}

	pub fn observe_latency(&self, latency: Duration) {
		if !self.config.enabled || !self.config.adaptive {
			return;
		}
		let mut state = self.adaptive.lock();
		if latency > self.config.latency_target {
			state.limit = (state.limit * 0.9).max(self.config.min_limit as f64);
		} else {
			state.limit += 1.0;
			if self.config.max_concurrency > 0 {
				state.limit = state.limit.min(self.config.max_concurrency as f64);
			}
		}
	}

	pub fn in_flight(&self) -> u64 {
		self.in_flight.load(Ordering::Relaxed)
	}

	pub fn shed_total(&self) -> u64 {
		self.shed_total.load(Ordering::Relaxed)
	}

	pub fn current_limit(&self) -> u64 {
		self.adaptive.lock().limit as u64
	}
}

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		self.shedder.in_flight.fetch_sub(1, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hard_cap_sheds_excess() {
		let s = LoadShedder::new(LoadSheddingConfig {
			enabled: true,
			max_concurrency: 2,
			..Default::default()
		});
		let a = s.admit().unwrap();
		let _b = s.admit().unwrap();
		assert!(matches!(s.admit(), Err(ProxyError::Overloaded)));
		drop(a);
		let _c = s.admit().unwrap();
		assert_eq!(s.shed_total(), 1);
	}

	#[test]
	fn disabled_shedder_admits_everything() {
		let s = LoadShedder::new(LoadSheddingConfig::default());
		let guards: Vec<_> = (0..100).map(|_| s.admit().unwrap()).collect();
		assert_eq!(s.in_flight(), 100);
		drop(guards);
		assert_eq!(s.in_flight(), 0);
	}

	#[test]
	fn adaptive_limit_decreases_on_slow_responses() {
		let s = LoadShedder::new(LoadSheddingConfig {
			enabled: true,
			adaptive: true,
			min_limit: 4,
			latency_target: Duration::from_millis(100),
			..Default::default()
		});
		let before = s.current_limit();
		for _ in 0..20 {
			s.observe_latency(Duration::from_millis(500));
		}
		assert!(s.current_limit() < before);
		for _ in 0..2000 {
			s.observe_latency(Duration::from_millis(500));
		}
		assert_eq!(s.current_limit(), 4);
		s.observe_latency(Duration::from_millis(10));
		assert_eq!(s.current_limit(), 5);
	}
}
