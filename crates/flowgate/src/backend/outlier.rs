use crate::backend::Upstream;
use crate::types::features::OutlierDetectionConfig;
use crate::*;

/// Passive outlier detection: every `interval`, compare each backend's error rate and p99
/// latency over `window` against the pool median and eject offenders, subject to
/// `max_ejection_percent` (health is always preserved over outlier action).
pub struct OutlierDetector {
	config: OutlierDetectionConfig,
}

impl OutlierDetector {
	pub fn new(config: OutlierDetectionConfig) -> OutlierDetector {
		OutlierDetector { config }
	}

	pub async fn run(self, upstream: Arc<Upstream>) {
		let mut interval = tokio::time::interval(self.config.interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			interval.tick().await;
			self.sweep(&upstream);
		}
	}

	pub fn sweep(&self, upstream: &Upstream) {
		let cfg = &self.config;
		for backend in &upstream.backends {
			backend.clear_ejection_if_expired();
		}

		let stats: Vec<_> = upstream
			.backends
			.iter()
			.map(|b| b.history_stats(cfg.window))
			.collect();

		let mut error_rates: Vec<f64> = stats
			.iter()
			.flatten()
			.map(|s| s.error_rate)
			.collect();
		let mut p99s: Vec<Duration> = stats.iter().flatten().map(|s| s.p99).collect();
		if error_rates.is_empty() {
			return;
		}
		error_rates.sort_by(|a, b| a.total_cmp(b));
		p99s.sort();
		let median_error = error_rates[error_rates.len() / 2];
		let median_p99 = p99s[p99s.len() / 2];

		let total = upstream.backends.len();
		let mut ejected = upstream
			.backends
			.iter()
			.filter(|b| b.is_ejected())
			.count();
		let max_ejected = (total * cfg.max_ejection_percent as usize) / 100;

		for (backend, stat) in upstream.backends.iter().zip(stats.iter()) {
			let Some(stat) = stat else {
				backend.reset_ejection_streak();
				continue;
			};
			if backend.is_ejected() {
				continue;
			}
			if stat.total < cfg.min_requests {
				continue;
			}
			let error_outlier = stat.error_rate >= cfg.error_rate_threshold
				|| (median_error > 0.0 && stat.error_rate >= median_error * cfg.error_rate_multiplier);
			let latency_outlier = !median_p99.is_zero()
				&& stat.p99 >= median_p99.mul_f64(cfg.latency_multiplier);
			if !(error_outlier || latency_outlier) {
				backend.reset_ejection_streak();
				continue;
			}
			if ejected >= max_ejected {
				debug!(backend = %backend.target, "outlier detected but ejection cap reached");
				continue;
			}
			backend.eject(cfg.base_ejection_duration, cfg.max_ejection_duration);
			ejected += 1;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::config::BackendConfig;
	use crate::types::features::LoadBalancerConfig;

	fn upstream(n: usize) -> Arc<Upstream> {
		let backends: Vec<BackendConfig> = (0..n)
			.map(|i| BackendConfig {
				url: format!("http://127.0.0.1:{}", 9000 + i),
				weight: 1,
				health_check: None,
			})
			.collect();
		Upstream::inline("pool".into(), &backends, &LoadBalancerConfig::default()).unwrap()
	}

	fn config() -> OutlierDetectionConfig {
		OutlierDetectionConfig {
			interval: Duration::from_millis(10),
			window: Duration::from_secs(60),
			min_requests: 10,
			error_rate_threshold: 0.5,
			error_rate_multiplier: 3.0,
			latency_multiplier: 5.0,
			base_ejection_duration: Duration::from_secs(30),
			max_ejection_duration: Duration::from_secs(300),
			max_ejection_percent: 50,
		}
	}

	fn feed(upstream: &Upstream, idx: usize, errors: usize, total: usize, latency: Duration) {
		let window = Duration::from_secs(60);
		for i in 0..total {
			upstream.backends[idx].record_result(i < errors, latency, window);
		}
	}

	#[test]
	fn high_error_rate_backend_is_ejected() {
		let up = upstream(3);
		feed(&up, 0, 15, 20, Duration::from_millis(10));
		feed(&up, 1, 0, 20, Duration::from_millis(10));
		feed(&up, 2, 0, 20, Duration::from_millis(10));
		OutlierDetector::new(config()).sweep(&up);
		assert!(up.backends[0].is_ejected());
		assert!(!up.backends[1].is_ejected());
	}

	#[test]
	fn few_samples_are_not_ejected() {
		let up = upstream(2);
		feed(&up, 0, 5, 5, Duration::from_millis(10));
		OutlierDetector::new(config()).sweep(&up);
		assert!(!up.backends[0].is_ejected());
	}

	#[test]
	fn latency_outlier_is_ejected() {
		let up = upstream(3);
		feed(&up, 0, 0, 20, Duration::from_millis(600));
		feed(&up, 1, 0, 20, Duration::from_millis(20));
		feed(&up, 2, 0, 20, Duration::from_millis(20));
		OutlierDetector::new(config()).sweep(&up);
		assert!(up.backends[0].is_ejected());
	}

	#[test]
	fn ejection_cap_limits_simultaneous_ejections() {
		let up = upstream(2);
		feed(&up, 0, 20, 20, Duration::from_millis(10));
		feed(&up, 1, 20, 20, Duration::from_millis(10));
		OutlierDetector::new(config()).sweep(&up);
		let ejected = up.backends.iter().filter(|b| b.is_ejected()).count();
		// 50% of 2 backends = at most 1 ejected.
		assert_eq!(ejected, 1);
	}
}
