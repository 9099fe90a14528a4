pub mod balance;
pub mod health;
pub mod outlier;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::client::Target;
use crate::types::config::{BackendConfig, UpstreamConfig};
use crate::types::features::{HealthCheckConfig, LoadBalancerConfig};
use crate::*;

/// Health state per backend. Unknown is the initial state and treated as healthy for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
	Unknown,
	Healthy,
	Unhealthy,
}

impl HealthState {
	fn from_u8(v: u8) -> HealthState {
		match v {
			1 => HealthState::Healthy,
			2 => HealthState::Unhealthy,
			_ => HealthState::Unknown,
		}
	}
}

/// One resolvable backend plus its runtime counters. Readers use atomic loads for the state;
/// writers (health checker, outlier detector, response hook) take short locks around updates.
pub struct BackendHandle {
	pub target: Target,
	pub tls: bool,
	pub weight: usize,
	pub health_check: Option<HealthCheckConfig>,

	state: AtomicU8,
	consecutive_successes: AtomicU32,
	consecutive_failures: AtomicU32,

	ejected_until: Mutex<Option<Instant>>,
	consecutive_ejections: AtomicU32,

	pub(crate) inflight: AtomicU64,
	/// EWMA of response latency in nanoseconds, for least-response-time balancing.
	ewma_nanos: AtomicU64,

	/// Rolling outcome history for outlier detection.
	history: Mutex<VecDeque<Sample>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample {
	pub at: Instant,
	pub error: bool,
	pub latency: Duration,
}

impl BackendHandle {
	pub fn from_config(config: &BackendConfig) -> anyhow::Result<Arc<BackendHandle>> {
		let (target, tls) = Target::parse_url(&config.url)?;
		Ok(Arc::new(BackendHandle {
			target,
			tls,
			weight: config.weight.max(1),
			health_check: config.health_check.clone(),
			state: AtomicU8::new(0),
			consecutive_successes: AtomicU32::new(0),
			consecutive_failures: AtomicU32::new(0),
			ejected_until: Mutex::new(None),
			consecutive_ejections: AtomicU32::new(0),
			inflight: AtomicU64::new(0),
			ewma_nanos: AtomicU64::new(0),
			history: Mutex::new(VecDeque::new()),
		}))
	}

	pub fn health(&self) -> HealthState {
		HealthState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn is_ejected(&self) -> bool {
		self
			.ejected_until
			.lock()
			.is_some_and(|until| until > Instant::now())
	}

	/// Available for routing: not Unhealthy and not outlier-ejected.
	pub fn available(&self) -> bool {
		self.health() != HealthState::Unhealthy && !self.is_ejected()
	}

	pub fn inflight(&self) -> u64 {
		self.inflight.load(Ordering::Relaxed)
	}

	pub fn ewma_latency(&self) -> Duration {
		Duration::from_nanos(self.ewma_nanos.load(Ordering::Relaxed))
	}

	/// Health-probe outcome with `healthy_after`/`unhealthy_after` hysteresis.
	pub fn record_probe(&self, success: bool, healthy_after: u32, unhealthy_after: u32) {
		if success {
			self.consecutive_failures.store(0, Ordering::Relaxed);
			let n = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
			if n >= healthy_after && self.health() != HealthState::Healthy {
				info!(backend = %self.target, "backend is healthy");
				self.state.store(1, Ordering::Release);
			}
		} else {
			self.consecutive_successes.store(0, Ordering::Relaxed);
			let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
			if n >= unhealthy_after && self.health() != HealthState::Unhealthy {
				warn!(backend = %self.target, "backend is unhealthy");
				self.state.store(2, Ordering::Release);
			}
		}
	}

	/// Response-completion hook: feeds the EWMA and the outlier history ring.
	pub fn record_result(&self, error: bool, latency: Duration, window: Duration) {
		const EWMA_ALPHA: f64 = 0.3;
		let prev = self.ewma_nanos.load(Ordering::Relaxed);
		let next = if prev == 0 {
			latency.as_nanos() as u64
		} else {
			(prev as f64 * (1.0 - EWMA_ALPHA) + latency.as_nanos() as f64 * EWMA_ALPHA) as u64
		};
		self.ewma_nanos.store(next, Ordering::Relaxed);

		let now = Instant::now();
		let mut history = self.history.lock();
		while history
			.front()
			.is_some_and(|s| now.duration_since(s.at) >= window)
		{
			history.pop_front();
		}
		history.push_back(Sample {
			at: now,
			error,
			latency,
		});
	}

	pub(crate) fn history_stats(&self, window: Duration) -> Option<OutcomeStats> {
		let now = Instant::now();
		let mut history = self.history.lock();
		while history
			.front()
			.is_some_and(|s| now.duration_since(s.at) >= window)
		{
			history.pop_front();
		}
		if history.is_empty() {
			return None;
		}
		let total = history.len() as u64;
		let errors = history.iter().filter(|s| s.error).count() as u64;
		let mut latencies: Vec<Duration> = history.iter().map(|s| s.latency).collect();
		latencies.sort();
		let p99_idx = ((latencies.len() as f64) * 0.99).ceil() as usize;
		let p99 = latencies[p99_idx.saturating_sub(1).min(latencies.len() - 1)];
		Some(OutcomeStats {
			total,
			error_rate: errors as f64 / total as f64,
			p99,
		})
	}

	pub(crate) fn eject(&self, base: Duration, max: Duration) {
		let n = self.consecutive_ejections.fetch_add(1, Ordering::Relaxed);
		let duration = base
			.saturating_mul(2u32.saturating_pow(n))
			.min(max);
		warn!(backend = %self.target, ?duration, "backend ejected by outlier detection");
		*self.ejected_until.lock() = Some(Instant::now() + duration);
	}

	pub(crate) fn clear_ejection_if_expired(&self) {
		let mut guard = self.ejected_until.lock();
		if guard.is_some_and(|until| until <= Instant::now()) {
			*guard = None;
		}
	}

	pub(crate) fn reset_ejection_streak(&self) {
		self.consecutive_ejections.store(0, Ordering::Relaxed);
	}
}

impl Debug for BackendHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BackendHandle")
			.field("target", &self.target)
			.field("health", &self.health())
			.finish()
	}
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OutcomeStats {
	pub total: u64,
	pub error_rate: f64,
	pub p99: Duration,
}

/// A named pool of backends with a shared balancer and transport.
pub struct Upstream {
	pub name: Strng,
	pub backends: Vec<Arc<BackendHandle>>,
	pub balancer: balance::Balancer,
	pub config: UpstreamConfig,
}

impl Upstream {
	pub fn from_config(name: Strng, config: &UpstreamConfig) -> anyhow::Result<Arc<Upstream>> {
		Self::build(name, &config.backends, &config.load_balancer, config.clone())
	}

	/// Inline route backends compile into anonymous upstreams keyed by route id.
	pub fn inline(
		name: Strng,
		backends: &[BackendConfig],
		lb: &LoadBalancerConfig,
	) -> anyhow::Result<Arc<Upstream>> {
		Self::build(name, backends, lb, UpstreamConfig::default())
	}

	fn build(
		name: Strng,
		backends: &[BackendConfig],
		lb: &LoadBalancerConfig,
		config: UpstreamConfig,
	) -> anyhow::Result<Arc<Upstream>> {
		let backends = backends
			.iter()
			.map(BackendHandle::from_config)
			.collect::<anyhow::Result<Vec<_>>>()?;
		let balancer = balance::Balancer::new(lb, &backends);
		Ok(Arc::new(Upstream {
			name,
			backends,
			balancer,
			config,
		}))
	}

	pub fn pick(&self, hash_key: Option<&str>) -> Option<Arc<BackendHandle>> {
		self.balancer.pick(&self.backends, hash_key)
	}
}

impl Debug for Upstream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Upstream")
			.field("name", &self.name)
			.field("backends", &self.backends.len())
			.finish()
	}
}

/// All upstream pools for one config version: named pools plus the anonymous pools compiled
/// from per-route backends, traffic groups, versions, and tenants.
#[derive(Default)]
pub struct UpstreamTable {
	pools: HashMap<Strng, Arc<Upstream>>,
}

impl UpstreamTable {
	pub fn compile(config: &Config) -> anyhow::Result<UpstreamTable> {
		let mut pools = HashMap::new();
		for (name, up) in &config.upstreams {
			pools.insert(name.clone(), Upstream::from_config(name.clone(), up)?);
		}
		for route in &config.routes {
			let lb = route
				.features
				.load_balancer
				.clone()
				.unwrap_or_default();
			if !route.backends.is_empty() {
				let key = route_pool(&route.id);
				pools.insert(
					key.clone(),
					Upstream::inline(key, &route.backends, &lb)?,
				);
			}
			if let Some(ts) = &route.features.traffic_split {
				for group in &ts.groups {
					if group.backends.is_empty() {
						continue;
					}
					let key = group_pool(&route.id, &group.name);
					pools.insert(key.clone(), Upstream::inline(key, &group.backends, &lb)?);
				}
			}
			if let Some(v) = &route.features.versioning {
				for (version, backends) in &v.versions {
					let key = version_pool(&route.id, version);
					pools.insert(key.clone(), Upstream::inline(key, backends, &lb)?);
				}
			}
		}
		for (name, tenant) in &config.tenants {
			if !tenant.backends.is_empty() {
				let key = tenant_pool(name);
				pools.insert(
					key.clone(),
					Upstream::inline(key, &tenant.backends, &Default::default())?,
				);
			}
		}
		Ok(UpstreamTable { pools })
	}

	pub fn get(&self, name: &str) -> Option<&Arc<Upstream>> {
		self.pools.get(name)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Strng, &Arc<Upstream>)> {
		self.pools.iter()
	}

	pub fn len(&self) -> usize {
		self.pools.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pools.is_empty()
	}
}

pub fn route_pool(route: &str) -> Strng {
	strng::format!("route/{route}")
}

pub fn group_pool(route: &str, group: &str) -> Strng {
	strng::format!("route/{route}/group/{group}")
}

pub fn version_pool(route: &str, version: &str) -> Strng {
	strng::format!("route/{route}/version/{version}")
}

pub fn tenant_pool(tenant: &str) -> Strng {
	strng::format!("tenant/{tenant}")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn handle(url: &str) -> Arc<BackendHandle> {
		BackendHandle::from_config(&BackendConfig {
			url: url.into(),
			weight: 1,
			health_check: None,
		})
		.unwrap()
	}

	#[test]
	fn unknown_state_is_routable() {
		let b = handle("http://127.0.0.1:9000");
		assert_eq!(b.health(), HealthState::Unknown);
		assert!(b.available());
	}

	#[test]
	fn hysteresis_transitions() {
		let b = handle("http://127.0.0.1:9000");
		b.record_probe(true, 2, 3);
		assert_eq!(b.health(), HealthState::Unknown);
		b.record_probe(true, 2, 3);
		assert_eq!(b.health(), HealthState::Healthy);

		b.record_probe(false, 2, 3);
		b.record_probe(false, 2, 3);
		assert_eq!(b.health(), HealthState::Healthy);
		b.record_probe(false, 2, 3);
		assert_eq!(b.health(), HealthState::Unhealthy);
		assert!(!b.available());

		// A single success resets the failure streak.
		b.record_probe(true, 2, 3);
		b.record_probe(true, 2, 3);
		assert_eq!(b.health(), HealthState::Healthy);
	}

	#[test]
	fn ejection_doubles_and_caps() {
		let b = handle("http://127.0.0.1:9000");
		b.eject(Duration::from_secs(10), Duration::from_secs(25));
		assert!(b.is_ejected());
		// Second consecutive ejection doubles, third caps at max.
		b.eject(Duration::from_secs(10), Duration::from_secs(25));
		b.eject(Duration::from_secs(10), Duration::from_secs(25));
		let until = b.ejected_until.lock().unwrap();
		let remaining = until.duration_since(Instant::now());
		assert!(remaining <= Duration::from_secs(25));
		assert!(remaining > Duration::from_secs(20));
	}

	#[test]
	fn history_stats_compute_error_rate_and_p99() {
		let b = handle("http://127.0.0.1:9000");
		let window = Duration::from_secs(60);
		for i in 0..100 {
			b.record_result(i < 30, Duration::from_millis(i), window);
		}
		let stats = b.history_stats(window).unwrap();
		assert_eq!(stats.total, 100);
		assert!((stats.error_rate - 0.3).abs() < 1e-9);
		assert_eq!(stats.p99, Duration::from_millis(98));
	}

	#[test]
	fn upstream_table_compiles_all_pool_kinds() {
		let config: Config = crate::serdes::yamlviajson::from_str(
			r#"
upstreams:
  pool:
    backends: [{url: "http://127.0.0.1:1"}]
routes:
  - id: split
    path: /
    traffic_split:
      groups:
        - {name: a, weight: 50, backends: [{url: "http://127.0.0.1:2"}]}
        - {name: b, weight: 50, backends: [{url: "http://127.0.0.1:3"}]}
  - id: plain
    path: /p
    backends: [{url: "http://127.0.0.1:4"}]
"#,
		)
		.unwrap();
		let table = UpstreamTable::compile(&config).unwrap();
		assert!(table.get("pool").is_some());
		assert!(table.get("route/split/group/a").is_some());
		assert!(table.get("route/split/group/b").is_some());
		assert!(table.get("route/plain").is_some());
	}
}
