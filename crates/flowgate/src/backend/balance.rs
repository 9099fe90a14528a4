use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::BackendHandle;
use crate::types::features::{HashKeyConfig, LoadBalancerConfig, LoadBalancerPolicy};
use crate::*;

/// Backend selection over a pool. Every policy skips unavailable (unhealthy or ejected)
/// backends; consistent hashing does so by walking the ring clockwise.
pub enum Balancer {
	RoundRobin { counter: AtomicUsize },
	LeastConnections,
	ConsistentHash { ring: Ring, key: HashKeyConfig },
	LeastResponseTime,
}

impl Balancer {
	pub fn new(config: &LoadBalancerConfig, backends: &[Arc<BackendHandle>]) -> Balancer {
		match config.policy {
			LoadBalancerPolicy::RoundRobin => Balancer::RoundRobin {
				counter: AtomicUsize::new(0),
			},
			LoadBalancerPolicy::LeastConnections => Balancer::LeastConnections,
			LoadBalancerPolicy::ConsistentHash => Balancer::ConsistentHash {
				ring: Ring::build(backends, config.replicas),
				key: config
					.hash_key
					.clone()
					.unwrap_or(HashKeyConfig::Ip),
			},
			LoadBalancerPolicy::LeastResponseTime => Balancer::LeastResponseTime,
		}
	}

	pub fn hash_key_config(&self) -> Option<&HashKeyConfig> {
		match self {
			Balancer::ConsistentHash { key, .. } => Some(key),
			_ => None,
		}
	}

	pub fn pick(
		&self,
		backends: &[Arc<BackendHandle>],
		hash_key: Option<&str>,
	) -> Option<Arc<BackendHandle>> {
		match self {
			Balancer::RoundRobin { counter } => {
				// Weighted round robin: each backend appears `weight` times in the cycle.
				let total: usize = backends
					.iter()
					.filter(|b| b.available())
					.map(|b| b.weight)
					.sum();
				if total == 0 {
					return None;
				}
				let mut n = counter.fetch_add(1, Ordering::Relaxed) % total;
				for b in backends.iter().filter(|b| b.available()) {
					if n < b.weight {
						return Some(b.clone());
					}
					n -= b.weight;
				}
				None
			},
			Balancer::LeastConnections => backends
				.iter()
				.filter(|b| b.available())
				.min_by_key(|b| b.inflight() / b.weight.max(1) as u64)
				.cloned(),
			Balancer::ConsistentHash { ring, .. } => {
				let key = hash_key.unwrap_or("");
				ring.pick(backends, key)
			},
			Balancer::LeastResponseTime => backends
				.iter()
				.filter(|b| b.available())
				.min_by_key(|b| b.ewma_latency())
				.cloned(),
		}
	}
}

/// Consistent-hash ring with `replicas` virtual nodes per backend.
pub struct Ring {
	/// (hash, backend index), sorted by hash.
	nodes: Vec<(u64, usize)>,
}

impl Ring {
	pub fn build(backends: &[Arc<BackendHandle>], replicas: usize) -> Ring {
		let mut nodes = Vec::with_capacity(backends.len() * replicas);
		for (idx, backend) in backends.iter().enumerate() {
			for replica in 0..replicas.max(1) {
				nodes.push((hash_str(&format!("{}#{replica}", backend.target)), idx));
			}
		}
		nodes.sort_unstable();
		Ring { nodes }
	}

	/// The next clockwise node owning the key; unavailable backends are skipped monotonically.
	pub fn pick(
		&self,
		backends: &[Arc<BackendHandle>],
		key: &str,
	) -> Option<Arc<BackendHandle>> {
		if self.nodes.is_empty() {
			return None;
		}
		let h = hash_str(key);
		let start = self
			.nodes
			.partition_point(|(node_hash, _)| *node_hash < h);
		for offset in 0..self.nodes.len() {
			let (_, idx) = self.nodes[(start + offset) % self.nodes.len()];
			let backend = &backends[idx];
			if backend.available() {
				return Some(backend.clone());
			}
		}
		None
	}
}

fn hash_str(s: &str) -> u64 {
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	s.hash(&mut hasher);
	hasher.finish()
}

/// Resolves the configured hash key for a request.
pub fn resolve_hash_key(
	config: &HashKeyConfig,
	ctx: &mut crate::expr::RequestContext,
	req: &crate::http::Request,
) -> String {
	use crate::expr::Var;
	let var = match config {
		HashKeyConfig::Header(n) => Var::Header(n.to_ascii_lowercase()),
		HashKeyConfig::Cookie(n) => Var::Cookie(n.clone()),
		HashKeyConfig::Path => Var::Path,
		HashKeyConfig::Ip => Var::ClientIp,
	};
	ctx.resolve(&var, req).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::types::config::BackendConfig;

	fn pool(urls: &[&str]) -> Vec<Arc<BackendHandle>> {
		urls
			.iter()
			.map(|u| {
				BackendHandle::from_config(&BackendConfig {
					url: u.to_string(),
					weight: 1,
					health_check: None,
				})
				.unwrap()
			})
			.collect()
	}

	fn lb(policy: LoadBalancerPolicy) -> LoadBalancerConfig {
		LoadBalancerConfig {
			policy,
			hash_key: Some(HashKeyConfig::Ip),
			replicas: 150,
		}
	}

	#[test]
	fn round_robin_cycles() {
		let backends = pool(&["http://127.0.0.1:1", "http://127.0.0.1:2", "http://127.0.0.1:3"]);
		let b = Balancer::new(&lb(LoadBalancerPolicy::RoundRobin), &backends);
		let picks: Vec<String> = (0..6)
			.map(|_| b.pick(&backends, None).unwrap().target.to_string())
			.collect();
		assert_eq!(picks[0], picks[3]);
		assert_eq!(picks[1], picks[4]);
		assert_ne!(picks[0], picks[1]);
	}

	#[test]
	fn round_robin_skips_unhealthy() {
		let backends = pool(&["http://127.0.0.1:1", "http://127.0.0.1:2"]);
		for _ in 0..3 {
			backends[0].record_probe(false, 2, 3);
		}
		let b = Balancer::new(&lb(LoadBalancerPolicy::RoundRobin), &backends);
		for _ in 0..4 {
			assert_eq!(
				b.pick(&backends, None).unwrap().target.to_string(),
				"127.0.0.1:2"
			);
		}
	}

	#[test]
	fn least_connections_prefers_idle() {
		let backends = pool(&["http://127.0.0.1:1", "http://127.0.0.1:2"]);
		backends[0]
			.inflight
			.store(5, std::sync::atomic::Ordering::Relaxed);
		let b = Balancer::new(&lb(LoadBalancerPolicy::LeastConnections), &backends);
		assert_eq!(
			b.pick(&backends, None).unwrap().target.to_string(),
			"127.0.0.1:2"
		);
	}

	#[test]
	fn consistent_hash_is_sticky() {
		let backends = pool(&[
			"http://127.0.0.1:1",
			"http://127.0.0.1:2",
			"http://127.0.0.1:3",
		]);
		let b = Balancer::new(&lb(LoadBalancerPolicy::ConsistentHash), &backends);
		let first = b.pick(&backends, Some("client-a")).unwrap().target.to_string();
		for _ in 0..10 {
			assert_eq!(
				b.pick(&backends, Some("client-a")).unwrap().target.to_string(),
				first
			);
		}
	}

	#[test]
	fn consistent_hash_spreads_keys() {
		let backends = pool(&[
			"http://127.0.0.1:1",
			"http://127.0.0.1:2",
			"http://127.0.0.1:3",
		]);
		let b = Balancer::new(&lb(LoadBalancerPolicy::ConsistentHash), &backends);
		let mut seen: HashMap<String, usize> = HashMap::new();
		for i in 0..300 {
			let t = b
				.pick(&backends, Some(&format!("key{i}")))
				.unwrap()
				.target
				.to_string();
			*seen.entry(t).or_default() += 1;
		}
		assert_eq!(seen.len(), 3, "all backends should receive keys: {seen:?}");
	}

	#[test]
	fn consistent_hash_skips_unavailable_monotonically() {
		let backends = pool(&["http://127.0.0.1:1", "http://127.0.0.1:2"]);
		let b = Balancer::new(&lb(LoadBalancerPolicy::ConsistentHash), &backends);
		let first = b.pick(&backends, Some("k")).unwrap();
		for _ in 0..3 {
			first.record_probe(false, 2, 3);
		}
		let next = b.pick(&backends, Some("k")).unwrap();
		assert_ne!(next.target.to_string(), first.target.to_string());
	}

	#[test]
	fn least_response_time_prefers_fast() {
		let backends = pool(&["http://127.0.0.1:1", "http://127.0.0.1:2"]);
		let window = Duration::from_secs(60);
		backends[0].record_result(false, Duration::from_millis(500), window);
		backends[1].record_result(false, Duration::from_millis(5), window);
		let b = Balancer::new(&lb(LoadBalancerPolicy::LeastResponseTime), &backends);
		assert_eq!(
			b.pick(&backends, None).unwrap().target.to_string(),
			"127.0.0.1:2"
		);
	}
}
