pub mod byroute;

use std::collections::HashMap;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::backend::UpstreamTable;
use crate::client::Client;
use crate::client::redis::RedisHandle;
use crate::http::auth::{Authenticator, JwtVerifier};
use crate::http::blocklist::Blocklist;
use crate::http::cache::ResponseCache;
use crate::http::circuitbreaker::CircuitBreaker;
use crate::http::coalesce::Coalescer;
use crate::http::cors::Cors;
use crate::http::filters::HeaderModifier;
use crate::http::idempotency::IdempotencyStore;
use crate::http::loadshed::LoadShedder;
use crate::http::quota::QuotaCounter;
use crate::http::ratelimit::{RateLimiter, SpikeArrester};
use crate::http::retry::{self, RetryBudget};
use crate::http::route::RouteTable;
use crate::http::rules::CompiledRules;
use crate::http::signing::{InboundVerifier, Signer};
use crate::http::transform::CompiledTransform;
use crate::http::waf::Waf;
use crate::store::byroute::Registry;
use crate::types::features::{RouteFeatures, TierLimit};
use crate::*;

/// One config version's compiled view: the typed config plus the route and upstream tables.
pub struct RuntimeConfig {
	pub config: Arc<Config>,
	pub routes: Arc<RouteTable>,
	pub upstreams: Arc<UpstreamTable>,
}

/// Per-route compiled artifacts that are pure functions of the config (no runtime state), so
/// they are rebuilt wholesale on every reload.
pub struct RoutePolicies {
	pub cors: Option<Cors>,
	pub rules: Option<CompiledRules>,
	pub request_transform: Option<CompiledTransform>,
	pub response_transform: Option<CompiledTransform>,
	pub request_headers: Option<HeaderModifier>,
	pub response_headers: Option<HeaderModifier>,
	pub signer: Option<Signer>,
	pub inbound_verifier: Option<InboundVerifier>,
	pub waf: Option<Waf>,
	pub retry: Option<retry::Policy>,
}

impl RoutePolicies {
	pub fn empty() -> RoutePolicies {
		RoutePolicies {
			cors: None,
			rules: None,
			request_transform: None,
			response_transform: None,
			request_headers: None,
			response_headers: None,
			signer: None,
			inbound_verifier: None,
			waf: None,
			retry: None,
		}
	}

	fn compile(features: &RouteFeatures) -> anyhow::Result<RoutePolicies> {
		Ok(RoutePolicies {
			cors: features.cors.as_ref().map(Cors::compile).transpose()?,
			rules: features
				.rules
				.as_ref()
				.map(CompiledRules::compile)
				.transpose()?,
			request_transform: features
				.transform
				.as_ref()
				.and_then(|t| t.request.as_ref())
				.map(CompiledTransform::compile)
				.transpose()?,
			response_transform: features
				.transform
				.as_ref()
				.and_then(|t| t.response.as_ref())
				.map(CompiledTransform::compile)
				.transpose()?,
			request_headers: features
				.request_headers
				.as_ref()
				.map(HeaderModifier::compile)
				.transpose()?,
			response_headers: features
				.response_headers
				.as_ref()
				.map(HeaderModifier::compile)
				.transpose()?,
			signer: features.signing.as_ref().map(Signer::new).transpose()?,
			inbound_verifier: features
				.inbound_signing
				.as_ref()
				.map(InboundVerifier::new)
				.transpose()?,
			waf: features.waf.as_ref().map(Waf::new),
			retry: features
				.retry_policy
				.as_ref()
				.map(retry::Policy::compile)
				.transpose()?,
		})
	}
}

/// All shared runtime state, owned by the root `Gateway` value. Stateful stores reconcile on
/// reload (surviving keys keep their counters); compiled artifacts rebuild.
#[derive(Clone)]
pub struct Stores {
	inner: Arc<StoresInner>,
}

pub struct StoresInner {
	current: ArcSwap<RuntimeConfig>,

	pub limiters: Registry<RateLimiter>,
	pub spike_arresters: Registry<SpikeArrester>,
	pub quotas: Registry<QuotaCounter>,
	pub breakers: Registry<CircuitBreaker>,
	pub budgets: Registry<RetryBudget>,
	pub caches: Registry<ResponseCache>,
	pub coalescers: Registry<Coalescer>,
	pub idempotency: Registry<IdempotencyStore>,
	pub policies: Registry<RoutePolicies>,

	authenticator: ArcSwap<Authenticator>,
	blocklist: ArcSwapOption<Blocklist>,
	/// Replay-protection nonces: value -> expiry.
	nonces: parking_lot::Mutex<HashMap<String, Instant>>,
	pub revocation: Arc<crate::http::revocation::RevocationStore>,
	pub shedder: Arc<LoadShedder>,
	pub redis: Option<RedisHandle>,

	tx: tokio::sync::broadcast::Sender<Arc<RuntimeConfig>>,
}

impl Stores {
	/// Builds the stores for the initial config. Later configs go through `apply`.
	pub fn new(
		config: Arc<Config>,
		client: Client,
		redis: Option<RedisHandle>,
	) -> anyhow::Result<Stores> {
		let (tx, _) = tokio::sync::broadcast::channel(8);
		let revocation = Arc::new(crate::http::revocation::RevocationStore::new(
			config.security.token_revocation.clone().unwrap_or_default(),
			redis.clone(),
		));
		let shedder = Arc::new(LoadShedder::new(
			config.security.load_shedding.clone().unwrap_or_default(),
		));
		let initial = RuntimeConfig {
			routes: Arc::new(RouteTable::compile(&config)?),
			upstreams: Arc::new(UpstreamTable::compile(&config)?),
			config: config.clone(),
		};
		let stores = Stores {
			inner: Arc::new(StoresInner {
				current: ArcSwap::from_pointee(initial),
				limiters: Default::default(),
				spike_arresters: Default::default(),
				quotas: Default::default(),
				breakers: Default::default(),
				budgets: Default::default(),
				caches: Default::default(),
				coalescers: Default::default(),
				idempotency: Default::default(),
				policies: Default::default(),
				authenticator: ArcSwap::from_pointee(build_authenticator(&config, client.clone())?),
				blocklist: ArcSwapOption::from_pointee(
					config.security.ip_blocklist.as_ref().map(Blocklist::new),
				),
				nonces: Default::default(),
				revocation,
				shedder,
				redis,
				tx,
			}),
		};
		stores.reconcile(&config)?;
		Ok(stores)
	}

	/// Current config snapshot; readers take one at request entry and use it throughout.
	pub fn snapshot(&self) -> Arc<RuntimeConfig> {
		self.inner.current.load_full()
	}

	pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<RuntimeConfig>> {
		self.inner.tx.subscribe()
	}

	pub fn authenticator(&self) -> Arc<Authenticator> {
		self.inner.authenticator.load_full()
	}

	pub fn blocklist(&self) -> Option<Arc<Blocklist>> {
		self.inner.blocklist.load_full()
	}

	pub fn shedder(&self) -> &Arc<LoadShedder> {
		&self.inner.shedder
	}

	pub fn revocation(&self) -> &Arc<crate::http::revocation::RevocationStore> {
		&self.inner.revocation
	}

	pub fn redis(&self) -> Option<&RedisHandle> {
		self.inner.redis.as_ref()
	}

	pub fn limiters(&self) -> &Registry<RateLimiter> {
		&self.inner.limiters
	}
	pub fn spike_arresters(&self) -> &Registry<SpikeArrester> {
		&self.inner.spike_arresters
	}
	pub fn quotas(&self) -> &Registry<QuotaCounter> {
		&self.inner.quotas
	}
	pub fn breakers(&self) -> &Registry<CircuitBreaker> {
		&self.inner.breakers
	}
	pub fn budgets(&self) -> &Registry<RetryBudget> {
		&self.inner.budgets
	}
	pub fn caches(&self) -> &Registry<ResponseCache> {
		&self.inner.caches
	}
	pub fn coalescers(&self) -> &Registry<Coalescer> {
		&self.inner.coalescers
	}
	pub fn idempotency(&self) -> &Registry<IdempotencyStore> {
		&self.inner.idempotency
	}
	pub fn policies(&self) -> &Registry<RoutePolicies> {
		&self.inner.policies
	}

	/// Atomically publishes a new validated config and notifies subscribers. On error nothing
	/// is swapped and the previous config stays live.
	pub fn apply(&self, config: Arc<Config>, client: Client) -> anyhow::Result<()> {
		let next = RuntimeConfig {
			routes: Arc::new(RouteTable::compile(&config)?),
			upstreams: Arc::new(UpstreamTable::compile(&config)?),
			config: config.clone(),
		};
		self.reconcile(&config)?;
		self
			.inner
			.authenticator
			.store(Arc::new(build_authenticator(&config, client)?));
		self.inner.blocklist.store(
			config
				.security
				.ip_blocklist
				.as_ref()
				.map(|bl| Arc::new(Blocklist::new(bl))),
		);
		let next = Arc::new(next);
		self.inner.current.store(next.clone());
		let _ = self.inner.tx.send(next);
		Ok(())
	}

	fn reconcile(&self, config: &Config) -> anyhow::Result<()> {
		let inner = &self.inner;
		let redis = inner.redis.clone();

		let merged: HashMap<Strng, Arc<RouteFeatures>> = config
			.routes
			.iter()
			.map(|r| {
				(
					r.id.clone(),
					Arc::new(RouteFeatures::merge(&config.defaults, &r.features)),
				)
			})
			.collect();
		let features = |key: &Strng| merged.get(key).cloned().unwrap_or_default();

		let global_tiers: HashMap<Strng, TierLimit> = config
			.tiers
			.iter()
			.map(|(name, t)| {
				(
					name.clone(),
					TierLimit {
						rate: t.rate.unwrap_or_default(),
						period: t.period,
						burst: t.burst,
					},
				)
			})
			.collect();

		inner.limiters.reconcile(
			merged
				.iter()
				.filter(|(_, f)| f.rate_limit.is_some())
				.map(|(k, _)| k.clone()),
			|key| {
				let f = features(key);
				let rl = f.rate_limit.clone().expect("filtered on rate_limit");
				Ok::<_, anyhow::Error>(Arc::new(RateLimiter::new(
					key.clone(),
					rl,
					global_tiers.clone(),
					redis.clone(),
				)))
			},
		)?;

		inner.spike_arresters.reconcile(
			merged
				.iter()
				.filter(|(_, f)| f.spike_arrest.is_some())
				.map(|(k, _)| k.clone()),
			|key| {
				let f = features(key);
				Ok::<_, anyhow::Error>(Arc::new(SpikeArrester::new(
					f.spike_arrest.clone().expect("filtered on spike_arrest"),
				)))
			},
		)?;

		inner.quotas.reconcile(
			merged
				.iter()
				.filter(|(_, f)| f.quota.is_some())
				.map(|(k, _)| k.clone()),
			|key| {
				let f = features(key);
				Ok::<_, anyhow::Error>(Arc::new(QuotaCounter::new(
					f.quota.clone().expect("filtered on quota"),
				)))
			},
		)?;

		inner.breakers.reconcile(
			merged
				.iter()
				.filter(|(_, f)| f.circuit_breaker.is_some())
				.map(|(k, _)| k.clone()),
			|key| {
				let f = features(key);
				Ok::<_, anyhow::Error>(Arc::new(CircuitBreaker::with_redis(
					key.clone(),
					f.circuit_breaker.clone().expect("filtered on circuit_breaker"),
					redis.clone(),
				)))
			},
		)?;

		// Budget pools: the named pools plus inline per-route budgets.
		let mut budget_keys: Vec<Strng> = config
			.budget_pools
			.keys()
			.map(|name| strng::format!("pool/{name}"))
			.collect();
		budget_keys.extend(
			merged
				.iter()
				.filter(|(_, f)| {
					f.retry_policy
						.as_ref()
						.is_some_and(|rp| rp.budget.is_some())
				})
				.map(|(k, _)| strng::format!("route/{k}")),
		);
		inner.budgets.reconcile(budget_keys, |key| {
			let cfg = if let Some(name) = key.strip_prefix("pool/") {
				config
					.budget_pools
					.get(name)
					.cloned()
					.unwrap_or_default()
			} else if let Some(route) = key.strip_prefix("route/") {
				merged
					.get(route)
					.and_then(|f| f.retry_policy.as_ref())
					.and_then(|rp| rp.budget.clone())
					.unwrap_or_default()
			} else {
				Default::default()
			};
			Ok::<_, anyhow::Error>(Arc::new(RetryBudget::new(cfg)))
		})?;

		// Caches: shared buckets plus per-route caches.
		let mut cache_keys: Vec<Strng> = Vec::new();
		for (key, f) in &merged {
			if let Some(cache) = &f.cache {
				match &cache.bucket {
					Some(bucket) => cache_keys.push(strng::format!("bucket/{bucket}")),
					None => cache_keys.push(strng::format!("route/{key}")),
				}
			}
		}
		cache_keys.sort();
		cache_keys.dedup();
		inner.caches.reconcile(cache_keys, |key| {
			let mut cfg = if let Some(bucket) = key.strip_prefix("bucket/") {
				// The first route naming the bucket supplies the base config.
				let base = merged
					.values()
					.filter_map(|f| f.cache.as_ref())
					.find(|c| c.bucket.as_deref() == Some(bucket))
					.cloned()
					.unwrap_or_default();
				let overrides = config.cache_buckets.get(bucket);
				let mut cfg = base;
				if let Some(o) = overrides {
					if let Some(max) = o.max_size {
						cfg.max_size = max;
					}
					if let Some(ttl) = o.ttl {
						cfg.ttl = ttl;
					}
				}
				cfg
			} else {
				key
					.strip_prefix("route/")
					.and_then(|route| merged.get(route))
					.and_then(|f| f.cache.clone())
					.unwrap_or_default()
			};
			if cfg.methods.is_empty() {
				cfg.methods = vec!["GET".into(), "HEAD".into()];
			}
			Ok::<_, anyhow::Error>(Arc::new(ResponseCache::new(
				key.clone(),
				cfg,
				redis.clone(),
			)))
		})?;

		inner.coalescers.reconcile(
			merged
				.iter()
				.filter(|(_, f)| f.coalesce.is_some())
				.map(|(k, _)| k.clone()),
			|key| {
				let f = features(key);
				Ok::<_, anyhow::Error>(Arc::new(Coalescer::new(
					f.coalesce.clone().expect("filtered on coalesce"),
				)))
			},
		)?;

		inner.idempotency.reconcile(
			merged
				.iter()
				.filter(|(_, f)| f.idempotency.is_some())
				.map(|(k, _)| k.clone()),
			|key| {
				let f = features(key);
				Ok::<_, anyhow::Error>(Arc::new(IdempotencyStore::new(
					f.idempotency.clone().expect("filtered on idempotency"),
					redis.clone(),
				)))
			},
		)?;

		// Policies are stateless compilations and must pick up config edits, so they are
		// rebuilt for every key rather than reconciled.
		inner.policies.replace_all(merged.keys().cloned(), |key| {
			RoutePolicies::compile(&features(key)).map(Arc::new)
		})?;

		Ok(())
	}

	/// Nonce replay protection: a presented nonce may be used once within its ttl. Requests
	/// without the header pass untouched.
	pub fn check_nonce(
		&self,
		config: &crate::types::config::NonceConfig,
		req: &crate::http::Request,
	) -> Result<(), crate::proxy::ProxyError> {
		let Some(value) = req
			.headers()
			.get(config.header.as_str())
			.and_then(|v| v.to_str().ok())
		else {
			return Ok(());
		};
		let now = Instant::now();
		let mut nonces = self.inner.nonces.lock();
		nonces.retain(|_, expiry| *expiry > now);
		if nonces.contains_key(value) {
			return Err(crate::proxy::ProxyError::Rejected {
				status: http::StatusCode::CONFLICT,
				message: "nonce already used".to_string(),
			});
		}
		nonces.insert(value.to_string(), now + config.ttl);
		Ok(())
	}

	/// The budget a route's retry loop draws from, if any.
	pub fn budget_for_route(&self, route: &str, features: &RouteFeatures) -> Option<Arc<RetryBudget>> {
		let rp = features.retry_policy.as_ref()?;
		if let Some(pool) = &rp.budget_pool {
			return self.inner.budgets.get(&format!("pool/{pool}"));
		}
		if rp.budget.is_some() {
			return self.inner.budgets.get(&format!("route/{route}"));
		}
		None
	}

	/// The cache serving a route, honouring bucket sharing.
	pub fn cache_for_route(&self, route: &str, features: &RouteFeatures) -> Option<Arc<ResponseCache>> {
		let cache = features.cache.as_ref()?;
		match &cache.bucket {
			Some(bucket) => self.inner.caches.get(&format!("bucket/{bucket}")),
			None => self.inner.caches.get(&format!("route/{route}")),
		}
	}
}

fn build_authenticator(config: &Config, client: Client) -> anyhow::Result<Authenticator> {
	let jwt = config
		.security
		.jwt
		.as_ref()
		.map(JwtVerifier::new)
		.transpose()?;
	Ok(Authenticator::new(
		config.security.api_keys.clone(),
		jwt,
		client,
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn stores(yaml: &str) -> Stores {
		let config: Config = crate::serdes::yamlviajson::from_str(yaml).unwrap();
		crate::config::validator::validate(&config).unwrap();
		Stores::new(Arc::new(config), Client::for_tests(), None).unwrap()
	}

	#[test]
	fn stateful_stores_survive_reload() {
		let s = stores(
			r#"
routes:
  - id: api
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    rate_limit: {rate: 5, period: 1s, burst: 5}
"#,
		);
		let limiter_before = s.limiters().get("api").unwrap();

		// Reload with the same route id: the limiter instance must carry over.
		let config: Config = crate::serdes::yamlviajson::from_str(
			r#"
routes:
  - id: api
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    rate_limit: {rate: 5, period: 1s, burst: 5}
  - id: extra
    path: /new
    echo: true
"#,
		)
		.unwrap();
		s.apply(Arc::new(config), Client::for_tests()).unwrap();
		let limiter_after = s.limiters().get("api").unwrap();
		assert!(Arc::ptr_eq(&limiter_before, &limiter_after));
	}

	#[test]
	fn dropped_routes_lose_their_stores() {
		let s = stores(
			r#"
routes:
  - id: api
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    circuit_breaker: {failure_threshold: 3}
"#,
		);
		assert!(s.breakers().get("api").is_some());
		let config: Config = crate::serdes::yamlviajson::from_str("routes: []").unwrap();
		s.apply(Arc::new(config), Client::for_tests()).unwrap();
		assert!(s.breakers().get("api").is_none());
	}

	#[test]
	fn bucket_caches_are_shared_across_routes() {
		let s = stores(
			r#"
cache_buckets:
  shared: {max_size: 64}
routes:
  - id: a
    path: /a
    backends: [{url: "http://127.0.0.1:1"}]
    cache: {ttl: 60s, bucket: shared}
  - id: b
    path: /b
    backends: [{url: "http://127.0.0.1:1"}]
    cache: {ttl: 60s, bucket: shared}
"#,
		);
		let snapshot = s.snapshot();
		let fa = snapshot.routes.get("a").unwrap().features.clone();
		let fb = snapshot.routes.get("b").unwrap().features.clone();
		let ca = s.cache_for_route("a", &fa).unwrap();
		let cb = s.cache_for_route("b", &fb).unwrap();
		assert!(Arc::ptr_eq(&ca, &cb));
	}

	#[test]
	fn named_budget_pools_are_shared() {
		let s = stores(
			r#"
budget_pools:
  main: {ratio: 0.2, min_retries: 5, window: 10s}
routes:
  - id: a
    path: /a
    backends: [{url: "http://127.0.0.1:1"}]
    retry_policy: {max_retries: 2, budget_pool: main}
  - id: b
    path: /b
    backends: [{url: "http://127.0.0.1:1"}]
    retry_policy: {max_retries: 2, budget_pool: main}
"#,
		);
		let snapshot = s.snapshot();
		let fa = snapshot.routes.get("a").unwrap().features.clone();
		let fb = snapshot.routes.get("b").unwrap().features.clone();
		let ba = s.budget_for_route("a", &fa).unwrap();
		let bb = s.budget_for_route("b", &fb).unwrap();
		assert!(Arc::ptr_eq(&ba, &bb));
	}
}
