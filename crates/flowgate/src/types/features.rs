use std::str::FromStr;

use indexmap::IndexMap;
use ipnet::IpNet;
use secrecy::SecretString;

use crate::types::config::{BackendConfig, StoreMode};
use crate::*;

/// Per-route feature blocks. The same record doubles as the global defaults block; route values
/// merge over the globals with `merge` (non-zero merge: per-route wins when set, lists append).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RouteFeatures {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub auth: Option<AuthConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rate_limit: Option<RateLimitConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub spike_arrest: Option<SpikeArrestConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub quota: Option<QuotaConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub circuit_breaker: Option<CircuitBreakerConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry_policy: Option<RetryPolicyConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache: Option<CacheConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub coalesce: Option<CoalesceConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub idempotency: Option<IdempotencyConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cors: Option<CorsConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub csrf: Option<CsrfConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub compression: Option<CompressionConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub traffic_split: Option<TrafficSplitConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub sticky: Option<StickyConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub canary: Option<CanaryConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub blue_green: Option<BlueGreenConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ab_test: Option<AbTestConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub versioning: Option<VersioningConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transform: Option<TransformConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rules: Option<RulesConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub waf: Option<WafConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub openapi: Option<OpenApiRouteConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub validation: Option<ValidationConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mirror: Option<MirrorConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub websocket: Option<WebsocketConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub grpc: Option<GrpcConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub graphql: Option<GraphqlConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ext_auth: Option<ExtAuthConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub signing: Option<SigningConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inbound_signing: Option<InboundSigningConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssrf: Option<SsrfConfig>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub status_mapping: IndexMap<u16, u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub timeouts: Option<TimeoutConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_body_size: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_limit: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_headers: Option<HeaderModifierConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_headers: Option<HeaderModifierConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub redirect: Option<RedirectConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rewrite: Option<RewriteConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub load_balancer: Option<LoadBalancerConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub health_check: Option<HealthCheckConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub outlier_detection: Option<OutlierDetectionConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub decompression: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub security_headers: Option<bool>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub replacements: Vec<ContentReplacement>,
}

macro_rules! take_set {
	($out:ident, $route:ident, $($field:ident),+ $(,)?) => {
		$( if $route.$field.is_some() { $out.$field = $route.$field.clone(); } )+
	};
}

impl RouteFeatures {
	/// Non-zero merge: per-route values win when set; list fields append route entries after
	/// global ones; maps union with the route taking precedence per key.
	pub fn merge(global: &RouteFeatures, route: &RouteFeatures) -> RouteFeatures {
		let mut out = global.clone();
		take_set!(
			out, route, auth, rate_limit, spike_arrest, quota, circuit_breaker, retry_policy, cache,
			coalesce, idempotency, cors, csrf, compression, traffic_split, sticky, canary, blue_green,
			ab_test, versioning, transform, rules, waf, openapi, validation, mirror, websocket, grpc,
			graphql, ext_auth, signing, inbound_signing, ssrf, timeouts, max_body_size, response_limit,
			request_headers, response_headers, redirect, rewrite, load_balancer, health_check,
			outlier_detection, decompression, security_headers,
		);
		for (k, v) in &route.status_mapping {
			out.status_mapping.insert(*k, *v);
		}
		out
			.replacements
			.extend(route.replacements.iter().cloned());
		out
	}
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AuthConfig {
	pub required: bool,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub methods: Vec<AuthMethod>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub oauth: Option<OAuthConfig>,
	/// claim name -> header name; propagated to the backend after authentication.
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub claims_headers: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
	Jwt,
	ApiKey,
	Oauth,
	ExtAuth,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OAuthConfig {
	pub introspection_url: String,
	pub client_id: String,
	#[serde(skip_serializing)]
	pub client_secret: Option<SecretString>,
	#[serde(default = "default_introspection_timeout", with = "serde_dur")]
	pub timeout: Duration,
	#[serde(default)]
	pub cache_ttl_seconds: u64,
}

fn default_introspection_timeout() -> Duration {
	Duration::from_secs(5)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExtAuthConfig {
	pub url: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub copy_headers: Vec<String>,
	#[serde(default = "default_introspection_timeout", with = "serde_dur")]
	pub timeout: Duration,
	#[serde(default)]
	pub fail_open: bool,
}

/// Keying for limiters, quotas and sticky sessions: `ip`, `client_id`, `header:<name>`,
/// `cookie:<name>`, `jwt_claim:<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
	Ip,
	ClientId,
	Header(String),
	Cookie(String),
	JwtClaim(String),
}

impl Default for KeySource {
	fn default() -> Self {
		KeySource::Ip
	}
}

impl FromStr for KeySource {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ip" | "per_ip" => Ok(KeySource::Ip),
			"client_id" => Ok(KeySource::ClientId),
			other => match other.split_once(':') {
				Some(("header", n)) if !n.is_empty() => Ok(KeySource::Header(n.to_string())),
				Some(("cookie", n)) if !n.is_empty() => Ok(KeySource::Cookie(n.to_string())),
				Some(("jwt_claim", n)) if !n.is_empty() => Ok(KeySource::JwtClaim(n.to_string())),
				_ => Err(format!("invalid key selector: {other:?}")),
			},
		}
	}
}

impl std::fmt::Display for KeySource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			KeySource::Ip => write!(f, "ip"),
			KeySource::ClientId => write!(f, "client_id"),
			KeySource::Header(n) => write!(f, "header:{n}"),
			KeySource::Cookie(n) => write!(f, "cookie:{n}"),
			KeySource::JwtClaim(n) => write!(f, "jwt_claim:{n}"),
		}
	}
}

impl serde::Serialize for KeySource {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> serde::Deserialize<'de> for KeySource {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
	pub rate: u64,
	#[serde(with = "serde_dur")]
	pub period: Duration,
	pub burst: u64,
	pub algorithm: RateLimitAlgorithm,
	pub key: KeySource,
	pub mode: StoreMode,
	/// When set, rejected requests queue up to this long instead of failing immediately.
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub max_wait: Option<Duration>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub tiers: IndexMap<Strng, TierLimit>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tier_key: Option<KeySource>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub default_tier: Option<Strng>,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		RateLimitConfig {
			rate: 0,
			period: Duration::from_secs(1),
			burst: 0,
			algorithm: RateLimitAlgorithm::TokenBucket,
			key: KeySource::Ip,
			mode: StoreMode::Local,
			max_wait: None,
			tiers: IndexMap::new(),
			tier_key: None,
			default_tier: None,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
	#[default]
	TokenBucket,
	SlidingWindow,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TierLimit {
	pub rate: u64,
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub period: Option<Duration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub burst: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SpikeArrestConfig {
	/// Maximum sustained rate; requests are spaced at period/rate minimum intervals.
	pub rate: u64,
	#[serde(with = "serde_dur")]
	pub period: Duration,
	pub key: KeySource,
}

impl Default for SpikeArrestConfig {
	fn default() -> Self {
		SpikeArrestConfig {
			rate: 0,
			period: Duration::from_secs(1),
			key: KeySource::Ip,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
	pub limit: u64,
	pub period: QuotaPeriod,
	pub key: KeySource,
}

impl Default for QuotaConfig {
	fn default() -> Self {
		QuotaConfig {
			limit: 0,
			period: QuotaPeriod::Daily,
			key: KeySource::ClientId,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
	Hourly,
	#[default]
	Daily,
	Monthly,
	Yearly,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
	pub failure_threshold: u32,
	#[serde(with = "serde_dur")]
	pub timeout: Duration,
	/// Concurrent probes admitted while half-open.
	pub max_requests: u32,
	pub mode: StoreMode,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		CircuitBreakerConfig {
			failure_threshold: 5,
			timeout: Duration::from_secs(30),
			max_requests: 1,
			mode: StoreMode::Local,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
	pub max_retries: u32,
	#[serde(with = "serde_dur")]
	pub initial_backoff: Duration,
	pub backoff_multiplier: f64,
	#[serde(with = "serde_dur")]
	pub max_backoff: Duration,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub retryable_statuses: Vec<u16>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub retryable_methods: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub per_try_timeout: Option<Duration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub budget: Option<RetryBudgetConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub budget_pool: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hedging: Option<HedgingConfig>,
}

impl Default for RetryPolicyConfig {
	fn default() -> Self {
		RetryPolicyConfig {
			max_retries: 0,
			initial_backoff: Duration::from_millis(50),
			backoff_multiplier: 2.0,
			max_backoff: Duration::from_secs(5),
			retryable_statuses: vec![502, 503, 504],
			retryable_methods: vec!["GET".into(), "HEAD".into(), "OPTIONS".into()],
			per_try_timeout: None,
			budget: None,
			budget_pool: None,
			hedging: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryBudgetConfig {
	/// Allowed retries as a fraction of total requests in the window.
	pub ratio: f64,
	/// Retries always admitted regardless of the ratio.
	pub min_retries: u64,
	#[serde(with = "serde_dur")]
	pub window: Duration,
}

impl Default for RetryBudgetConfig {
	fn default() -> Self {
		RetryBudgetConfig {
			ratio: 0.2,
			min_retries: 10,
			window: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HedgingConfig {
	pub max_requests: u32,
	#[serde(with = "serde_dur")]
	pub delay: Duration,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	#[serde(with = "serde_dur")]
	pub ttl: Duration,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub methods: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub key_headers: Vec<String>,
	pub max_body_size: u64,
	pub max_size: usize,
	pub mode: StoreMode,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bucket: Option<Strng>,
	/// Emit ETag and honour If-None-Match / If-Modified-Since with 304.
	pub conditional: bool,
}

impl Default for CacheConfig {
	fn default() -> Self {
		CacheConfig {
			ttl: Duration::from_secs(60),
			methods: vec!["GET".into(), "HEAD".into()],
			key_headers: Vec::new(),
			max_body_size: 1 << 20,
			max_size: 1024,
			mode: StoreMode::Local,
			bucket: None,
			conditional: false,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheBucketConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_size: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
	#[serde(with = "serde_dur")]
	pub timeout: Duration,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub methods: Vec<String>,
}

impl Default for CoalesceConfig {
	fn default() -> Self {
		CoalesceConfig {
			timeout: Duration::from_secs(10),
			methods: vec!["GET".into(), "HEAD".into()],
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
	pub header_name: String,
	#[serde(with = "serde_dur")]
	pub ttl: Duration,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub methods: Vec<String>,
	pub scope: IdempotencyScope,
	/// Reject mutating requests missing the header with 422.
	pub enforce: bool,
	pub max_body_size: u64,
	pub mode: StoreMode,
}

impl Default for IdempotencyConfig {
	fn default() -> Self {
		IdempotencyConfig {
			header_name: "Idempotency-Key".to_string(),
			ttl: Duration::from_secs(24 * 3600),
			methods: vec!["POST".into(), "PUT".into(), "PATCH".into()],
			scope: IdempotencyScope::Client,
			enforce: false,
			max_body_size: 1 << 20,
			mode: StoreMode::Local,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
	Global,
	#[default]
	Client,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CorsConfig {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allowed_origins: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allowed_methods: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allowed_headers: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub exposed_headers: Vec<String>,
	pub allow_credentials: bool,
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub max_age: Option<Duration>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
	pub enabled: bool,
	/// Detection-only: log would-be rejections and continue.
	pub shadow: bool,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
	pub enabled: bool,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub algorithms: Vec<CompressionAlgorithm>,
	pub min_size: u64,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub content_types: Vec<String>,
}

impl Default for CompressionConfig {
	fn default() -> Self {
		CompressionConfig {
			enabled: true,
			algorithms: vec![CompressionAlgorithm::Gzip],
			min_size: 1024,
			content_types: vec![
				"text/".into(),
				"application/json".into(),
				"application/javascript".into(),
				"application/xml".into(),
			],
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
	Gzip,
	#[serde(rename = "br")]
	Brotli,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TrafficSplitConfig {
	pub groups: Vec<TrafficGroupConfig>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrafficGroupConfig {
	pub name: Strng,
	/// Percentage of traffic, 0-100. All group weights must sum to 100.
	pub weight: u32,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StickyConfig {
	pub cookie_name: String,
	#[serde(with = "serde_dur")]
	pub ttl: Duration,
}

impl Default for StickyConfig {
	fn default() -> Self {
		StickyConfig {
			cookie_name: "gw_group".to_string(),
			ttl: Duration::from_secs(3600),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CanaryConfig {
	/// Traffic group receiving the canary share.
	pub group: Strng,
	pub steps: Vec<CanaryStepConfig>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CanaryStepConfig {
	pub weight: u32,
	#[serde(default, skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub hold: Option<Duration>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlueGreenConfig {
	pub active: Strng,
	pub blue: Strng,
	pub green: Strng,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AbTestConfig {
	pub key: KeySource,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub groups: Vec<Strng>,
}

impl Default for AbTestConfig {
	fn default() -> Self {
		AbTestConfig {
			key: KeySource::Ip,
			groups: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VersioningConfig {
	pub strategy: VersioningStrategy,
	/// Header/query name, or path segment index for the path strategy.
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default_version: Option<Strng>,
	pub versions: IndexMap<Strng, Vec<BackendConfig>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningStrategy {
	Header,
	Path,
	Query,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TransformConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request: Option<BodyTransform>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response: Option<BodyTransform>,
}

/// JSON body transformation, applied in a fixed order:
/// allow/deny -> set -> add -> remove -> rename -> flatten -> template.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BodyTransform {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allow_fields: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub deny_fields: Vec<String>,
	/// Values are templates resolved against the request context.
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub set_fields: IndexMap<String, String>,
	/// Like set, but only when the field is absent.
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub add_fields: IndexMap<String, String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub remove_fields: Vec<String>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub rename_fields: IndexMap<String, String>,
	pub flatten: bool,
	/// Full-body minijinja template; replaces the body entirely.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub template: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RulesConfig {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub request: Vec<RuleConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub response: Vec<RuleConfig>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuleConfig {
	/// Expression over request variables, e.g. `$request.header.x-debug == "1"`.
	pub when: String,
	#[serde(flatten)]
	pub action: RuleAction,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
	Block {
		status: u16,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message: Option<String>,
	},
	Redirect {
		location: String,
		#[serde(default)]
		permanent: bool,
	},
	SetHeaders {
		headers: IndexMap<String, String>,
	},
	Rewrite {
		path: String,
	},
	Group {
		group: Strng,
	},
	Log {
		message: String,
	},
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WafConfig {
	pub mode: WafMode,
	#[serde(with = "serde_regex", skip_serializing_if = "Vec::is_empty")]
	pub deny_patterns: Vec<regex::Regex>,
	pub inspect_body: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WafMode {
	#[default]
	Block,
	Detect,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OpenApiRouteConfig {
	pub spec: Strng,
	#[serde(default)]
	pub validate_responses: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_schema: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MirrorConfig {
	pub backend: String,
	/// 0.0 - 1.0
	#[serde(default = "default_mirror_percentage")]
	pub percentage: f64,
}

fn default_mirror_percentage() -> f64 {
	1.0
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
	pub enabled: bool,
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
	pub enabled: bool,
	pub web: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GraphqlConfig {
	pub enabled: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_depth: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SigningConfig {
	pub algorithm: SigningAlgorithm,
	pub key_id: String,
	#[serde(skip_serializing)]
	pub secret: Option<SecretString>,
	/// Headers included in the canonical string, sorted at signing time.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub headers: Vec<String>,
	pub prefix: String,
}

impl Default for SigningConfig {
	fn default() -> Self {
		SigningConfig {
			algorithm: SigningAlgorithm::HmacSha256,
			key_id: String::new(),
			secret: None,
			headers: Vec::new(),
			prefix: "X-Gateway-".to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SigningAlgorithm {
	#[default]
	#[serde(rename = "hmac-sha256")]
	HmacSha256,
	#[serde(rename = "hmac-sha512")]
	HmacSha512,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InboundSigningConfig {
	#[serde(flatten)]
	pub signing: SigningConfig,
	/// Maximum clock skew accepted on the timestamp header.
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub max_skew: Option<Duration>,
	pub shadow: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SsrfConfig {
	pub enabled: bool,
	/// Private ranges explicitly permitted.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allow: Vec<IpNet>,
}

/// Per-route timeouts. Invariant (validated): header <= backend <= request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
	#[serde(with = "serde_dur")]
	pub request: Duration,
	#[serde(with = "serde_dur")]
	pub backend: Duration,
	#[serde(with = "serde_dur")]
	pub header: Duration,
}

impl Default for TimeoutConfig {
	fn default() -> Self {
		TimeoutConfig {
			request: Duration::from_secs(60),
			backend: Duration::from_secs(30),
			header: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HeaderModifierConfig {
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub set: IndexMap<String, String>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub add: IndexMap<String, String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub scheme: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub host: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prefix: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub host: Option<String>,
}

/// Literal text substitution applied to response bodies of matching content types.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContentReplacement {
	pub from: String,
	pub to: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub content_types: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
	pub policy: LoadBalancerPolicy,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hash_key: Option<HashKeyConfig>,
	/// Virtual nodes per backend on the consistent-hash ring.
	pub replicas: usize,
}

impl Default for LoadBalancerConfig {
	fn default() -> Self {
		LoadBalancerConfig {
			policy: LoadBalancerPolicy::RoundRobin,
			hash_key: None,
			replicas: 150,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerPolicy {
	#[default]
	RoundRobin,
	LeastConnections,
	ConsistentHash,
	LeastResponseTime,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "name")]
pub enum HashKeyConfig {
	Header(String),
	Cookie(String),
	Path,
	Ip,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
	pub path: String,
	#[serde(with = "serde_dur")]
	pub interval: Duration,
	#[serde(with = "serde_dur")]
	pub timeout: Duration,
	pub healthy_after: u32,
	pub unhealthy_after: u32,
	/// "2xx" or "200-299" forms.
	pub expected_status: StatusRange,
}

impl Default for HealthCheckConfig {
	fn default() -> Self {
		HealthCheckConfig {
			path: "/healthz".to_string(),
			interval: Duration::from_secs(10),
			timeout: Duration::from_secs(2),
			healthy_after: 2,
			unhealthy_after: 3,
			expected_status: StatusRange::default(),
		}
	}
}

/// An inclusive status range parsed from `"2xx"` or `"200-299"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRange {
	pub start: u16,
	pub end: u16,
}

impl Default for StatusRange {
	fn default() -> Self {
		StatusRange {
			start: 200,
			end: 299,
		}
	}
}

impl StatusRange {
	pub fn contains(&self, status: u16) -> bool {
		status >= self.start && status <= self.end
	}
}

impl FromStr for StatusRange {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if let Some(class) = s.strip_suffix("xx") {
			let c: u16 = class
				.parse()
				.map_err(|_| format!("invalid status class: {s:?}"))?;
			if !(1..=5).contains(&c) {
				return Err(format!("invalid status class: {s:?}"));
			}
			return Ok(StatusRange {
				start: c * 100,
				end: c * 100 + 99,
			});
		}
		if let Some((lo, hi)) = s.split_once('-') {
			let start: u16 = lo.parse().map_err(|_| format!("invalid status: {lo:?}"))?;
			let end: u16 = hi.parse().map_err(|_| format!("invalid status: {hi:?}"))?;
			if start > end {
				return Err(format!("status range start exceeds end: {s:?}"));
			}
			return Ok(StatusRange { start, end });
		}
		let only: u16 = s.parse().map_err(|_| format!("invalid status: {s:?}"))?;
		Ok(StatusRange {
			start: only,
			end: only,
		})
	}
}

impl std::fmt::Display for StatusRange {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.start == self.end {
			write!(f, "{}", self.start)
		} else {
			write!(f, "{}-{}", self.start, self.end)
		}
	}
}

impl serde::Serialize for StatusRange {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> serde::Deserialize<'de> for StatusRange {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		use serde::Deserialize;
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OutlierDetectionConfig {
	#[serde(with = "serde_dur")]
	pub interval: Duration,
	#[serde(with = "serde_dur")]
	pub window: Duration,
	pub min_requests: u64,
	pub error_rate_threshold: f64,
	pub error_rate_multiplier: f64,
	pub latency_multiplier: f64,
	#[serde(with = "serde_dur")]
	pub base_ejection_duration: Duration,
	#[serde(with = "serde_dur")]
	pub max_ejection_duration: Duration,
	pub max_ejection_percent: u32,
}

impl Default for OutlierDetectionConfig {
	fn default() -> Self {
		OutlierDetectionConfig {
			interval: Duration::from_secs(10),
			window: Duration::from_secs(60),
			min_requests: 20,
			error_rate_threshold: 0.5,
			error_rate_multiplier: 3.0,
			latency_multiplier: 5.0,
			base_ejection_duration: Duration::from_secs(30),
			max_ejection_duration: Duration::from_secs(300),
			max_ejection_percent: 50,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_source_parses_all_forms() {
		assert_eq!(KeySource::from_str("ip").unwrap(), KeySource::Ip);
		assert_eq!(
			KeySource::from_str("client_id").unwrap(),
			KeySource::ClientId
		);
		assert_eq!(
			KeySource::from_str("header:X-Tier").unwrap(),
			KeySource::Header("X-Tier".into())
		);
		assert_eq!(
			KeySource::from_str("cookie:session").unwrap(),
			KeySource::Cookie("session".into())
		);
		assert_eq!(
			KeySource::from_str("jwt_claim:sub").unwrap(),
			KeySource::JwtClaim("sub".into())
		);
		assert!(KeySource::from_str("header:").is_err());
		assert!(KeySource::from_str("nope").is_err());
	}

	#[test]
	fn status_range_parses_class_and_range() {
		let r: StatusRange = "2xx".parse().unwrap();
		assert!(r.contains(200) && r.contains(299) && !r.contains(300));
		let r: StatusRange = "200-204".parse().unwrap();
		assert!(r.contains(204) && !r.contains(205));
		let r: StatusRange = "418".parse().unwrap();
		assert!(r.contains(418) && !r.contains(417));
		assert!("6xx".parse::<StatusRange>().is_err());
		assert!("300-200".parse::<StatusRange>().is_err());
	}

	#[test]
	fn merge_prefers_route_and_appends_lists() {
		let mut global = RouteFeatures::default();
		global.max_body_size = Some(1024);
		global.status_mapping.insert(500, 502);
		global.replacements.push(ContentReplacement {
			from: "a".into(),
			to: "b".into(),
			content_types: vec![],
		});
		let mut route = RouteFeatures::default();
		route.max_body_size = Some(2048);
		route.status_mapping.insert(500, 503);
		route.replacements.push(ContentReplacement {
			from: "c".into(),
			to: "d".into(),
			content_types: vec![],
		});

		let merged = RouteFeatures::merge(&global, &route);
		assert_eq!(merged.max_body_size, Some(2048));
		assert_eq!(merged.status_mapping.get(&500), Some(&503));
		assert_eq!(merged.replacements.len(), 2);
	}

	#[test]
	fn merge_with_default_overlay_is_identity() {
		let mut global = RouteFeatures::default();
		global.max_body_size = Some(1024);
		global.response_limit = Some(4096);
		let merged = RouteFeatures::merge(&global, &RouteFeatures::default());
		assert_eq!(merged.max_body_size, Some(1024));
		assert_eq!(merged.response_limit, Some(4096));
	}
}
