use std::path::PathBuf;

use indexmap::IndexMap;
use ipnet::IpNet;
use secrecy::SecretString;

use crate::types::features::*;
use crate::types::listener::ListenerConfig;
use crate::types::route::{RouteConfig, TcpRouteConfig, UdpRouteConfig};
use crate::*;

/// The root configuration record. Every node is purely data; the validator guarantees
/// post-load invariants so the runtime never re-checks them.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
	pub server: ServerConfig,
	pub admin: AdminConfig,
	pub logging: LoggingConfig,
	pub registry: RegistryConfig,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub redis: Option<RedisConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub listeners: Vec<ListenerConfig>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub upstreams: IndexMap<Strng, UpstreamConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub routes: Vec<RouteConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub tcp_routes: Vec<TcpRouteConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub udp_routes: Vec<UdpRouteConfig>,
	pub security: SecurityConfig,
	/// Global feature defaults. Per-route blocks merge over these (non-zero merge).
	pub defaults: RouteFeatures,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub budget_pools: IndexMap<Strng, RetryBudgetConfig>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub cache_buckets: IndexMap<Strng, CacheBucketConfig>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub tenants: IndexMap<Strng, TenantConfig>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub tiers: IndexMap<Strng, TierConfig>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub openapi_specs: IndexMap<Strng, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub host: String,
	pub port: u16,
	#[serde(with = "serde_dur")]
	pub read_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub write_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub idle_timeout: Duration,
	pub max_header_bytes: usize,
	/// Readiness fails for this long before listeners stop accepting.
	#[serde(with = "serde_dur")]
	pub drain_delay: Duration,
	/// How long in-flight requests may take to finish after accept stops.
	#[serde(with = "serde_dur")]
	pub shutdown_timeout: Duration,
	pub timeouts: TimeoutConfig,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			host: String::new(),
			port: 8080,
			read_timeout: Duration::from_secs(30),
			write_timeout: Duration::from_secs(30),
			idle_timeout: Duration::from_secs(60),
			max_header_bytes: 1 << 20,
			drain_delay: Duration::from_secs(5),
			shutdown_timeout: Duration::from_secs(30),
			timeouts: TimeoutConfig::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AdminConfig {
	pub enabled: bool,
	pub port: u16,
	pub pprof: bool,
}

impl Default for AdminConfig {
	fn default() -> Self {
		AdminConfig {
			enabled: true,
			port: 8081,
			pprof: false,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	pub level: String,
	pub format: LogFormat,
	pub access_log: bool,
	/// Fraction of requests also emitted as audit records, in [0, 1].
	pub audit_sample_rate: f64,
	pub rotation: RotationConfig,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		LoggingConfig {
			level: "info".to_string(),
			format: LogFormat::Text,
			access_log: true,
			audit_sample_rate: 0.0,
			rotation: RotationConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RotationConfig {
	pub max_size_mb: u64,
	pub max_backups: u32,
	pub max_age_days: u32,
	pub compress: bool,
}

impl Default for RotationConfig {
	fn default() -> Self {
		RotationConfig {
			max_size_mb: 100,
			max_backups: 3,
			max_age_days: 28,
			compress: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
	#[serde(rename = "type")]
	pub kind: RegistryKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub consul_address: Option<String>,
	/// Static service table for the memory registry.
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub services: IndexMap<Strng, Vec<String>>,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		RegistryConfig {
			kind: RegistryKind::Memory,
			consul_address: None,
			services: IndexMap::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
	#[default]
	Memory,
	Consul,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RedisConfig {
	pub address: String,
	#[serde(default = "default_redis_pool")]
	pub pool_size: usize,
	#[serde(default = "default_redis_timeout", with = "serde_dur")]
	pub timeout: Duration,
}

fn default_redis_pool() -> usize {
	4
}
fn default_redis_timeout() -> Duration {
	Duration::from_millis(500)
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
	pub trusted_proxies: TrustedProxiesConfig,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allowed_hosts: Vec<String>,
	pub https_redirect: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ip_filter: Option<IpFilterConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ip_blocklist: Option<BlocklistConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub geo: Option<GeoConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bot: Option<BotConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub maintenance: Option<MaintenanceConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub load_shedding: Option<LoadSheddingConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token_revocation: Option<RevocationConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_keys: Option<ApiKeyConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub jwt: Option<JwtConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub nonce: Option<NonceConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub encryption: Option<EncryptionConfig>,
}

/// At-rest encryption settings for stored envelopes. The key is validated at load time;
/// `aes-gcm-256` requires a base64 key decoding to exactly 32 bytes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncryptionConfig {
	#[serde(default = "default_encryption_algorithm")]
	pub algorithm: String,
	#[serde(default, skip_serializing)]
	pub key: Option<SecretString>,
}

fn default_encryption_algorithm() -> String {
	"aes-gcm-256".to_string()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrustedProxiesConfig {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub cidrs: Vec<IpNet>,
	pub max_hops: usize,
}

impl Default for TrustedProxiesConfig {
	fn default() -> Self {
		TrustedProxiesConfig {
			cidrs: Vec::new(),
			max_hops: 4,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IpFilterConfig {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allow: Vec<IpNet>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub deny: Vec<IpNet>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
	#[serde(rename = "static", skip_serializing_if = "Vec::is_empty")]
	pub static_cidrs: Vec<IpNet>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub feeds: Vec<FeedConfig>,
	pub action: BlockAction,
}

impl Default for BlocklistConfig {
	fn default() -> Self {
		BlocklistConfig {
			static_cidrs: Vec::new(),
			feeds: Vec::new(),
			action: BlockAction::Block,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockAction {
	#[default]
	Block,
	Log,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FeedConfig {
	pub url: String,
	#[serde(default)]
	pub format: FeedFormat,
	#[serde(default = "default_feed_refresh", with = "serde_dur")]
	pub refresh_interval: Duration,
}

fn default_feed_refresh() -> Duration {
	Duration::from_secs(300)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
	#[default]
	Text,
	Json,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GeoConfig {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allow_countries: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub deny_countries: Vec<String>,
	/// Trusted header carrying the resolved country code (e.g. CF-IPCountry).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub country_header: Option<String>,
	/// Static CIDR to country-code table, consulted when no header is configured.
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub networks: IndexMap<String, Vec<IpNet>>,
	pub shadow: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BotConfig {
	/// User-agent patterns rejected outright.
	#[serde(with = "serde_regex", skip_serializing_if = "Vec::is_empty")]
	pub deny_patterns: Vec<regex::Regex>,
	/// User-agent patterns always admitted (checked before deny).
	#[serde(with = "serde_regex", skip_serializing_if = "Vec::is_empty")]
	pub allow_patterns: Vec<regex::Regex>,
	pub block_empty_user_agent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
	pub enabled: bool,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub bypass_paths: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub bypass_ips: Vec<IpNet>,
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoadSheddingConfig {
	pub enabled: bool,
	/// Hard cap on concurrently served requests; 0 disables the cap.
	pub max_concurrency: u64,
	/// AIMD concurrency limiting on top of the hard cap.
	pub adaptive: bool,
	pub min_limit: u64,
	#[serde(with = "serde_dur")]
	pub latency_target: Duration,
}

impl Default for LoadSheddingConfig {
	fn default() -> Self {
		LoadSheddingConfig {
			enabled: false,
			max_concurrency: 0,
			adaptive: false,
			min_limit: 16,
			latency_target: Duration::from_millis(250),
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
	pub mode: StoreMode,
	#[serde(with = "serde_dur")]
	pub default_ttl: Duration,
}

impl Default for RevocationConfig {
	fn default() -> Self {
		RevocationConfig {
			mode: StoreMode::Local,
			default_ttl: Duration::from_secs(24 * 3600),
		}
	}
}

/// Where a feature keeps its state: in-process or shared through Redis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
	#[default]
	Local,
	Distributed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
	pub header: String,
	/// key value -> client id
	#[serde(serialize_with = "ser_key_map")]
	pub keys: IndexMap<String, Strng>,
}

fn ser_key_map<S: serde::Serializer>(
	t: &IndexMap<String, Strng>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	use serde::ser::SerializeMap;
	let mut map = serializer.serialize_map(Some(t.len()))?;
	for client in t.values() {
		map.serialize_entry("<redacted>", client)?;
	}
	map.end()
}

impl Default for ApiKeyConfig {
	fn default() -> Self {
		ApiKeyConfig {
			header: "X-API-Key".to_string(),
			keys: IndexMap::new(),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct JwtConfig {
	pub algorithm: String,
	#[serde(skip_serializing)]
	pub secret: Option<SecretString>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub jwks_file: Option<PathBuf>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub issuer: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub audiences: Vec<String>,
}

impl Default for JwtConfig {
	fn default() -> Self {
		JwtConfig {
			algorithm: "HS256".to_string(),
			secret: None,
			jwks_file: None,
			issuer: None,
			audiences: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NonceConfig {
	pub header: String,
	#[serde(with = "serde_dur")]
	pub ttl: Duration,
}

impl Default for NonceConfig {
	fn default() -> Self {
		NonceConfig {
			header: "X-Nonce".to_string(),
			ttl: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
	pub backends: Vec<BackendConfig>,
	pub load_balancer: LoadBalancerConfig,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub health_check: Option<HealthCheckConfig>,
	pub transport: TransportConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendConfig {
	pub url: String,
	#[serde(default = "default_backend_weight")]
	pub weight: usize,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub health_check: Option<HealthCheckConfig>,
}

fn default_backend_weight() -> usize {
	1
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TransportConfig {
	pub max_idle_conns_per_host: usize,
	#[serde(with = "serde_dur")]
	pub idle_conn_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub dial_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub tls_handshake_timeout: Duration,
	pub http2: bool,
}

impl Default for TransportConfig {
	fn default() -> Self {
		TransportConfig {
			max_idle_conns_per_host: 32,
			idle_conn_timeout: Duration::from_secs(90),
			dial_timeout: Duration::from_secs(10),
			tls_handshake_timeout: Duration::from_secs(10),
			http2: false,
		}
	}
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TenantConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tier: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub quota: Option<QuotaConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TierConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rate: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub period: Option<Duration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub burst: Option<u64>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let c = Config::default();
		assert_eq!(c.server.port, 8080);
		assert_eq!(c.admin.port, 8081);
		assert_eq!(c.server.read_timeout, Duration::from_secs(30));
		assert_eq!(c.server.write_timeout, Duration::from_secs(30));
		assert_eq!(c.server.idle_timeout, Duration::from_secs(60));
		assert_eq!(c.registry.kind, RegistryKind::Memory);
		assert_eq!(c.logging.rotation.max_size_mb, 100);
		assert_eq!(c.logging.rotation.max_backups, 3);
		assert_eq!(c.logging.rotation.max_age_days, 28);
		assert!(c.logging.rotation.compress);
	}

	#[test]
	fn api_key_header_defaults() {
		let a = ApiKeyConfig::default();
		assert_eq!(a.header, "X-API-Key");
	}

	#[test]
	fn jwt_algorithm_defaults_to_hs256() {
		let j = JwtConfig::default();
		assert_eq!(j.algorithm, "HS256");
	}
}
