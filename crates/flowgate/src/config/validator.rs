use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::ExposeSecret;

use crate::config::ConfigError;
use crate::types::config::StoreMode;
use crate::types::features::*;
use crate::types::listener::ListenerProtocol;
use crate::types::route::RouteConfig;
use crate::*;

type RouteCheck = fn(&Config, &RouteConfig) -> Result<(), String>;

/// Route-scoped checks, invoked in order. Each closure is independently testable; the first
/// failure is returned with the full scope path.
const ROUTE_CHECKS: &[(&str, RouteCheck)] = &[
	("basics", check_basics),
	("exclusions", check_exclusions),
	("rate_limiting", check_rate_limiting),
	("resilience", check_resilience),
	("network", check_network_features),
	("transforms", check_transforms),
	("references", check_references),
	("outlier_detection", check_outlier_detection),
	("security", check_security_features),
	("traffic", check_traffic_features),
];

pub fn validate(config: &Config) -> Result<(), ConfigError> {
	check_server(config)?;
	check_listeners(config)?;
	check_route_ids(config)?;
	check_upstreams(config)?;
	check_l4_routes(config)?;
	check_secrets(config)?;
	check_shared_objects(config)?;
	check_security_globals(config)?;

	for route in &config.routes {
		for (_, check) in ROUTE_CHECKS {
			check(config, route)
				.map_err(|reason| ConfigError::invalid(format!("route {}", route.id), reason))?;
		}
	}
	Ok(())
}

fn check_server(config: &Config) -> Result<(), ConfigError> {
	if config.server.port == 0 {
		return Err(ConfigError::invalid("server", "port must be in [1, 65535]"));
	}
	let t = &config.server.timeouts;
	if !(t.header <= t.backend && t.backend <= t.request) {
		return Err(ConfigError::invalid(
			"server",
			"timeouts must satisfy header <= backend <= request",
		));
	}
	let rate = config.logging.audit_sample_rate;
	if !(0.0..=1.0).contains(&rate) {
		return Err(ConfigError::invalid(
			"logging",
			"audit_sample_rate must be in [0, 1]",
		));
	}
	Ok(())
}

fn check_listeners(config: &Config) -> Result<(), ConfigError> {
	let mut seen = HashSet::new();
	for l in &config.listeners {
		if !seen.insert(l.id.clone()) {
			return Err(ConfigError::invalid(
				"",
				format!("duplicate listener id: {}", l.id),
			));
		}
		l.socket_addr()
			.map_err(|e| ConfigError::invalid(format!("listener {}", l.id), e.to_string()))?;
		if l.protocol == ListenerProtocol::Http && l.tls.is_none() && l.http.http3 {
			return Err(ConfigError::invalid(
				format!("listener {}", l.id),
				"http3 requires tls",
			));
		}
		if l.protocol != ListenerProtocol::Http && l.tls.is_some() {
			return Err(ConfigError::invalid(
				format!("listener {}", l.id),
				"tls is only supported on http listeners",
			));
		}
	}
	Ok(())
}

fn check_route_ids(config: &Config) -> Result<(), ConfigError> {
	let mut seen = HashSet::new();
	for route in &config.routes {
		if route.id.is_empty() {
			return Err(ConfigError::invalid("", "route id must not be empty"));
		}
		if !seen.insert(route.id.clone()) {
			return Err(ConfigError::invalid(
				"",
				format!("duplicate route id: {}", route.id),
			));
		}
	}
	for route in config.tcp_routes.iter().map(|r| &r.id).chain(
		config.udp_routes.iter().map(|r| &r.id),
	) {
		if !seen.insert(route.clone()) {
			return Err(ConfigError::invalid(
				"",
				format!("duplicate route id: {route}"),
			));
		}
	}
	Ok(())
}

fn check_upstreams(config: &Config) -> Result<(), ConfigError> {
	for (name, up) in &config.upstreams {
		let scope = format!("upstream {name}");
		if up.backends.is_empty() {
			return Err(ConfigError::invalid(scope, "at least one backend required"));
		}
		for b in &up.backends {
			parse_backend_url(&b.url).map_err(|e| ConfigError::invalid(scope.clone(), e))?;
		}
		check_lb(&up.load_balancer).map_err(|e| ConfigError::invalid(scope.clone(), e))?;
		if let Some(hc) = &up.health_check {
			check_health(hc).map_err(|e| ConfigError::invalid(scope.clone(), e))?;
		}
	}
	Ok(())
}

fn check_l4_routes(config: &Config) -> Result<(), ConfigError> {
	let listener = |id: &Strng| config.listeners.iter().find(|l| &l.id == id);
	for r in &config.tcp_routes {
		let scope = format!("tcp_route {}", r.id);
		match listener(&r.listener) {
			None => {
				return Err(ConfigError::invalid(
					scope,
					format!("unknown listener: {}", r.listener),
				));
			},
			Some(l) if l.protocol != ListenerProtocol::Tcp => {
				return Err(ConfigError::invalid(
					scope,
					format!("listener {} is not a tcp listener", r.listener),
				));
			},
			_ => {},
		}
		if r.backends.is_empty() {
			return Err(ConfigError::invalid(scope, "at least one backend required"));
		}
	}
	for r in &config.udp_routes {
		let scope = format!("udp_route {}", r.id);
		match listener(&r.listener) {
			None => {
				return Err(ConfigError::invalid(
					scope,
					format!("unknown listener: {}", r.listener),
				));
			},
			Some(l) if l.protocol != ListenerProtocol::Udp => {
				return Err(ConfigError::invalid(
					scope,
					format!("listener {} is not a udp listener", r.listener),
				));
			},
			_ => {},
		}
		if r.backends.is_empty() {
			return Err(ConfigError::invalid(scope, "at least one backend required"));
		}
	}
	Ok(())
}

fn check_secrets(config: &Config) -> Result<(), ConfigError> {
	if let Some(jwt) = &config.security.jwt {
		match jwt.algorithm.as_str() {
			"HS256" | "HS384" | "HS512" => {
				if let Some(secret) = &jwt.secret {
					let raw = secret.expose_secret();
					let decoded = STANDARD
						.decode(raw)
						.unwrap_or_else(|_| raw.as_bytes().to_vec());
					if decoded.len() < 32 {
						return Err(ConfigError::invalid(
							"security.jwt",
							"secret must decode to at least 32 bytes",
						));
					}
				}
			},
			"RS256" | "RS384" | "RS512" | "ES256" | "ES384" => {
				if jwt.jwks_file.is_none() {
					return Err(ConfigError::invalid(
						"security.jwt",
						format!("algorithm {} requires jwks_file", jwt.algorithm),
					));
				}
			},
			other => {
				return Err(ConfigError::invalid(
					"security.jwt",
					format!("unsupported algorithm: {other}"),
				));
			},
		}
	}
	if let Some(enc) = &config.security.encryption {
		match enc.algorithm.as_str() {
			"aes-gcm-256" => {
				let Some(key) = &enc.key else {
					return Err(ConfigError::invalid("security.encryption", "key is required"));
				};
				let decoded = STANDARD
					.decode(key.expose_secret())
					.map_err(|_| ConfigError::invalid("security.encryption", "key must be base64"))?;
				if decoded.len() != 32 {
					return Err(ConfigError::invalid(
						"security.encryption",
						format!(
							"aes-gcm-256 key must decode to exactly 32 bytes, got {}",
							decoded.len()
						),
					));
				}
			},
			other => {
				return Err(ConfigError::invalid(
					"security.encryption",
					format!("unsupported algorithm: {other}"),
				));
			},
		}
	}
	Ok(())
}

fn check_shared_objects(config: &Config) -> Result<(), ConfigError> {
	for (name, pool) in &config.budget_pools {
		check_budget(pool).map_err(|e| ConfigError::invalid(format!("budget_pool {name}"), e))?;
	}
	for (name, spec) in &config.openapi_specs {
		if spec.as_os_str().is_empty() {
			return Err(ConfigError::invalid(
				format!("openapi_spec {name}"),
				"path must not be empty",
			));
		}
	}
	for (name, tenant) in &config.tenants {
		if let Some(tier) = &tenant.tier
			&& !config.tiers.contains_key(tier)
		{
			return Err(ConfigError::invalid(
				format!("tenant {name}"),
				format!("unknown tier: {tier}"),
			));
		}
	}
	Ok(())
}

fn check_security_globals(config: &Config) -> Result<(), ConfigError> {
	if let Some(bl) = &config.security.ip_blocklist {
		for feed in &bl.feeds {
			let uri: http::Uri = feed
				.url
				.parse()
				.map_err(|_| ConfigError::invalid("ip_blocklist", format!("invalid feed url: {}", feed.url)))?;
			match uri.scheme_str() {
				Some("http") | Some("https") => {},
				_ => {
					return Err(ConfigError::invalid(
						"ip_blocklist",
						format!("feed url must be http(s): {}", feed.url),
					));
				},
			}
			if feed.refresh_interval < Duration::from_secs(1) {
				return Err(ConfigError::invalid(
					"ip_blocklist",
					"feed refresh_interval must be at least 1s",
				));
			}
		}
	}
	if let Some(rev) = &config.security.token_revocation {
		require_redis(config, rev.mode, "security.token_revocation")?;
	}
	Ok(())
}

fn require_redis(config: &Config, mode: StoreMode, scope: &str) -> Result<(), ConfigError> {
	if mode == StoreMode::Distributed
		&& config.redis.as_ref().is_none_or(|r| r.address.is_empty())
	{
		return Err(ConfigError::invalid(
			scope,
			"mode distributed requires redis.address",
		));
	}
	Ok(())
}

fn parse_backend_url(url: &str) -> Result<(), String> {
	let uri: http::Uri = url
		.parse()
		.map_err(|_| format!("invalid backend url: {url}"))?;
	match uri.scheme_str() {
		Some("http") | Some("https") => {},
		_ => return Err(format!("backend url must be http(s): {url}")),
	}
	if uri.host().is_none() {
		return Err(format!("backend url must have a host: {url}"));
	}
	Ok(())
}

fn check_lb(lb: &LoadBalancerConfig) -> Result<(), String> {
	if lb.policy == LoadBalancerPolicy::ConsistentHash && lb.hash_key.is_none() {
		return Err("load_balancer: consistent_hash requires hash_key".to_string());
	}
	if lb.replicas == 0 {
		return Err("load_balancer: replicas must be > 0".to_string());
	}
	Ok(())
}

fn check_health(hc: &HealthCheckConfig) -> Result<(), String> {
	if hc.timeout > hc.interval {
		return Err("health_check: timeout must not exceed interval".to_string());
	}
	if hc.healthy_after == 0 || hc.unhealthy_after == 0 {
		return Err("health_check: healthy_after and unhealthy_after must be > 0".to_string());
	}
	if !hc.path.starts_with('/') {
		return Err("health_check: path must start with '/'".to_string());
	}
	Ok(())
}

fn check_budget(b: &RetryBudgetConfig) -> Result<(), String> {
	if b.window.is_zero() {
		return Err("budget.window must be > 0".to_string());
	}
	if !(b.ratio > 0.0 && b.ratio <= 1.0) {
		return Err("budget.ratio must be in (0, 1]".to_string());
	}
	Ok(())
}

// ---- per-route checks, in pipeline order ----

fn check_basics(_config: &Config, route: &RouteConfig) -> Result<(), String> {
	if !route.path.starts_with('/') {
		return Err("path must start with '/'".to_string());
	}
	let families = route.handler_families();
	match families.len() {
		0 => Err("route must select exactly one handler".to_string()),
		1 => Ok(()),
		_ => Err(format!(
			"handler selectors are mutually exclusive: {}",
			families.join(", ")
		)),
	}?;
	for m in &route.methods {
		http::Method::from_bytes(m.as_bytes()).map_err(|_| format!("invalid method: {m}"))?;
	}
	if route.strip_prefix && !route.path_prefix {
		return Err("strip_prefix requires path_prefix".to_string());
	}
	for b in &route.backends {
		parse_backend_url(&b.url)?;
	}
	if let Some(t) = &route.features.timeouts
		&& !(t.header <= t.backend && t.backend <= t.request)
	{
		return Err("timeouts must satisfy header <= backend <= request".to_string());
	}
	Ok(())
}

fn check_exclusions(_config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	if route.passthrough {
		let body_features: &[(&str, bool)] = &[
			("transform", f.transform.is_some()),
			("validation", f.validation.is_some()),
			("openapi", f.openapi.is_some()),
			("compression", f.compression.is_some()),
			("idempotency", f.idempotency.is_some()),
			("cache", f.cache.is_some()),
			("replacements", !f.replacements.is_empty()),
			(
				"waf body inspection",
				f.waf.as_ref().is_some_and(|w| w.inspect_body),
			),
		];
		for (name, set) in body_features {
			if *set {
				return Err(format!("passthrough excludes body-processing feature {name}"));
			}
		}
	}
	if route.echo {
		let backend_features: &[(&str, bool)] = &[
			("retry_policy", f.retry_policy.is_some()),
			("circuit_breaker", f.circuit_breaker.is_some()),
			("mirror", f.mirror.is_some()),
			("signing", f.signing.is_some()),
			("traffic_split", f.traffic_split.is_some()),
			("canary", f.canary.is_some()),
			("blue_green", f.blue_green.is_some()),
			("versioning", f.versioning.is_some()),
			("load_balancer", f.load_balancer.is_some()),
			("health_check", f.health_check.is_some()),
			("outlier_detection", f.outlier_detection.is_some()),
		];
		for (name, set) in backend_features {
			if *set {
				return Err(format!("echo excludes backend feature {name}"));
			}
		}
	}
	if f.canary.is_some() && f.blue_green.is_some() {
		return Err("canary and blue_green are mutually exclusive".to_string());
	}
	if f.canary.is_some() && f.traffic_split.is_none() {
		return Err("canary requires traffic_split".to_string());
	}
	if f.sticky.is_some() && f.traffic_split.is_none() {
		return Err("sticky requires traffic_split".to_string());
	}
	if f.versioning.is_some() && (!route.backends.is_empty() || f.traffic_split.is_some()) {
		return Err("versioning excludes top-level backends and traffic_split".to_string());
	}
	if let Some(lb) = &f.load_balancer
		&& lb.policy != LoadBalancerPolicy::RoundRobin
		&& f.traffic_split.is_some()
	{
		return Err("traffic_split requires round_robin load_balancer".to_string());
	}
	if let Some(rp) = &f.retry_policy
		&& rp.hedging.is_some()
		&& rp.max_retries > 0
	{
		return Err("retry_policy.hedging and max_retries are mutually exclusive".to_string());
	}
	Ok(())
}

fn check_rate_limiting(config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	if let Some(rl) = &f.rate_limit {
		if rl.rate == 0 {
			return Err("rate_limit.rate must be > 0".to_string());
		}
		if rl.period.is_zero() {
			return Err("rate_limit.period must be > 0".to_string());
		}
		require_redis(config, rl.mode, "")
			.map_err(|_| "rate_limit: mode distributed requires redis.address".to_string())?;
		if !rl.tiers.is_empty() && rl.tier_key.is_none() {
			return Err("rate_limit.tiers requires tier_key".to_string());
		}
		if let Some(dflt) = &rl.default_tier
			&& !rl.tiers.contains_key(dflt)
			&& !config.tiers.contains_key(dflt)
		{
			return Err(format!("rate_limit.default_tier unknown: {dflt}"));
		}
	}
	if let Some(sa) = &f.spike_arrest {
		if sa.rate == 0 {
			return Err("spike_arrest.rate must be > 0".to_string());
		}
		if sa.period.is_zero() {
			return Err("spike_arrest.period must be > 0".to_string());
		}
	}
	if let Some(q) = &f.quota
		&& q.limit == 0
	{
		return Err("quota.limit must be > 0".to_string());
	}
	Ok(())
}

fn check_resilience(config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	if let Some(cb) = &f.circuit_breaker {
		if cb.failure_threshold == 0 {
			return Err("circuit_breaker.failure_threshold must be > 0".to_string());
		}
		if cb.max_requests == 0 {
			return Err("circuit_breaker.max_requests must be > 0".to_string());
		}
		require_redis(config, cb.mode, "")
			.map_err(|_| "circuit_breaker: mode distributed requires redis.address".to_string())?;
	}
	if let Some(rp) = &f.retry_policy {
		if rp.backoff_multiplier < 1.0 {
			return Err("retry_policy.backoff_multiplier must be >= 1".to_string());
		}
		if rp.budget.is_some() && rp.budget_pool.is_some() {
			return Err("retry_policy.budget and budget_pool are mutually exclusive".to_string());
		}
		if let Some(b) = &rp.budget {
			check_budget(b).map_err(|e| format!("retry_policy.{e}"))?;
		}
		for s in &rp.retryable_statuses {
			http::StatusCode::from_u16(*s).map_err(|_| format!("invalid retryable status: {s}"))?;
		}
		if let Some(h) = &rp.hedging
			&& h.max_requests < 2
		{
			return Err("retry_policy.hedging.max_requests must be >= 2".to_string());
		}
	}
	if let Some(c) = &f.cache {
		if c.max_size == 0 {
			return Err("cache.max_size must be > 0".to_string());
		}
		require_redis(config, c.mode, "")
			.map_err(|_| "cache: mode distributed requires redis.address".to_string())?;
	}
	if let Some(i) = &f.idempotency {
		if i.header_name.is_empty() {
			return Err("idempotency.header_name must not be empty".to_string());
		}
		require_redis(config, i.mode, "")
			.map_err(|_| "idempotency: mode distributed requires redis.address".to_string())?;
	}
	if let Some(co) = &f.coalesce
		&& co.timeout.is_zero()
	{
		return Err("coalesce.timeout must be > 0".to_string());
	}
	Ok(())
}

fn check_network_features(_config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	if let Some(m) = &f.mirror {
		if !(0.0..=1.0).contains(&m.percentage) {
			return Err("mirror.percentage must be in [0, 1]".to_string());
		}
		parse_backend_url(&m.backend).map_err(|e| format!("mirror: {e}"))?;
	}
	if let Some(lb) = &f.load_balancer {
		check_lb(lb)?;
	}
	if let Some(hc) = &f.health_check {
		check_health(hc)?;
	}
	if let Some(s) = &f.signing {
		if s.secret.is_none() {
			return Err("signing.secret is required".to_string());
		}
		if s.key_id.is_empty() {
			return Err("signing.key_id is required".to_string());
		}
	}
	Ok(())
}

fn check_transforms(_config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	if let Some(t) = &f.transform {
		for bt in [t.request.as_ref(), t.response.as_ref()].into_iter().flatten() {
			if !bt.allow_fields.is_empty() && !bt.deny_fields.is_empty() {
				return Err("transform: allow_fields and deny_fields are mutually exclusive".to_string());
			}
			for (tpl_key, tpl) in bt.set_fields.iter().chain(bt.add_fields.iter()) {
				crate::expr::Template::compile(tpl)
					.map_err(|e| format!("transform.set_fields.{tpl_key}: {e}"))?;
			}
			if let Some(tpl) = &bt.template {
				crate::expr::Template::compile(tpl).map_err(|e| format!("transform.template: {e}"))?;
			}
		}
	}
	if let Some(rules) = &f.rules {
		for r in rules.request.iter().chain(rules.response.iter()) {
			crate::expr::Condition::compile(&r.when).map_err(|e| format!("rules.when: {e}"))?;
		}
	}
	Ok(())
}

fn check_references(config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	if let Some(up) = &route.upstream
		&& !config.upstreams.contains_key(up)
	{
		return Err(format!("unknown upstream: {up}"));
	}
	if let Some(pool) = f.retry_policy.as_ref().and_then(|r| r.budget_pool.as_ref())
		&& !config.budget_pools.contains_key(pool)
	{
		return Err(format!("unknown budget_pool: {pool}"));
	}
	if let Some(spec) = f.openapi.as_ref().map(|o| &o.spec)
		&& !config.openapi_specs.contains_key(spec)
	{
		return Err(format!("unknown openapi spec: {spec}"));
	}
	if let Some(bucket) = f.cache.as_ref().and_then(|c| c.bucket.as_ref())
		&& !config.cache_buckets.contains_key(bucket)
	{
		return Err(format!("unknown cache bucket: {bucket}"));
	}
	Ok(())
}

fn check_outlier_detection(_config: &Config, route: &RouteConfig) -> Result<(), String> {
	if let Some(od) = &route.features.outlier_detection {
		if od.window.is_zero() || od.interval.is_zero() {
			return Err("outlier_detection: interval and window must be > 0".to_string());
		}
		if od.max_ejection_percent > 100 {
			return Err("outlier_detection.max_ejection_percent must be <= 100".to_string());
		}
		if od.error_rate_multiplier < 1.0 || od.latency_multiplier < 1.0 {
			return Err("outlier_detection multipliers must be >= 1".to_string());
		}
		if od.base_ejection_duration > od.max_ejection_duration {
			return Err(
				"outlier_detection.base_ejection_duration must not exceed max_ejection_duration"
					.to_string(),
			);
		}
	}
	Ok(())
}

fn check_security_features(config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	if let Some(auth) = &f.auth {
		if auth.required && auth.methods.is_empty() {
			return Err("auth.required needs at least one method".to_string());
		}
		for m in &auth.methods {
			match m {
				AuthMethod::ApiKey if config.security.api_keys.is_none() => {
					return Err("auth method api_key requires security.api_keys".to_string());
				},
				AuthMethod::Jwt if config.security.jwt.is_none() => {
					return Err("auth method jwt requires security.jwt".to_string());
				},
				AuthMethod::Oauth if auth.oauth.is_none() => {
					return Err("auth method oauth requires auth.oauth".to_string());
				},
				AuthMethod::ExtAuth if f.ext_auth.is_none() => {
					return Err("auth method ext_auth requires ext_auth".to_string());
				},
				_ => {},
			}
		}
	}
	Ok(())
}

fn check_traffic_features(config: &Config, route: &RouteConfig) -> Result<(), String> {
	let f = &route.features;
	let group_names: HashSet<&Strng> = f
		.traffic_split
		.iter()
		.flat_map(|ts| ts.groups.iter().map(|g| &g.name))
		.collect();

	if let Some(ts) = &f.traffic_split {
		if ts.groups.is_empty() {
			return Err("traffic_split needs at least one group".to_string());
		}
		let total: u32 = ts.groups.iter().map(|g| g.weight).sum();
		if total != 100 {
			return Err(format!("traffic_split weights must sum to 100, got {total}"));
		}
		if group_names.len() != ts.groups.len() {
			return Err("traffic_split group names must be unique".to_string());
		}
		for g in &ts.groups {
			for b in &g.backends {
				parse_backend_url(&b.url).map_err(|e| format!("traffic_split group {}: {e}", g.name))?;
			}
		}
	}
	if let Some(c) = &f.canary {
		if !group_names.contains(&c.group) {
			return Err(format!("canary group unknown: {}", c.group));
		}
		if c.steps.is_empty() {
			return Err("canary needs at least one step".to_string());
		}
		let mut last = 0u32;
		for step in &c.steps {
			if step.weight > 100 {
				return Err("canary step weights must be in [0, 100]".to_string());
			}
			if step.weight < last {
				return Err("canary step weights must be monotonically non-decreasing".to_string());
			}
			last = step.weight;
		}
	}
	if let Some(bg) = &f.blue_green {
		for name in [&bg.blue, &bg.green] {
			if !group_names.contains(name) {
				return Err(format!("blue_green group unknown: {name}"));
			}
		}
		if bg.active != bg.blue && bg.active != bg.green {
			return Err("blue_green.active must name the blue or green group".to_string());
		}
	}
	if let Some(ab) = &f.ab_test {
		for g in &ab.groups {
			if !group_names.contains(g) {
				return Err(format!("ab_test group unknown: {g}"));
			}
		}
	}
	if let Some(rules) = &f.rules {
		for r in rules.request.iter().chain(rules.response.iter()) {
			if let RuleAction::Group { group } = &r.action
				&& !group_names.contains(group)
			{
				return Err(format!("rules group unknown: {group}"));
			}
		}
	}
	if let Some(v) = &f.versioning {
		if v.versions.is_empty() {
			return Err("versioning needs at least one version".to_string());
		}
		if let Some(dflt) = &v.default_version
			&& !v.versions.contains_key(dflt)
		{
			return Err(format!("versioning default_version unknown: {dflt}"));
		}
		for (ver, backends) in &v.versions {
			if backends.is_empty() {
				return Err(format!("versioning version {ver} needs backends"));
			}
			for b in backends {
				parse_backend_url(&b.url).map_err(|e| format!("versioning {ver}: {e}"))?;
			}
		}
	}
	// tenant-supplied backends must parse too
	for (name, tenant) in &config.tenants {
		for b in &tenant.backends {
			parse_backend_url(&b.url).map_err(|e| format!("tenant {name}: {e}"))?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::serdes::yamlviajson;

	fn load(y: &str) -> Result<(), ConfigError> {
		let config: Config = yamlviajson::from_str(y).unwrap();
		validate(&config)
	}

	#[test]
	fn accepts_minimal_config() {
		load("{}").unwrap();
	}

	#[test]
	fn rejects_two_handlers() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    echo: true
    upstream: pool
upstreams:
  pool:
    backends: [{url: "http://127.0.0.1:1"}]
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("mutually exclusive"), "{err}");
	}

	#[test]
	fn rejects_distributed_without_redis() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    rate_limit: {rate: 5, period: 1s, mode: distributed}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("requires redis.address"), "{err}");
	}

	#[test]
	fn accepts_distributed_with_redis() {
		load(
			r#"
redis: {address: "127.0.0.1:6379"}
routes:
  - id: r
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    rate_limit: {rate: 5, period: 1s, mode: distributed}
"#,
		)
		.unwrap();
	}

	#[test]
	fn rejects_traffic_split_not_summing_to_100() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    traffic_split:
      groups:
        - {name: a, weight: 60, backends: [{url: "http://127.0.0.1:1"}]}
        - {name: b, weight: 30, backends: [{url: "http://127.0.0.1:2"}]}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("sum to 100"), "{err}");
	}

	#[test]
	fn rejects_decreasing_canary_steps() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    traffic_split:
      groups:
        - {name: stable, weight: 90, backends: [{url: "http://127.0.0.1:1"}]}
        - {name: canary, weight: 10, backends: [{url: "http://127.0.0.1:2"}]}
    canary:
      group: canary
      steps: [{weight: 10}, {weight: 50}, {weight: 25}]
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("non-decreasing"), "{err}");
	}

	#[test]
	fn rejects_sticky_without_traffic_split() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    sticky: {cookie_name: grp}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("sticky requires traffic_split"), "{err}");
	}

	#[test]
	fn rejects_echo_with_backend_features() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    echo: true
    circuit_breaker: {failure_threshold: 3}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("echo excludes"), "{err}");
	}

	#[test]
	fn rejects_passthrough_with_transform() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    passthrough: true
    backends: [{url: "http://127.0.0.1:1"}]
    transform:
      request: {remove_fields: [secret]}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("passthrough excludes"), "{err}");
	}

	#[test]
	fn rejects_bad_timeout_ordering() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    timeouts: {header: 20s, backend: 10s, request: 30s}
"#,
		)
		.unwrap_err();
		assert!(
			err.to_string().contains("header <= backend <= request"),
			"{err}"
		);
	}

	#[test]
	fn rejects_unknown_upstream_reference() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    upstream: nope
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("unknown upstream: nope"), "{err}");
	}

	#[test]
	fn rejects_unknown_budget_pool() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    retry_policy: {max_retries: 2, budget_pool: missing}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("unknown budget_pool"), "{err}");
	}

	#[test]
	fn rejects_zero_budget_window() {
		let err = load(
			r#"
budget_pools:
  pool: {ratio: 0.2, min_retries: 5, window: 0s}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("window must be > 0"), "{err}");
	}

	#[test]
	fn rejects_versioning_with_backends() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    versioning:
      strategy: header
      name: X-Version
      versions:
        v1: [{url: "http://127.0.0.1:2"}]
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("mutually exclusive"), "{err}");
	}

	#[test]
	fn rejects_short_jwt_secret() {
		let err = load(
			r#"
security:
  jwt: {algorithm: HS256, secret: "short"}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("at least 32 bytes"), "{err}");
	}

	#[test]
	fn accepts_exact_32_byte_aes_key() {
		let key = STANDARD.encode([7u8; 32]);
		load(&format!(
			"security:\n  encryption: {{algorithm: aes-gcm-256, key: \"{key}\"}}\n"
		))
		.unwrap();
	}

	#[test]
	fn rejects_short_aes_key() {
		let key = STANDARD.encode([7u8; 16]);
		let err = load(&format!(
			"security:\n  encryption: {{algorithm: aes-gcm-256, key: \"{key}\"}}\n"
		))
		.unwrap_err();
		assert_eq!(
			err.to_string(),
			"security.encryption: aes-gcm-256 key must decode to exactly 32 bytes, got 16"
		);
	}

	#[test]
	fn rejects_oversized_aes_key() {
		let key = STANDARD.encode([7u8; 48]);
		let err = load(&format!(
			"security:\n  encryption: {{algorithm: aes-gcm-256, key: \"{key}\"}}\n"
		))
		.unwrap_err();
		assert!(err.to_string().contains("exactly 32 bytes"), "{err}");
	}

	#[test]
	fn rejects_non_base64_aes_key() {
		let err = load(
			r#"
security:
  encryption: {algorithm: aes-gcm-256, key: "not base64!!"}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("must be base64"), "{err}");
	}

	#[test]
	fn rejects_missing_aes_key() {
		let err = load("security:\n  encryption: {algorithm: aes-gcm-256}\n").unwrap_err();
		assert!(err.to_string().contains("key is required"), "{err}");
	}

	#[test]
	fn rejects_tcp_route_on_http_listener() {
		let err = load(
			r#"
listeners:
  - {id: web, address: ":8080", protocol: http}
tcp_routes:
  - {id: t, listener: web, backends: [{url: "http://127.0.0.1:1"}]}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("not a tcp listener"), "{err}");
	}

	#[test]
	fn rejects_hedging_with_retries() {
		let err = load(
			r#"
routes:
  - id: r
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    retry_policy:
      max_retries: 2
      hedging: {max_requests: 2, delay: 20ms}
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("mutually exclusive"), "{err}");
	}

	#[test]
	fn scope_path_names_the_route() {
		let err = load(
			r#"
routes:
  - id: api.v1
    path: /
    backends: [{url: "http://127.0.0.1:1"}]
    rate_limit: {rate: 0, period: 1s}
"#,
		)
		.unwrap_err();
		assert_eq!(
			err.to_string(),
			"route api.v1: rate_limit.rate must be > 0"
		);
	}
}
