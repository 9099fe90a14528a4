use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::SecretString;

use crate::config::ConfigError;
use crate::config::validator;
use crate::types::config::RegistryKind;
use crate::*;

/// Loads, defaults, env-expands and validates a config file. The returned value satisfies every
/// validator invariant; the runtime does not re-check them.
pub fn load_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
	let bytes = std::fs::read_to_string(path.as_ref())?;
	load_bytes(&bytes)
}

pub fn load_bytes(contents: &str) -> Result<Config, ConfigError> {
	let expanded = expand_env(contents, &|name| std::env::var(name).ok());
	// Defaults are populated by serde on a fresh Config before the YAML is merged over it;
	// unknown fields are warnings, not errors.
	let (mut config, ignored) = serdes::yamlviajson::from_str_ignored::<Config>(&expanded)
		.map_err(ConfigError::Parse)?;
	for path in ignored {
		warn!(field = %path, "unknown config field ignored");
	}
	apply_env_overrides(&mut config);
	validator::validate(&config)?;
	Ok(config)
}

/// Replaces `${NAME}` with the environment variable's value. Unresolved placeholders are left
/// intact.
pub fn expand_env(text: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
	static PLACEHOLDER: Lazy<Regex> =
		Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));
	PLACEHOLDER
		.replace_all(text, |caps: &regex::Captures| match lookup(&caps[1]) {
			Some(v) => v,
			None => caps[0].to_string(),
		})
		.into_owned()
}

/// Environment overrides recognised regardless of file contents.
fn apply_env_overrides(config: &mut Config) {
	if let Ok(port) = std::env::var("GATEWAY_PORT")
		&& let Ok(port) = port.parse::<u16>()
	{
		config.server.port = port;
	}
	if let Ok(kind) = std::env::var("REGISTRY_TYPE") {
		match kind.as_str() {
			"consul" => config.registry.kind = RegistryKind::Consul,
			"memory" => config.registry.kind = RegistryKind::Memory,
			other => warn!(registry = other, "unknown REGISTRY_TYPE ignored"),
		}
	}
	if let Ok(addr) = std::env::var("CONSUL_ADDRESS")
		&& !addr.is_empty()
	{
		config.registry.consul_address = Some(addr);
	}
	if let Ok(secret) = std::env::var("JWT_SECRET")
		&& !secret.is_empty()
	{
		let jwt = config.security.jwt.get_or_insert_default();
		jwt.secret = Some(SecretString::from(secret));
	}
}

/// `base ⊕ overlay`: overlay fields replace base fields when set; route/blocklist lists are
/// concatenated; named maps are union-merged with overlay precedence per key.
pub fn merge(mut base: Config, overlay: Config) -> Config {
	let dflt = Config::default();

	if overlay.server != dflt.server {
		base.server = overlay.server;
	}
	if overlay.admin != dflt.admin {
		base.admin = overlay.admin;
	}
	if overlay.logging != dflt.logging {
		base.logging = overlay.logging;
	}
	if overlay.registry != dflt.registry {
		base.registry = overlay.registry;
	}
	if overlay.redis.is_some() {
		base.redis = overlay.redis;
	}

	base.listeners.extend(overlay.listeners);
	base.routes.extend(overlay.routes);
	base.tcp_routes.extend(overlay.tcp_routes);
	base.udp_routes.extend(overlay.udp_routes);

	for (k, v) in overlay.upstreams {
		base.upstreams.insert(k, v);
	}
	for (k, v) in overlay.budget_pools {
		base.budget_pools.insert(k, v);
	}
	for (k, v) in overlay.cache_buckets {
		base.cache_buckets.insert(k, v);
	}
	for (k, v) in overlay.tenants {
		base.tenants.insert(k, v);
	}
	for (k, v) in overlay.tiers {
		base.tiers.insert(k, v);
	}
	for (k, v) in overlay.openapi_specs {
		base.openapi_specs.insert(k, v);
	}

	// Security: blocklist static/feeds concatenate, everything else replaces when set.
	let sec = overlay.security;
	if let Some(mut bl) = sec.ip_blocklist {
		match &mut base.security.ip_blocklist {
			Some(existing) => {
				existing.static_cidrs.append(&mut bl.static_cidrs);
				existing.feeds.append(&mut bl.feeds);
				existing.action = bl.action;
			},
			None => base.security.ip_blocklist = Some(bl),
		}
	}
	macro_rules! replace_if_set {
		($($field:ident),+ $(,)?) => {
			$( if sec.$field.is_some() { base.security.$field = sec.$field; } )+
		};
	}
	replace_if_set!(
		ip_filter,
		geo,
		bot,
		maintenance,
		load_shedding,
		token_revocation,
		api_keys,
		jwt,
		nonce,
		encryption
	);
	if !sec.allowed_hosts.is_empty() {
		base.security.allowed_hosts = sec.allowed_hosts;
	}
	if sec.https_redirect {
		base.security.https_redirect = true;
	}
	if !sec.trusted_proxies.cidrs.is_empty() {
		base.security.trusted_proxies = sec.trusted_proxies;
	}

	base.defaults = crate::types::features::RouteFeatures::merge(&base.defaults, &overlay.defaults);
	base
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::config::{BackendConfig, RegistryKind};
	use crate::types::route::RouteConfig;

	fn lookup(env: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
		move |name| {
			env
				.iter()
				.find(|(k, _)| *k == name)
				.map(|(_, v)| v.to_string())
		}
	}

	#[test]
	fn expand_env_replaces_known_placeholders() {
		let out = expand_env(
			"server:\n  port: ${TEST_PORT}\n",
			&lookup(&[("TEST_PORT", "7777")]),
		);
		assert_eq!(out, "server:\n  port: 7777\n");
	}

	#[test]
	fn expand_env_leaves_unresolved_intact() {
		let text = "value: ${MISSING_VAR}\n";
		assert_eq!(expand_env(text, &lookup(&[])), text);
	}

	#[test]
	fn expand_env_is_identity_without_placeholders() {
		let text = "a: 1\nb: $notbraced\n";
		assert_eq!(expand_env(text, &lookup(&[("A", "x")])), text);
	}

	#[test]
	fn load_populates_defaults_under_yaml() {
		let cfg = load_bytes("server:\n  port: 9999\n").unwrap();
		assert_eq!(cfg.server.port, 9999);
		// untouched defaults survive
		assert_eq!(cfg.server.idle_timeout, Duration::from_secs(60));
		assert_eq!(cfg.admin.port, 8081);
	}

	#[test]
	fn load_rejects_duplicate_route_ids() {
		let y = r#"
routes:
  - id: test
    path: /a
    echo: true
  - id: test
    path: /b
    echo: true
"#;
		let err = load_bytes(y).unwrap_err();
		assert_eq!(err.to_string(), "duplicate route id: test");
	}

	#[test]
	fn merge_with_default_overlay_is_identity() {
		let mut base = Config::default();
		base.server.port = 9000;
		base.routes.push(RouteConfig {
			id: "a".into(),
			path: "/".into(),
			path_prefix: true,
			strip_prefix: false,
			methods: vec![],
			matches: None,
			backends: vec![BackendConfig {
				url: "http://127.0.0.1:1".into(),
				weight: 1,
				health_check: None,
			}],
			upstream: None,
			service: None,
			echo: false,
			static_files: None,
			fastcgi: None,
			sequential: vec![],
			aggregate: None,
			passthrough: false,
			features: Default::default(),
		});
		let merged = merge(base.clone(), Config::default());
		assert_eq!(merged.server.port, 9000);
		assert_eq!(merged.routes.len(), 1);
	}

	#[test]
	fn merge_concatenates_routes_and_unions_upstreams() {
		let mut base = Config::default();
		base.routes.push(route("a"));
		base
			.upstreams
			.insert("pool".into(), Default::default());
		let mut overlay = Config::default();
		overlay.routes.push(route("b"));
		overlay
			.upstreams
			.insert("pool2".into(), Default::default());
		let merged = merge(base, overlay);
		assert_eq!(merged.routes.len(), 2);
		assert!(merged.upstreams.contains_key("pool"));
		assert!(merged.upstreams.contains_key("pool2"));
	}

	fn route(id: &str) -> RouteConfig {
		crate::serdes::yamlviajson::from_str(&format!("id: {id}\npath: /\necho: true\n")).unwrap()
	}

	#[test]
	fn registry_env_override() {
		unsafe {
			std::env::set_var("REGISTRY_TYPE", "consul");
			std::env::set_var("CONSUL_ADDRESS", "127.0.0.1:8500");
		}
		let cfg = load_bytes("{}").unwrap();
		unsafe {
			std::env::remove_var("REGISTRY_TYPE");
			std::env::remove_var("CONSUL_ADDRESS");
		}
		assert_eq!(cfg.registry.kind, RegistryKind::Consul);
		assert_eq!(cfg.registry.consul_address.as_deref(), Some("127.0.0.1:8500"));
	}
}
