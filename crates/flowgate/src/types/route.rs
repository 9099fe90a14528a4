use indexmap::IndexMap;
use ipnet::IpNet;

use crate::types::config::BackendConfig;
use crate::types::features::RouteFeatures;
use crate::*;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RouteConfig {
	pub id: Strng,
	pub path: String,
	#[serde(default, skip_serializing_if = "is_default")]
	pub path_prefix: bool,
	/// Remove the matched prefix from the forwarded path.
	#[serde(default, skip_serializing_if = "is_default")]
	pub strip_prefix: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub methods: Vec<String>,
	#[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
	pub matches: Option<MatchConfig>,

	// Handler families; the validator enforces mutual exclusion.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub backends: Vec<BackendConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub upstream: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub service: Option<ServiceRef>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub echo: bool,
	#[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
	pub static_files: Option<StaticConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub fastcgi: Option<FastcgiConfig>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub sequential: Vec<ChainStepConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub aggregate: Option<AggregateConfig>,
	/// Forward bytes untouched; excludes all body-processing features.
	#[serde(default, skip_serializing_if = "is_default")]
	pub passthrough: bool,

	#[serde(flatten)]
	pub features: RouteFeatures,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MatchConfig {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub domains: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub headers: Vec<PredicateConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub query: Vec<PredicateConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub cookies: Vec<PredicateConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub body: Vec<BodyPredicateConfig>,
}

/// One header/query/cookie predicate. `present` is tri-state: unset means "don't care",
/// true/false assert presence regardless of value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PredicateConfig {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<String>,
	#[serde(
		default,
		with = "serde_regex",
		skip_serializing_if = "Option::is_none"
	)]
	pub regex: Option<regex::Regex>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub present: Option<bool>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BodyPredicateConfig {
	/// Dotted JSON path into the request body.
	pub path: String,
	#[serde(with = "serde_regex")]
	pub regex: regex::Regex,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceRef {
	pub name: Strng,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub port: Option<u16>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StaticConfig {
	pub root: std::path::PathBuf,
	#[serde(default = "default_index")]
	pub index: String,
}

fn default_index() -> String {
	"index.html".to_string()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FastcgiConfig {
	pub address: String,
	#[serde(default, skip_serializing_if = "IndexMap::is_empty")]
	pub params: IndexMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainStepConfig {
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub method: Option<String>,
	/// Templated body; `$response.*` references resolve against the previous step.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,
	#[serde(default, skip_serializing_if = "IndexMap::is_empty")]
	pub headers: IndexMap<String, String>,
	/// Abort the chain when the step returns a status outside 2xx.
	#[serde(default = "default_true")]
	pub abort_on_error: bool,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AggregateConfig {
	pub requests: Vec<AggregateRequestConfig>,
	/// Continue and omit the key when a sub-request fails.
	#[serde(default)]
	pub allow_partial: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AggregateRequestConfig {
	/// Key the sub-response is merged under in the aggregate JSON object.
	pub key: String,
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub method: Option<String>,
	#[serde(default, skip_serializing_if = "IndexMap::is_empty")]
	pub headers: IndexMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TcpRouteConfig {
	pub id: Strng,
	pub listener: Strng,
	#[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
	pub matches: Option<TcpMatchConfig>,
	pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TcpMatchConfig {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub sni: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub cidrs: Vec<IpNet>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UdpRouteConfig {
	pub id: Strng,
	pub listener: Strng,
	pub backends: Vec<BackendConfig>,
}

impl RouteConfig {
	/// Names of the handler families set on this route. The validator requires exactly one.
	pub fn handler_families(&self) -> Vec<&'static str> {
		let mut out = Vec::new();
		if !self.backends.is_empty() {
			out.push("backends");
		}
		if self.upstream.is_some() {
			out.push("upstream");
		}
		if self.service.is_some() {
			out.push("service");
		}
		if self.echo {
			out.push("echo");
		}
		if self.static_files.is_some() {
			out.push("static");
		}
		if self.fastcgi.is_some() {
			out.push("fastcgi");
		}
		if !self.sequential.is_empty() {
			out.push("sequential");
		}
		if self.aggregate.is_some() {
			out.push("aggregate");
		}
		// versioning brings its own backends and counts as a handler family
		if self.features.versioning.is_some() {
			out.push("versioning");
		}
		if self
			.features
			.traffic_split
			.as_ref()
			.is_some_and(|ts| ts.groups.iter().any(|g| !g.backends.is_empty()))
		{
			out.push("traffic_split");
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::serdes::yamlviajson;

	#[test]
	fn route_parses_with_flattened_features() {
		let y = r#"
id: api
path: /api
path_prefix: true
methods: [GET, POST]
backends:
  - url: http://127.0.0.1:9000
    weight: 2
rate_limit:
  rate: 5
  period: 1s
  burst: 5
  key: ip
"#;
		let r: RouteConfig = yamlviajson::from_str(y).unwrap();
		assert_eq!(r.id.as_str(), "api");
		assert!(r.path_prefix);
		assert_eq!(r.backends.len(), 1);
		let rl = r.features.rate_limit.as_ref().unwrap();
		assert_eq!(rl.rate, 5);
		assert_eq!(rl.burst, 5);
		assert_eq!(r.handler_families(), vec!["backends"]);
	}

	#[test]
	fn handler_families_lists_conflicts() {
		let y = r#"
id: bad
path: /
echo: true
upstream: pool
"#;
		let r: RouteConfig = yamlviajson::from_str(y).unwrap();
		assert_eq!(r.handler_families(), vec!["upstream", "echo"]);
	}
}
