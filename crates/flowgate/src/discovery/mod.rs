use async_trait::async_trait;
use indexmap::IndexMap;

use crate::client::{Client, Target};
use crate::http::Body;
use crate::proxy::ProxyError;
use crate::types::config::{RegistryConfig, RegistryKind};
use crate::*;

/// Service discovery seam for `service:` route handlers. The memory registry serves the
/// static table from config; the consul registry queries the HTTP catalog API.
#[async_trait]
pub trait Registry: Send + Sync {
	async fn resolve(&self, service: &str) -> Result<Vec<Target>, ProxyError>;
}

pub fn build(config: &RegistryConfig, client: Client) -> anyhow::Result<Arc<dyn Registry>> {
	match config.kind {
		RegistryKind::Memory => Ok(Arc::new(MemoryRegistry::new(&config.services)?)),
		RegistryKind::Consul => {
			let address = config
				.consul_address
				.clone()
				.context("consul registry requires consul_address")?;
			Ok(Arc::new(ConsulRegistry { address, client }))
		},
	}
}

pub struct MemoryRegistry {
	services: IndexMap<Strng, Vec<Target>>,
}

impl MemoryRegistry {
	pub fn new(table: &IndexMap<Strng, Vec<String>>) -> anyhow::Result<MemoryRegistry> {
		let mut services = IndexMap::new();
		for (name, urls) in table {
			let targets = urls
				.iter()
				.map(|u| Target::parse_url(u).map(|(t, _)| t))
				.collect::<anyhow::Result<Vec<_>>>()
				.with_context(|| format!("service {name}"))?;
			services.insert(name.clone(), targets);
		}
		Ok(MemoryRegistry { services })
	}
}

#[async_trait]
impl Registry for MemoryRegistry {
	async fn resolve(&self, service: &str) -> Result<Vec<Target>, ProxyError> {
		self
			.services
			.get(service)
			.cloned()
			.ok_or(ProxyError::BackendDoesNotExist)
	}
}

pub struct ConsulRegistry {
	address: String,
	client: Client,
}

#[derive(Debug, serde::Deserialize)]
struct ConsulService {
	#[serde(rename = "ServiceAddress")]
	service_address: String,
	#[serde(rename = "Address")]
	address: String,
	#[serde(rename = "ServicePort")]
	service_port: u16,
}

#[async_trait]
impl Registry for ConsulRegistry {
	async fn resolve(&self, service: &str) -> Result<Vec<Target>, ProxyError> {
		let uri = format!(
			"http://{}/v1/catalog/service/{service}",
			self.address.trim_end_matches('/')
		);
		let req = ::http::Request::builder()
			.uri(&uri)
			.body(Body::empty())
			.map_err(|e| ProxyError::Processing(e.into()))?;
		let resp = self.client.simple_call(req).await?;
		if !resp.status().is_success() {
			return Err(ProxyError::UpstreamCallFailed(format!(
				"consul catalog returned {}",
				resp.status()
			)));
		}
		let bytes = axum::body::to_bytes(resp.into_body(), 4 << 20)
			.await
			.map_err(|e| ProxyError::Processing(e.into()))?;
		let services: Vec<ConsulService> = serde_json::from_slice(&bytes)
			.map_err(|e| ProxyError::Processing(e.into()))?;
		let targets = services
			.into_iter()
			.map(|s| {
				let host = if s.service_address.is_empty() {
					s.address
				} else {
					s.service_address
				};
				match host.parse::<IpAddr>() {
					Ok(ip) => Target::Address(SocketAddr::from((ip, s.service_port))),
					Err(_) => Target::Hostname(host.into(), s.service_port),
				}
			})
			.collect::<Vec<_>>();
		if targets.is_empty() {
			return Err(ProxyError::NoHealthyBackends);
		}
		Ok(targets)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn memory_registry_resolves_static_table() {
		let mut table = IndexMap::new();
		table.insert(
			Strng::from("users"),
			vec!["http://10.0.0.1:8080".to_string()],
		);
		let reg = MemoryRegistry::new(&table).unwrap();
		let targets = reg.resolve("users").await.unwrap();
		assert_eq!(targets.len(), 1);
		assert!(reg.resolve("missing").await.is_err());
	}

	#[tokio::test]
	async fn consul_registry_parses_catalog() {
		use wiremock::matchers::{method, path};
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/catalog/service/users"))
			.respond_with(ResponseTemplate::new(200).set_body_raw(
				r#"[{"ServiceAddress": "10.0.0.9", "Address": "10.0.0.1", "ServicePort": 8080}]"#,
				"application/json",
			))
			.mount(&server)
			.await;

		let reg = ConsulRegistry {
			address: server.uri().trim_start_matches("http://").to_string(),
			client: Client::for_tests(),
		};
		let targets = reg.resolve("users").await.unwrap();
		assert_eq!(targets, vec![Target::Address("10.0.0.9:8080".parse().unwrap())]);
	}
}
