pub mod app;
pub mod backend;
pub mod client;
pub mod config;
pub mod discovery;
pub mod expr;
pub mod http;
pub mod management;
pub mod proxy;
pub mod serdes;
pub mod store;
pub mod telemetry;
pub mod types;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub use flowgate_core::prelude::*;
pub use flowgate_core::{drain, readiness, signal, version};
pub use serdes::{
	de_parse, is_default, ser_display, ser_display_iter, ser_display_option, ser_redact, serde_dur,
	serde_dur_option,
};
pub use types::config::Config;

use prometheus_client::registry::Registry;

use crate::client::Client;
use crate::proxy::handlers::{FastcgiCodec, NoFastcgi};
use crate::store::Stores;
use crate::telemetry::metrics::Metrics;

/// Everything the data plane needs to serve a request. One value is constructed at startup and
/// shared; subsystems receive borrow-only references per the ownership model.
pub struct GatewayInputs {
	pub stores: Stores,
	pub metrics: Arc<Metrics>,
	pub upstream: Client,
	pub registry: Arc<dyn discovery::Registry>,
	pub fastcgi: Arc<dyn FastcgiCodec>,
	/// Process start, used for canary step progression.
	pub started: Instant,
}

impl GatewayInputs {
	pub fn new(
		stores: Stores,
		registry: &mut Registry,
		upstream: Client,
		discovery: Arc<dyn discovery::Registry>,
	) -> Arc<GatewayInputs> {
		let sub = flowgate_core::metrics::sub_registry(registry);
		Arc::new(GatewayInputs {
			stores,
			metrics: Arc::new(Metrics::new(sub)),
			upstream,
			registry: discovery,
			fastcgi: Arc::new(NoFastcgi),
			started: Instant::now(),
		})
	}
}

/// A listen address that may be localhost-only or wildcard-bound.
#[derive(serde::Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Address {
	Localhost(u16),
	SocketAddr(SocketAddr),
}

impl Address {
	pub fn new(raw: &str) -> anyhow::Result<Self> {
		if let Ok(port) = raw.parse::<u16>() {
			return Ok(Address::Localhost(port));
		}
		Ok(Address::SocketAddr(raw.parse()?))
	}

	pub fn socket_addr(self) -> SocketAddr {
		match self {
			Address::Localhost(port) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
			Address::SocketAddr(s) => s,
		}
	}

	pub fn wildcard(port: u16) -> Self {
		Address::SocketAddr(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.socket_addr())
	}
}
