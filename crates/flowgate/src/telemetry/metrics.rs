use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::*;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HTTPLabels {
	pub route: String,
	pub method: String,
	pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
	pub route: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
	pub backend: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum Protocol {
	http,
	https,
	tcp,
	udp,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
	pub listener: String,
	pub protocol: Protocol,
}

pub struct Metrics {
	pub downstream_connections: Family<ConnectionLabels, Counter>,
	pub active_connections: Family<ConnectionLabels, Gauge>,
	pub requests: Family<HTTPLabels, Counter>,
	pub request_duration: Family<RouteLabels, Histogram>,
	pub upstream_attempts: Family<BackendLabels, Counter>,
	pub upstream_failures: Family<BackendLabels, Counter>,
	pub rate_limited: Family<RouteLabels, Counter>,
	pub quota_exceeded: Family<RouteLabels, Counter>,
	pub cache_hits: Family<RouteLabels, Counter>,
	pub cache_misses: Family<RouteLabels, Counter>,
	pub coalesced_requests: Family<RouteLabels, Counter>,
	pub breaker_opens: Family<RouteLabels, Counter>,
	pub retries: Family<RouteLabels, Counter>,
	pub blocklist_hits: Counter,
	pub shed_requests: Counter,
	pub config_reloads: Counter,
	pub config_reload_failures: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Metrics {
		let metrics = Metrics {
			downstream_connections: Default::default(),
			active_connections: Default::default(),
			requests: Default::default(),
			request_duration: Family::new_with_constructor(|| {
				Histogram::new(
					[
						0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
					]
					.into_iter(),
				)
			}),
			upstream_attempts: Default::default(),
			upstream_failures: Default::default(),
			rate_limited: Default::default(),
			quota_exceeded: Default::default(),
			cache_hits: Default::default(),
			cache_misses: Default::default(),
			coalesced_requests: Default::default(),
			breaker_opens: Default::default(),
			retries: Default::default(),
			blocklist_hits: Default::default(),
			shed_requests: Default::default(),
			config_reloads: Default::default(),
			config_reload_failures: Default::default(),
		};

		registry.register(
			"downstream_connections",
			"Accepted downstream connections",
			metrics.downstream_connections.clone(),
		);
		registry.register(
			"active_connections",
			"Currently open downstream connections",
			metrics.active_connections.clone(),
		);
		registry.register("requests", "Handled HTTP requests", metrics.requests.clone());
		registry.register(
			"request_duration_seconds",
			"End to end request latency",
			metrics.request_duration.clone(),
		);
		registry.register(
			"upstream_attempts",
			"Upstream dial attempts including retries",
			metrics.upstream_attempts.clone(),
		);
		registry.register(
			"upstream_failures",
			"Failed upstream attempts",
			metrics.upstream_failures.clone(),
		);
		registry.register(
			"rate_limited",
			"Requests rejected by rate limiting",
			metrics.rate_limited.clone(),
		);
		registry.register(
			"quota_exceeded",
			"Requests rejected by quota",
			metrics.quota_exceeded.clone(),
		);
		registry.register("cache_hits", "Response cache hits", metrics.cache_hits.clone());
		registry.register(
			"cache_misses",
			"Response cache misses",
			metrics.cache_misses.clone(),
		);
		registry.register(
			"coalesced_requests",
			"Requests served from a coalesced in-flight call",
			metrics.coalesced_requests.clone(),
		);
		registry.register(
			"breaker_opens",
			"Circuit breaker open transitions",
			metrics.breaker_opens.clone(),
		);
		registry.register("retries", "Upstream retries issued", metrics.retries.clone());
		registry.register(
			"blocklist_hits",
			"Requests matching the IP blocklist",
			metrics.blocklist_hits.clone(),
		);
		registry.register(
			"shed_requests",
			"Requests rejected by load shedding",
			metrics.shed_requests.clone(),
		);
		registry.register(
			"config_reloads",
			"Successful configuration reloads",
			metrics.config_reloads.clone(),
		);
		registry.register(
			"config_reload_failures",
			"Rejected configuration reloads",
			metrics.config_reload_failures.clone(),
		);
		metrics
	}

	pub fn observe_request(&self, route: &str, method: &http::Method, status: u16, dur: Duration) {
		self
			.requests
			.get_or_create(&HTTPLabels {
				route: route.to_string(),
				method: method.as_str().to_string(),
				status,
			})
			.inc();
		self
			.request_duration
			.get_or_create(&RouteLabels {
				route: route.to_string(),
			})
			.observe(dur.as_secs_f64());
	}
}
