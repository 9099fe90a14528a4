use crate::backend::{BackendHandle, Upstream};
use crate::client::Client;
use crate::http::Body;
use crate::types::features::HealthCheckConfig;
use crate::*;

/// Active health checking. Each backend gets an independent probe task; per-backend
/// `health_check` overrides the upstream-level one.
pub struct HealthChecker {
	client: Client,
}

impl HealthChecker {
	pub fn new(client: Client) -> HealthChecker {
		HealthChecker { client }
	}

	/// Spawns one probe loop per backend that has a health check configured. Tasks live in the
	/// given JoinSet so a config reload can drop them all at once.
	pub fn spawn_all(
		&self,
		upstream: &Upstream,
		tasks: &mut tokio::task::JoinSet<()>,
	) {
		for backend in &upstream.backends {
			let config = backend
				.health_check
				.clone()
				.or_else(|| upstream.config.health_check.clone());
			let Some(config) = config else { continue };
			let backend = backend.clone();
			let client = self.client.clone();
			tasks.spawn(async move {
				probe_loop(client, backend, config).await;
			});
		}
	}
}

async fn probe_loop(client: Client, backend: Arc<BackendHandle>, config: HealthCheckConfig) {
	let mut interval = tokio::time::interval(config.interval);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		interval.tick().await;
		let success = probe_once(&client, &backend, &config).await;
		backend.record_probe(success, config.healthy_after, config.unhealthy_after);
	}
}

async fn probe_once(
	client: &Client,
	backend: &Arc<BackendHandle>,
	config: &HealthCheckConfig,
) -> bool {
	let req = ::http::Request::builder()
		.method("GET")
		.uri(format!(
			"{}://{}{}",
			if backend.tls { "https" } else { "http" },
			backend.target,
			config.path
		))
		.header(http::header::USER_AGENT, "flowgate-health/1")
		.body(Body::empty());
	let req = match req {
		Ok(req) => req,
		Err(err) => {
			debug!(%err, "failed to build health probe");
			return false;
		},
	};
	match tokio::time::timeout(config.timeout, client.simple_call(req)).await {
		Ok(Ok(resp)) => {
			let ok = config.expected_status.contains(resp.status().as_u16());
			if !ok {
				debug!(backend = %backend.target, status = %resp.status(), "health probe status mismatch");
			}
			ok
		},
		Ok(Err(err)) => {
			debug!(backend = %backend.target, %err, "health probe failed");
			false
		},
		Err(_) => {
			debug!(backend = %backend.target, "health probe timed out");
			false
		},
	}
}
