use flowgate_core::readiness::Ready;
use flowgate_core::{drain, signal};
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;

use crate::backend::health::HealthChecker;
use crate::backend::outlier::OutlierDetector;
use crate::client::Client;
use crate::client::redis::RedisHandle;
use crate::config::watcher::ConfigWatcher;
use crate::store::{RuntimeConfig, Stores};
use crate::*;

const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
const LIMITER_IDLE: Duration = Duration::from_secs(600);

/// Builds and runs the gateway from a loaded config. Returns once shutdown completes.
pub async fn run(config: Config, config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
	let config = Arc::new(config);
	crate::telemetry::log::init(&config.logging);
	info!(version = %flowgate_core::version::BuildInfo::new(), "starting flowgate");

	let redis = match &config.redis {
		Some(rc) => Some(
			RedisHandle::connect(rc)
				.await
				.context("redis connection")?,
		),
		None => None,
	};
	let client = Client::new(&Default::default(), None);
	let stores = Stores::new(config.clone(), client.clone(), redis).context("building stores")?;
	let registry_impl = crate::discovery::build(&config.registry, client.clone())?;

	let mut registry = Registry::default();
	let inputs = GatewayInputs::new(stores.clone(), &mut registry, client.clone(), registry_impl);
	let registry = Arc::new(registry);

	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = Ready::new();
	let serving_task = ready.register_task("listeners");

	// Admin server.
	if config.admin.enabled {
		let admin = crate::management::admin::Server::new(
			&config,
			stores.clone(),
			ready.clone(),
			registry.clone(),
		);
		tokio::spawn(async move {
			if let Err(err) = admin.run().await {
				error!(%err, "admin server failed");
			}
		});
	}

	// Hot reload: file watching plus SIGHUP.
	if let Some(path) = config_path {
		let watcher = ConfigWatcher::new(path.clone());
		let mut rx = watcher.subscribe();
		tokio::spawn(watcher.run());
		let stores_for_reload = stores.clone();
		let client_for_reload = client.clone();
		let metrics = inputs.metrics.clone();
		tokio::spawn(async move {
			while let Ok(new_config) = rx.recv().await {
				match stores_for_reload.apply(new_config, client_for_reload.clone()) {
					Ok(()) => {
						metrics.config_reloads.inc();
						info!("configuration applied");
					},
					Err(err) => {
						metrics.config_reload_failures.inc();
						warn!(%err, "failed to apply reloaded config");
					},
				}
			}
		});
		spawn_sighup_reload(stores.clone(), client.clone(), path);
	}

	// Background tasks tied to the current config version; respawned on reload.
	let background = BackgroundTasks {
		inputs: inputs.clone(),
		client: client.clone(),
	};
	tokio::spawn(background.run());

	// The data plane.
	let gateway = crate::proxy::Gateway::new(inputs.clone(), drain_rx.clone());
	// The app must not hold a watcher itself, or the drain would never complete.
	drop(drain_rx);
	let gateway_task = tokio::spawn(async move {
		if let Err(err) = gateway.run().await {
			error!(%err, "gateway failed");
		}
	});
	drop(serving_task);

	// Wait for SIGTERM/SIGINT, then drain: fail readiness for drain_delay while still
	// serving, stop accepting, then wait for in-flight requests up to shutdown_timeout.
	shutdown.wait().await;
	let _draining = ready.register_task("draining");
	info!(delay = ?config.server.drain_delay, "drain started, failing readiness");
	tokio::time::sleep(config.server.drain_delay).await;

	let deadline = config.server.shutdown_timeout;
	tokio::select! {
		_ = drain_tx.start_drain_and_wait(drain::DrainMode::Graceful) => {
			info!("drained cleanly");
		}
		_ = tokio::time::sleep(deadline) => {
			warn!("shutdown deadline expired with requests in flight");
		}
	}
	gateway_task.abort();
	Ok(())
}

#[cfg(unix)]
fn spawn_sighup_reload(stores: Stores, client: Client, path: std::path::PathBuf) {
	tokio::spawn(async move {
		let Ok(mut hup) =
			tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
		else {
			return;
		};
		while hup.recv().await.is_some() {
			info!("SIGHUP received, reloading config");
			match crate::config::loader::load_file(&path) {
				Ok(new_config) => {
					if let Err(err) = stores.apply(Arc::new(new_config), client.clone()) {
						warn!(%err, "failed to apply config on SIGHUP");
					}
				},
				Err(err) => warn!(%err, "reload on SIGHUP failed, keeping previous config"),
			}
		}
	});
}

#[cfg(not(unix))]
fn spawn_sighup_reload(_stores: Stores, _client: Client, _path: std::path::PathBuf) {}

/// Owns the per-config-version tasks: health probes, outlier sweeps, blocklist feed refresh,
/// and the store janitors. On every published config the version-bound tasks are dropped and
/// respawned against the new snapshot.
struct BackgroundTasks {
	inputs: Arc<GatewayInputs>,
	client: Client,
}

impl BackgroundTasks {
	async fn run(self) {
		let mut rx = self.inputs.stores.subscribe();
		let mut version_tasks = self.spawn_version_tasks(self.inputs.stores.snapshot());
		let mut janitor = tokio::time::interval(JANITOR_INTERVAL);
		janitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				changed = rx.recv() => {
					match changed {
						Ok(snapshot) => {
							debug!("config changed, respawning background tasks");
							version_tasks.abort_all();
							version_tasks = self.spawn_version_tasks(snapshot);
						},
						Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
							version_tasks.abort_all();
							version_tasks = self.spawn_version_tasks(self.inputs.stores.snapshot());
						},
						Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
					}
				}
				_ = janitor.tick() => {
					self.sweep();
				}
			}
		}
	}

	fn spawn_version_tasks(&self, snapshot: Arc<RuntimeConfig>) -> JoinSet<()> {
		let mut tasks = JoinSet::new();

		let checker = HealthChecker::new(self.client.clone());
		for (_, upstream) in snapshot.upstreams.iter() {
			checker.spawn_all(upstream, &mut tasks);

			// Outlier detection runs per pool when any route using it is configured.
			let od_config = snapshot
				.config
				.routes
				.iter()
				.filter(|r| {
					r.upstream.as_deref() == Some(upstream.name.as_str())
						|| crate::backend::route_pool(&r.id) == upstream.name
				})
				.find_map(|r| r.features.outlier_detection.clone())
				.or_else(|| snapshot.config.defaults.outlier_detection.clone());
			if let Some(od) = od_config {
				let upstream = upstream.clone();
				tasks.spawn(async move {
					OutlierDetector::new(od).run(upstream).await;
				});
			}
		}

		if let Some(blocklist) = self.inputs.stores.blocklist() {
			let client = self.client.clone();
			tasks.spawn(async move {
				blocklist.run_refresher(client).await;
			});
		}

		tasks
	}

	/// Periodic housekeeping over the stateful stores.
	fn sweep(&self) {
		let stores = &self.inputs.stores;
		stores.limiters().for_each(|_, l| l.gc(LIMITER_IDLE));
		stores.spike_arresters().for_each(|_, s| s.gc(LIMITER_IDLE));
		stores.budgets().for_each(|_, b| b.gc());
		stores.caches().for_each(|_, c| c.gc());
		stores.idempotency().for_each(|_, i| i.gc());
		stores.revocation().gc();
		if let Some(bl) = stores.blocklist() {
			bl.gc();
		}
	}
}
