use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use flowgate_core::readiness::Ready;
use flowgate_core::version::BuildInfo;
use ipnet::IpNet;
use prometheus_client::registry::Registry;

use crate::store::Stores;
use crate::*;

/// The admin HTTP API: health, readiness, metrics, config dump, and status/control endpoints
/// for blocklists, token revocation, and per-route limiter state.
pub struct Server {
	addr: SocketAddr,
	router: Router,
}

#[derive(Clone)]
struct AdminState {
	stores: Stores,
	ready: Ready,
	registry: Arc<Registry>,
	pprof_enabled: bool,
}

impl Server {
	pub fn new(
		config: &Config,
		stores: Stores,
		ready: Ready,
		registry: Arc<Registry>,
	) -> Server {
		let state = AdminState {
			stores,
			ready,
			registry,
			pprof_enabled: config.admin.pprof,
		};
		let router = Router::new()
			.route("/healthz", get(handle_health))
			.route("/readyz", get(handle_ready))
			.route("/metrics", get(handle_metrics))
			.route("/config_dump", get(handle_config_dump))
			.route("/version", get(handle_version))
			.route("/status/blocklist", get(handle_blocklist_status))
			.route(
				"/blocklist",
				post(handle_blocklist_add).delete(handle_blocklist_remove),
			)
			.route("/status/revocation", get(handle_revocation_status))
			.route("/revocation", post(handle_revoke).delete(handle_unrevoke))
			.route("/status/limits", get(handle_limit_status))
			.route("/debug/pprof/profile", get(handle_pprof))
			.with_state(state);
		Server {
			addr: Address::Localhost(config.admin.port).socket_addr(),
			router,
		}
	}

	pub fn address(&self) -> SocketAddr {
		self.addr
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let listener = tokio::net::TcpListener::bind(self.addr).await?;
		info!(addr = %self.addr, "started admin server");
		axum::serve(listener, self.router).await?;
		Ok(())
	}
}

async fn handle_health() -> &'static str {
	"ok"
}

async fn handle_ready(State(state): State<AdminState>) -> Response {
	if state.ready.is_ready() {
		(StatusCode::OK, "ready").into_response()
	} else {
		let pending = state
			.ready
			.pending()
			.into_iter()
			.collect::<Vec<_>>()
			.join(", ");
		(
			StatusCode::SERVICE_UNAVAILABLE,
			format!("not ready: {pending}"),
		)
			.into_response()
	}
}

async fn handle_metrics(State(state): State<AdminState>) -> Response {
	let mut out = String::new();
	if let Err(err) = prometheus_client::encoding::text::encode(&mut out, &state.registry) {
		return (
			StatusCode::INTERNAL_SERVER_ERROR,
			format!("encoding failed: {err}"),
		)
			.into_response();
	}
	(
		[(
			axum::http::header::CONTENT_TYPE,
			"application/openmetrics-text; version=1.0.0; charset=utf-8",
		)],
		out,
	)
		.into_response()
}

async fn handle_config_dump(State(state): State<AdminState>) -> Response {
	let snapshot = state.stores.snapshot();
	axum::Json(serde_json::json!({
		"version": BuildInfo::new(),
		"config": snapshot.config.as_ref(),
	}))
	.into_response()
}

async fn handle_version() -> Response {
	axum::Json(BuildInfo::new()).into_response()
}

async fn handle_blocklist_status(State(state): State<AdminState>) -> Response {
	match state.stores.blocklist() {
		Some(bl) => axum::Json(bl.snapshot()).into_response(),
		None => axum::Json(serde_json::json!({"enabled": false})).into_response(),
	}
}

#[derive(serde::Deserialize)]
struct BlocklistEntry {
	cidr: IpNet,
	#[serde(default, with = "serde_dur_option")]
	ttl: Option<Duration>,
}

async fn handle_blocklist_add(
	State(state): State<AdminState>,
	axum::Json(entry): axum::Json<BlocklistEntry>,
) -> Response {
	match state.stores.blocklist() {
		Some(bl) => {
			bl.add(entry.cidr, entry.ttl);
			StatusCode::CREATED.into_response()
		},
		None => (StatusCode::CONFLICT, "blocklist is not configured").into_response(),
	}
}

async fn handle_blocklist_remove(
	State(state): State<AdminState>,
	axum::Json(entry): axum::Json<BlocklistEntry>,
) -> Response {
	match state.stores.blocklist() {
		Some(bl) if bl.remove(&entry.cidr) => StatusCode::NO_CONTENT.into_response(),
		Some(_) => (StatusCode::NOT_FOUND, "entry not found").into_response(),
		None => (StatusCode::CONFLICT, "blocklist is not configured").into_response(),
	}
}

async fn handle_revocation_status(State(state): State<AdminState>) -> Response {
	let entries = state.stores.revocation().snapshot();
	axum::Json(serde_json::json!({
		"entries": entries
			.into_iter()
			.map(|(key, ttl)| serde_json::json!({"key": key, "ttl_seconds": ttl}))
			.collect::<Vec<_>>(),
	}))
	.into_response()
}

#[derive(serde::Deserialize)]
struct RevocationEntry {
	key: String,
	#[serde(default, with = "serde_dur_option")]
	ttl: Option<Duration>,
}

async fn handle_revoke(
	State(state): State<AdminState>,
	axum::Json(entry): axum::Json<RevocationEntry>,
) -> Response {
	let store = state.stores.revocation();
	let ttl = entry.ttl.unwrap_or_else(|| store.effective_ttl(None));
	store.revoke(entry.key, ttl).await;
	StatusCode::CREATED.into_response()
}

async fn handle_unrevoke(
	State(state): State<AdminState>,
	axum::Json(entry): axum::Json<RevocationEntry>,
) -> Response {
	state.stores.revocation().unrevoke(&entry.key).await;
	StatusCode::NO_CONTENT.into_response()
}

async fn handle_limit_status(State(state): State<AdminState>) -> Response {
	let mut routes = serde_json::Map::new();
	state.stores.budgets().for_each(|key, budget| {
		let (requests, retries) = budget.snapshot();
		routes.insert(
			key.to_string(),
			serde_json::json!({"kind": "budget", "requests": requests, "retries": retries}),
		);
	});
	state.stores.caches().for_each(|key, cache| {
		routes.insert(
			format!("cache:{key}"),
			serde_json::json!({"kind": "cache", "entries": cache.len()}),
		);
	});
	for key in state.stores.limiters().keys() {
		routes.insert(
			format!("limiter:{key}"),
			serde_json::json!({"kind": "rate_limit"}),
		);
	}
	let shedder = state.stores.shedder();
	routes.insert(
		"load_shedding".to_string(),
		serde_json::json!({
			"in_flight": shedder.in_flight(),
			"shed_total": shedder.shed_total(),
			"limit": shedder.current_limit(),
		}),
	);
	axum::Json(serde_json::Value::Object(routes)).into_response()
}

async fn handle_pprof(State(state): State<AdminState>) -> Response {
	if !state.pprof_enabled {
		return (StatusCode::NOT_FOUND, "pprof is disabled").into_response();
	}
	// Profiling is an external collaborator; the endpoint only reports availability.
	(
		StatusCode::NOT_IMPLEMENTED,
		"pprof support is not compiled in",
	)
		.into_response()
}
