use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use futures::stream::{FuturesUnordered, StreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rand::Rng;

use crate::backend::{BackendHandle, Upstream, balance};
use crate::client::Target;
use crate::expr::{RequestContext, TlsInfo};
use crate::http::coalesce::Outcome;
use crate::http::retry;
use crate::http::route::CompiledRoute;
use crate::http::{
	Authority, Body, BufferedResponse, HeaderValue, Method, Request, Response, Scheme, StatusCode,
	header, merge_in_headers, x_headers,
};
use crate::proxy::{ProxyError, handlers};
use crate::store::{RoutePolicies, RuntimeConfig};
use crate::telemetry::log::{LogBody, RequestLog};
use crate::types::features::*;
use crate::types::listener::ListenerConfig;
use crate::*;

const MATCH_BODY_LIMIT: usize = 1 << 20;
const DEFAULT_MAX_BODY: u64 = 4 << 20;
const DEFAULT_RESPONSE_LIMIT: u64 = 16 << 20;

/// The L7 pipeline driver: one instance per HTTP listener, shared across connections.
#[derive(Clone)]
pub struct HTTPProxy {
	pub inputs: Arc<GatewayInputs>,
	pub listener: Arc<ListenerConfig>,
}

impl HTTPProxy {
	pub async fn proxy(
		&self,
		peer_addr: SocketAddr,
		tls: Option<TlsInfo>,
		req: ::http::Request<hyper::body::Incoming>,
	) -> Response {
		self.proxy_request(peer_addr, tls, req.map(Body::new)).await
	}

	pub async fn proxy_request(
		&self,
		peer_addr: SocketAddr,
		tls: Option<TlsInfo>,
		mut req: Request,
	) -> Response {
		let snapshot = self.inputs.stores.snapshot();
		let mut ctx = RequestContext::new(peer_addr, req.version());
		ctx.tls = tls;
		let mut log = RequestLog::new(&snapshot.config.logging, peer_addr);
		log.version = Some(req.version());
		let result = self
			.proxy_internal(&snapshot, &mut ctx, &mut log, &mut req)
			.await;

		let mut resp = match result {
			Ok(resp) => resp,
			Err(err) => {
				debug!(%err, "request failed");
				log.error = Some(err.to_string());
				err.as_response()
			},
		};

		// Advertise HTTP/3 on h1/h2 responses when the listener enables it.
		if self.listener.http.http3
			&& let Ok(v) = HeaderValue::try_from(format!(
				"h3=\":{}\"; ma={}",
				self
					.listener
					.socket_addr()
					.map(|a| a.port())
					.unwrap_or_default(),
				self.listener.http.alt_svc_max_age
			)) {
			resp.headers_mut().insert(header::ALT_SVC, v);
		}

		log.status = Some(resp.status().as_u16());
		log.client_id = ctx.client_id().cloned();
		log.client_ip = Some(ctx.client_ip);
		log.traffic_group = ctx.traffic_group.clone();
		log.upstream_status = ctx.upstream_status;
		log.backend = ctx.backend.clone();
		log.retry_attempt = ctx.retry_attempt;
		if let Some(route) = &ctx.route_id {
			self.inputs.metrics.observe_request(
				route,
				log.method.as_ref().unwrap_or(&Method::GET),
				resp.status().as_u16(),
				log.start.elapsed(),
			);
		}
		self.inputs.stores.shedder().observe_latency(log.start.elapsed());

		// The log finishes once the response stream completes.
		resp.map(move |b| Body::new(LogBody::new(b, log)))
	}

	async fn proxy_internal(
		&self,
		snapshot: &Arc<RuntimeConfig>,
		ctx: &mut RequestContext,
		log: &mut RequestLog,
		req: &mut Request,
	) -> Result<Response, ProxyError> {
		let config = &snapshot.config;
		let security = &config.security;

		normalize_uri(ctx, req)?;
		let host = crate::http::get_host(req)?.to_string();
		log.host = Some(host.clone());
		log.method = Some(req.method().clone());
		log.path = Some(req.uri().path().to_string());
		log.listener = Some(self.listener.id.clone());

		// 1. Client IP extraction.
		ctx.client_ip =
			crate::http::ipfilter::resolve_client_ip(&security.trusted_proxies, ctx.peer_addr.ip(), req);

		// 2. Allowed hosts / HTTPS redirect.
		if !security.allowed_hosts.is_empty()
			&& !security
				.allowed_hosts
				.iter()
				.any(|h| h.eq_ignore_ascii_case(&host))
		{
			return Err(ProxyError::Rejected {
				status: StatusCode::FORBIDDEN,
				message: "host not allowed".to_string(),
			});
		}
		if security.https_redirect && ctx.tls.is_none() {
			let location = format!("https://{host}{}", original_path_and_query(req));
			return Ok(
				::http::Response::builder()
					.status(StatusCode::MOVED_PERMANENTLY)
					.header(header::LOCATION, location)
					.body(Body::empty())
					.expect("redirect must build"),
			);
		}

		// 3. IP filter -> blocklist -> geo -> bot.
		if let Some(f) = &security.ip_filter {
			crate::http::ipfilter::check_ip_filter(f, ctx.client_ip)?;
		}
		if let Some(blocklist) = self.inputs.stores.blocklist()
			&& blocklist.contains(ctx.client_ip)
		{
			self.inputs.metrics.blocklist_hits.inc();
			match blocklist.action() {
				crate::types::config::BlockAction::Block => {
					return Err(ProxyError::Rejected {
						status: StatusCode::FORBIDDEN,
						message: "address is blocked".to_string(),
					});
				},
				crate::types::config::BlockAction::Log => {
					blocklist.record_log_hit();
					info!(ip = %ctx.client_ip, "blocklisted address passed through (log action)");
				},
			}
		}
		if let Some(geo) = &security.geo {
			crate::http::ipfilter::check_geo(geo, ctx, req)?;
		}
		if let Some(bot) = &security.bot {
			crate::http::ipfilter::check_bot(bot, req)?;
		}

		// 4. Maintenance mode.
		if let Some(m) = &security.maintenance
			&& let Some(resp) = crate::http::maintenance::check(m, ctx, req)
		{
			return Ok(resp);
		}

		// 5. Load shedding; the guard holds an in-flight slot for the rest of the request.
		let _shed_guard = match self.inputs.stores.shedder().admit() {
			Ok(guard) => guard,
			Err(err) => {
				self.inputs.metrics.shed_requests.inc();
				return Err(err);
			},
		};

		// Request id for correlation.
		let request_id = match req.headers().get(x_headers::X_REQUEST_ID) {
			Some(v) => v.to_str().unwrap_or_default().to_string(),
			None => {
				let id = generate_request_id();
				if let Ok(v) = HeaderValue::try_from(id.clone()) {
					req.headers_mut().insert(x_headers::X_REQUEST_ID, v);
				}
				id
			},
		};
		log.request_id = Some(request_id);

		// 6. Route match (buffering the body only if some route matches on it).
		let match_body = if snapshot.routes.needs_body() {
			let bytes = crate::http::inspect_body(req.body_mut(), MATCH_BODY_LIMIT)
				.await
				.map_err(|_| ProxyError::BodyTooLarge)?;
			serde_json::from_slice::<serde_json::Value>(&bytes).ok()
		} else {
			None
		};
		let (route, params) = snapshot
			.routes
			.select(&host, req.method(), req.uri().path(), req, match_body.as_ref())
			.ok_or(ProxyError::RouteNotFound)?;
		ctx.route_id = Some(route.id.clone());
		ctx.path_params = params;
		log.route = Some(route.id.clone());
		debug!(route = %route.id, "selected route");

		let features = route.features.clone();
		let policies = self
			.inputs
			.stores
			.policies()
			.get(&route.id)
			.unwrap_or_else(|| Arc::new(RoutePolicies::empty()));

		if route.config.passthrough {
			return self
				.passthrough(snapshot, ctx, log, &route, &features, req)
				.await;
		}

		// 7. Body size cap, decompression.
		let max_body = features.max_body_size.unwrap_or(DEFAULT_MAX_BODY);
		let mut body = crate::http::inspect_body(req.body_mut(), max_body as usize)
			.await
			.map_err(|_| ProxyError::BodyTooLarge)?;
		if features.decompression.unwrap_or(true)
			&& let Some(decompressed) = crate::http::compression::decompress_request(
				&body,
				req.headers().get(header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()),
			)
			.await?
		{
			req.headers_mut().remove(header::CONTENT_ENCODING);
			req.headers_mut().remove(header::CONTENT_LENGTH);
			body = decompressed;
			*req.body_mut() = Body::from(body.clone());
		}

		// 8. Authentication, revocation, claims propagation.
		if let Some(auth) = &features.auth {
			self
				.inputs
				.stores
				.authenticator()
				.apply(auth, ctx, req)
				.await?;
			if let Some(ext) = &features.ext_auth
				&& auth.methods.contains(&AuthMethod::ExtAuth)
			{
				let mut builder = ::http::Request::builder().method("POST").uri(&ext.url);
				for name in &ext.copy_headers {
					if let Some(v) = req.headers().get(name.as_str()) {
						builder = builder.header(name.as_str(), v.clone());
					}
				}
				if let Some(auth_header) = req.headers().get(header::AUTHORIZATION) {
					builder = builder.header(header::AUTHORIZATION, auth_header.clone());
				}
				let check = builder
					.body(Body::empty())
					.map_err(|e| ProxyError::Processing(e.into()))?;
				self.check_ext_auth(ext, ctx, check).await?;
			}
		}
		let jti = ctx
			.claim("jti")
			.and_then(|v| v.as_str())
			.map(|s| s.to_string());
		self
			.inputs
			.stores
			.revocation()
			.check_request(crate::http::auth::bearer_token(req), jti.as_deref())
			.await?;
		if let Some(client) = ctx.client_id()
			&& snapshot.config.tenants.contains_key(client)
		{
			ctx.tenant = Some(client.clone());
		}

		// 9. CSRF, nonce, CORS preflight.
		if let Some(csrf) = &features.csrf {
			crate::http::csrf::check(csrf, req)?;
		}
		if let Some(nonce) = &security.nonce {
			self.inputs.stores.check_nonce(nonce, req)?;
		}
		let mut response_headers = ::http::HeaderMap::new();
		if let Some(cors) = &policies.cors {
			let out = cors.apply(req);
			if let Some(direct) = out.direct_response {
				return Ok(direct);
			}
			merge_in_headers(out.response_headers, &mut response_headers);
		}

		// 10. Rate limit, spike arrest, quota.
		if let Some(limiter) = self.inputs.stores.limiters().get(&route.id) {
			limiter.check(ctx, req).await.inspect_err(|_| {
				self
					.inputs
					.metrics
					.rate_limited
					.get_or_create(&crate::telemetry::metrics::RouteLabels {
						route: route.id.to_string(),
					})
					.inc();
			})?;
		}
		if let Some(spike) = self.inputs.stores.spike_arresters().get(&route.id) {
			spike.check(ctx, req)?;
		}
		if let Some(quota) = self.inputs.stores.quotas().get(&route.id) {
			let tenant_limit = ctx
				.tenant
				.as_ref()
				.and_then(|t| snapshot.config.tenants.get(t))
				.and_then(|t| t.quota.as_ref())
				.map(|q| q.limit);
			quota.check(ctx, req, tenant_limit).inspect_err(|_| {
				self
					.inputs
					.metrics
					.quota_exceeded
					.get_or_create(&crate::telemetry::metrics::RouteLabels {
						route: route.id.to_string(),
					})
					.inc();
			})?;
		}

		// 11. WAF, schema validation.
		if let Some(waf) = &policies.waf {
			let inspect_body = features
				.waf
				.as_ref()
				.is_some_and(|w| w.inspect_body);
			waf.check(req, inspect_body.then_some(&body[..]))?;
		}
		if let Some(validation) = &features.validation {
			crate::http::openapi::validate_inline(validation, (!body.is_empty()).then_some(&body[..]))?;
		}

		// 12. Inbound signature verification.
		if let Some(verifier) = &policies.inbound_verifier {
			verifier.verify(req, &body)?;
		}

		// 13. Traffic group selection.
		if let Some(group) = self.select_traffic_group(snapshot, ctx, &route, &features, req) {
			ctx.traffic_group = Some(group.clone());
			if let Ok(v) = HeaderValue::try_from(group.as_str()) {
				response_headers.insert(x_headers::X_TRAFFIC_GROUP, v);
			}
			if let Some(sticky) = &features.sticky {
				let cookie = format!(
					"{}={}; Max-Age={}; Path=/",
					sticky.cookie_name,
					group,
					sticky.ttl.as_secs()
				);
				if let Ok(v) = HeaderValue::try_from(cookie) {
					response_headers.append(header::SET_COOKIE, v);
				}
			}
		}

		// 14. Request-phase rules.
		if let Some(rules) = &policies.rules {
			let out = crate::http::rules::apply_request_rules(&rules.request, ctx, req)?;
			if let Some(direct) = out.direct_response {
				return Ok(direct);
			}
			merge_in_headers(out.response_headers, &mut response_headers);
		}

		// 15. Redirect filter answers at the gateway.
		if let Some(redirect) = &features.redirect {
			return crate::http::filters::apply_redirect(redirect, req)
				.map_err(|e| ProxyError::Processing(e.into()));
		}

		// 16. Request header filters and body transform.
		if let Some(hm) = &policies.request_headers {
			hm.apply_request(ctx, req)
				.map_err(|e| ProxyError::Processing(e.into()))?;
		}
		if let Some(transform) = &policies.request_transform
			&& is_json(req.headers())
			&& !body.is_empty()
		{
			body = transform.apply(&body, ctx, req)?;
			req.headers_mut().remove(header::CONTENT_LENGTH);
			*req.body_mut() = Body::from(body.clone());
		}

		// 17. Idempotency replay.
		let idem = self.inputs.stores.idempotency().get(&route.id);
		let idem_key = match &idem {
			Some(store) if store.method_applies(req.method()) => store.extract_key(ctx, req)?,
			_ => None,
		};
		if let (Some(store), Some(key)) = (&idem, &idem_key)
			&& let Some(stored) = store.strict_lookup(key).await?
		{
			debug!(route = %route.id, "idempotency replay");
			return Ok(stored.into_response());
		}

		// 18. Response cache lookup.
		let cache = self.inputs.stores.cache_for_route(&route.id, &features);
		let fingerprint = cache
			.as_ref()
			.filter(|c| c.method_cacheable(req.method()))
			.map(|c| c.fingerprint(req));
		if let (Some(cache), Some(fp)) = (&cache, &fingerprint) {
			if let Some(hit) = cache.lookup(fp, req).await {
				log.cache_hit = true;
				self
					.inputs
					.metrics
					.cache_hits
					.get_or_create(&crate::telemetry::metrics::RouteLabels {
						route: route.id.to_string(),
					})
					.inc();
				return Ok(hit);
			}
			self
				.inputs
				.metrics
				.cache_misses
				.get_or_create(&crate::telemetry::metrics::RouteLabels {
					route: route.id.to_string(),
				})
				.inc();
		}

		// 19. Handler dispatch (echo / static / fastcgi / sequential / aggregate / proxy).
		let mut resp = self
			.dispatch(snapshot, ctx, log, &route, &features, &policies, req, body.clone())
			.await?;
		ctx.status = Some(resp.status().as_u16());

		// 20. Response phase.
		crate::http::statusmap::apply(&features.status_mapping, &mut resp);
		if let Some(rules) = &policies.rules {
			crate::http::rules::apply_response_rules(&rules.response, ctx, req, &mut resp)?;
		}
		if let Some(hm) = &policies.response_headers {
			hm.apply_response(ctx, req, resp.headers_mut())
				.map_err(|e| ProxyError::Processing(e.into()))?;
		}

		let response_limit = features.response_limit.unwrap_or(DEFAULT_RESPONSE_LIMIT);
		let needs_response_body = policies.response_transform.is_some()
			|| !features.replacements.is_empty()
			|| cache.is_some()
			|| idem_key.is_some()
			|| features.compression.is_some();
		if needs_response_body {
			let buffered = BufferedResponse::from_response(resp, response_limit as usize)
				.await
				.map_err(|_| ProxyError::ResponseTooLarge)?;
			let mut buffered = buffered;

			if let Some(transform) = &policies.response_transform
				&& is_json(&buffered.headers)
				&& !buffered.body.is_empty()
			{
				buffered.body = transform.apply(&buffered.body, ctx, req)?;
				buffered.headers.remove(header::CONTENT_LENGTH);
			}
			for replacement in &features.replacements {
				apply_replacement(replacement, &mut buffered);
			}

			// 21. Cache/idempotency stores run on the buffered envelope.
			if let (Some(cache), Some(fp)) = (&cache, fingerprint)
				&& cache.admissible(req.method(), buffered.status, buffered.body.len())
			{
				cache
					.store(fp, buffered.status, &buffered.headers, buffered.body.clone())
					.await;
			}
			if let (Some(store), Some(key)) = (&idem, idem_key)
				&& buffered.status.as_u16() < 500
			{
				store.store(key, &buffered).await;
			}

			resp = buffered.into_response();
			// 22. Compression last, over the final body.
			if let Some(compression) = &features.compression
				&& let Some(algo) = crate::http::compression::negotiate(compression, req)
			{
				resp = crate::http::compression::compress_response(compression, algo, resp).await?;
			}
		}

		if features.security_headers.unwrap_or(false) {
			apply_security_headers(resp.headers_mut());
		}
		merge_in_headers(Some(response_headers), resp.headers_mut());
		Ok(resp)
	}

	/// Passthrough routes stream both directions without buffering; only the connection-level
	/// and matching filters already ran.
	async fn passthrough(
		&self,
		snapshot: &Arc<RuntimeConfig>,
		ctx: &mut RequestContext,
		log: &mut RequestLog,
		route: &Arc<CompiledRoute>,
		features: &RouteFeatures,
		req: &mut Request,
	) -> Result<Response, ProxyError> {
		let backend = self
			.select_backend(snapshot, ctx, route, features, req)
			.await?;
		let request = std::mem::take(req);
		let request = prepare_upstream_request(request, route, ctx)?;
		self.single_attempt(ctx, log, features, &backend, request).await
	}

	async fn check_ext_auth(
		&self,
		config: &ExtAuthConfig,
		ctx: &mut RequestContext,
		check: Request,
	) -> Result<(), ProxyError> {
		match tokio::time::timeout(config.timeout, self.inputs.upstream.simple_call(check)).await {
			Ok(Ok(resp)) if resp.status().is_success() => {
				if ctx.identity.is_none() {
					ctx.identity = Some(crate::expr::Identity {
						client_id: "ext-auth".into(),
						auth_type: crate::expr::AuthType::ExtAuth,
						claims: Default::default(),
					});
				}
				Ok(())
			},
			Ok(Ok(resp)) => Err(ProxyError::AuthenticationFailed(format!(
				"external authorizer returned {}",
				resp.status()
			))),
			Ok(Err(err)) if config.fail_open => {
				warn!(%err, "ext auth unreachable, failing open");
				Ok(())
			},
			Err(_) if config.fail_open => {
				warn!("ext auth timed out, failing open");
				Ok(())
			},
			Ok(Err(err)) => Err(ProxyError::AuthenticationFailed(err.to_string())),
			Err(_) => Err(ProxyError::AuthenticationFailed(
				"external authorizer timed out".to_string(),
			)),
		}
	}

	/// Sticky cookie wins, then rules-assigned group, then blue/green, canary, A/B hash, and
	/// finally the configured weights.
	fn select_traffic_group(
		&self,
		snapshot: &Arc<RuntimeConfig>,
		ctx: &mut RequestContext,
		route: &Arc<CompiledRoute>,
		features: &RouteFeatures,
		req: &Request,
	) -> Option<Strng> {
		let ts = features.traffic_split.as_ref()?;
		let group_exists = |name: &str| ts.groups.iter().any(|g| g.name.as_str() == name);

		if let Some(assigned) = &ctx.traffic_group
			&& group_exists(assigned)
		{
			return Some(assigned.clone());
		}
		if let Some(sticky) = &features.sticky
			&& let Some(cookie) = ctx.resolve(
				&crate::expr::Var::Cookie(sticky.cookie_name.clone()),
				req,
			) && group_exists(&cookie)
		{
			return Some(Strng::from(cookie));
		}
		if let Some(bg) = &features.blue_green
			&& group_exists(&bg.active)
		{
			return Some(bg.active.clone());
		}

		let mut weights: Vec<(Strng, u32)> = ts
			.groups
			.iter()
			.map(|g| (g.name.clone(), g.weight))
			.collect();
		if let Some(canary) = &features.canary {
			// The active step's weight replaces the canary group's share; the rest is spread
			// over the other groups proportionally to their configured weights.
			let weight = self.current_canary_weight(canary);
			let other_total: u32 = weights
				.iter()
				.filter(|(name, _)| name != &canary.group)
				.map(|(_, w)| *w)
				.sum();
			for (name, w) in weights.iter_mut() {
				if name == &canary.group {
					*w = weight;
				} else if other_total > 0 {
					*w = *w * (100 - weight) / other_total;
				}
			}
		}
		if let Some(ab) = &features.ab_test
			&& !ab.groups.is_empty()
		{
			let key = crate::expr::extract_key(&ab.key, ctx, req).unwrap_or_default();
			let mut hasher = DefaultHasher::new();
			key.hash(&mut hasher);
			snapshot.config.server.port.hash(&mut hasher);
			let idx = (hasher.finish() % ab.groups.len() as u64) as usize;
			if group_exists(&ab.groups[idx]) {
				return Some(ab.groups[idx].clone());
			}
		}

		let total: u32 = weights.iter().map(|(_, w)| *w).sum();
		if total == 0 {
			return weights.first().map(|(name, _)| name.clone());
		}
		let mut roll = rand::rng().random_range(0..total);
		for (name, w) in &weights {
			if roll < *w {
				return Some(name.clone());
			}
			roll -= w;
		}
		weights.last().map(|(name, _)| name.clone())
	}

	fn current_canary_weight(&self, canary: &CanaryConfig) -> u32 {
		let mut elapsed = self.inputs.started.elapsed();
		for step in &canary.steps {
			match step.hold {
				Some(hold) if elapsed >= hold => elapsed -= hold,
				_ => return step.weight.min(100),
			}
		}
		canary.steps.last().map(|s| s.weight.min(100)).unwrap_or(0)
	}

	/// Resolves the pool for this request and picks a backend, honouring health and ejection.
	async fn select_backend(
		&self,
		snapshot: &Arc<RuntimeConfig>,
		ctx: &mut RequestContext,
		route: &Arc<CompiledRoute>,
		features: &RouteFeatures,
		req: &Request,
	) -> Result<Arc<BackendHandle>, ProxyError> {
		let upstreams = &snapshot.upstreams;

		// Tenant-specific backends take precedence when configured.
		if let Some(tenant) = &ctx.tenant
			&& let Some(pool) = upstreams.get(&crate::backend::tenant_pool(tenant))
		{
			return pick_from(pool, ctx, req);
		}
		if let Some(v) = &features.versioning {
			let version = self
				.extract_version(v, ctx, req)
				.or_else(|| v.default_version.clone())
				.ok_or(ProxyError::Rejected {
					status: StatusCode::BAD_REQUEST,
					message: "api version required".to_string(),
				})?;
			let pool = upstreams
				.get(&crate::backend::version_pool(&route.id, &version))
				.ok_or(ProxyError::Rejected {
					status: StatusCode::BAD_REQUEST,
					message: format!("unknown api version: {version}"),
				})?;
			return pick_from(pool, ctx, req);
		}
		if let Some(group) = &ctx.traffic_group
			&& let Some(pool) = upstreams.get(&crate::backend::group_pool(&route.id, group))
		{
			return pick_from(pool, ctx, req);
		}
		if let Some(name) = &route.config.upstream {
			let pool = upstreams
				.get(name)
				.ok_or(ProxyError::BackendDoesNotExist)?;
			return pick_from(pool, ctx, req);
		}
		if let Some(service) = &route.config.service {
			let targets = self.inputs.registry.resolve(&service.name).await?;
			if targets.is_empty() {
				return Err(ProxyError::NoHealthyBackends);
			}
			let target = targets[rand::rng().random_range(0..targets.len())].clone();
			let target = match (target, service.port) {
				(Target::Hostname(h, _), Some(port)) => Target::Hostname(h, port),
				(Target::Address(a), Some(port)) => Target::Address(SocketAddr::new(a.ip(), port)),
				(t, None) => t,
			};
			return BackendHandle::from_config(&crate::types::config::BackendConfig {
				url: format!("http://{target}"),
				weight: 1,
				health_check: None,
			})
			.map_err(ProxyError::Processing);
		}
		let pool = upstreams
			.get(&crate::backend::route_pool(&route.id))
			.ok_or(ProxyError::BackendDoesNotExist)?;
		pick_from(pool, ctx, req)
	}

	fn extract_version(
		&self,
		config: &VersioningConfig,
		ctx: &mut RequestContext,
		req: &Request,
	) -> Option<Strng> {
		use crate::expr::Var;
		let value = match config.strategy {
			VersioningStrategy::Header => {
				ctx.resolve(&Var::Header(config.name.to_ascii_lowercase()), req)
			},
			VersioningStrategy::Query => ctx.resolve(&Var::Query(config.name.clone()), req),
			VersioningStrategy::Path => {
				let idx: usize = config.name.parse().unwrap_or(1);
				req
					.uri()
					.path()
					.split('/')
					.filter(|s| !s.is_empty())
					.nth(idx.saturating_sub(1))
					.map(|s| s.to_string())
			},
		};
		value.map(Strng::from)
	}

	/// The proxy handler with coalescing, retries or hedging, circuit breaking, and budgets.
	#[allow(clippy::too_many_arguments)]
	async fn dispatch(
		&self,
		snapshot: &Arc<RuntimeConfig>,
		ctx: &mut RequestContext,
		log: &mut RequestLog,
		route: &Arc<CompiledRoute>,
		features: &Arc<RouteFeatures>,
		policies: &Arc<RoutePolicies>,
		req: &mut Request,
		body: Bytes,
	) -> Result<Response, ProxyError> {
		let rc = &route.config;
		if rc.echo {
			return handlers::echo(ctx, req, &body);
		}
		if let Some(static_cfg) = &rc.static_files {
			return handlers::static_files(static_cfg, route.stripped_path(req.uri().path())).await;
		}
		if let Some(fastcgi) = &rc.fastcgi {
			let request = std::mem::take(req);
			return self.inputs.fastcgi.forward(fastcgi, request, body).await;
		}
		if !rc.sequential.is_empty() {
			return handlers::sequential(&rc.sequential, &self.inputs.upstream, ctx, req).await;
		}
		if let Some(agg) = &rc.aggregate {
			return handlers::aggregate(agg, &self.inputs.upstream, ctx, req).await;
		}

		// Mirrors fire and forget before the main call.
		if let Some(mirror) = &features.mirror
			&& rand::rng().random_bool(mirror.percentage.clamp(0.0, 1.0))
		{
			self.send_mirror(mirror, req, &body);
		}

		let backend = self
			.select_backend(snapshot, ctx, route, features, req)
			.await?;
		ctx.backend = Some(backend.target.to_string());

		// Backend HMAC signing covers the final outgoing form of the request.
		if let Some(signer) = &policies.signer {
			signer.sign(req, &body)?;
		}

		// Coalesce identical in-flight requests when enabled.
		let coalescer = self.inputs.stores.coalescers().get(&route.id);
		if let Some(coalescer) = coalescer.filter(|c| c.method_eligible(req.method())) {
			let key = coalesce_key(&route.id, req);
			let request = clone_request(req, &body, route, ctx)?;
			let limit = features.response_limit.unwrap_or(DEFAULT_RESPONSE_LIMIT);
			let attempt = self.attempt_with_policies(
				snapshot,
				ctx,
				log,
				route,
				features,
				policies,
				request,
				body.clone(),
			);
			let leader_fut = async {
				let resp = attempt.await?;
				BufferedResponse::from_response(resp, limit as usize)
					.await
					.map_err(|_| ProxyError::ResponseTooLarge)
			};
			return match coalescer.run(key, leader_fut).await? {
				Outcome::Leader(result) => result.map(BufferedResponse::into_response),
				Outcome::Waiter(shared) => {
					log.coalesced = true;
					self
						.inputs
						.metrics
						.coalesced_requests
						.get_or_create(&crate::telemetry::metrics::RouteLabels {
							route: route.id.to_string(),
						})
						.inc();
					Ok(shared.into_response())
				},
			};
		}

		let request = clone_request(req, &body, route, ctx)?;
		self
			.attempt_with_policies(snapshot, ctx, log, route, features, policies, request, body)
			.await
	}

	/// Retry / hedging wrapper around single attempts, gated by breaker and budget.
	#[allow(clippy::too_many_arguments)]
	async fn attempt_with_policies(
		&self,
		snapshot: &Arc<RuntimeConfig>,
		ctx: &mut RequestContext,
		log: &mut RequestLog,
		route: &Arc<CompiledRoute>,
		features: &Arc<RouteFeatures>,
		policies: &Arc<RoutePolicies>,
		req: Request,
		body: Bytes,
	) -> Result<Response, ProxyError> {
		let budget = self
			.inputs
			.stores
			.budget_for_route(&route.id, features);
		if let Some(budget) = &budget {
			budget.record_request();
		}
		let retry_policy = policies.retry.clone();

		// Hedging is mutually exclusive with retries (validated).
		if let Some(policy) = &retry_policy
			&& let Some(hedging) = &policy.hedging
			&& policy.method_retryable(req.method())
		{
			return self
				.hedged(snapshot, ctx, log, route, features, policies, policy, hedging, req, body)
				.await;
		}

		let attempts = retry_policy
			.as_ref()
			.filter(|p| p.method_retryable(req.method()))
			.map(|p| p.max_retries + 1)
			.unwrap_or(1);

		let (head, _) = req.into_parts();
		let mut last_result: Option<Result<Response, ProxyError>> = None;
		for attempt in 0..attempts {
			if attempt > 0 {
				let policy = retry_policy.as_ref().expect("attempts > 1 implies policy");
				if let Some(budget) = &budget
					&& !budget.try_admit_retry()
				{
					debug!(route = %route.id, "retry budget exhausted");
					break;
				}
				self
					.inputs
					.metrics
					.retries
					.get_or_create(&crate::telemetry::metrics::RouteLabels {
						route: route.id.to_string(),
					})
					.inc();
				ctx.retry_attempt = attempt;
				tokio::time::sleep(policy.backoff(attempt)).await;
			}
			let mut request = rebuild_request(&head, &body);
			if attempt > 0
				&& let Ok(v) = HeaderValue::try_from(attempt.to_string())
			{
				request.headers_mut().insert(x_headers::X_RETRY_ATTEMPT, v);
			}
			let backend = self
				.select_backend(snapshot, ctx, route, features, &request)
				.await?;
			let result = self
				.single_attempt(ctx, log, features, &backend, request)
				.await;

			let last = attempt + 1 == attempts;
			let retryable = match (&result, &retry_policy) {
				(_, None) => false,
				(Ok(resp), Some(p)) => p.status_retryable(resp.status()),
				(Err(err), Some(_)) => err.is_retryable(),
			};
			if last || !retryable {
				return result;
			}
			debug!(route = %route.id, attempt, "attempt not successful, retrying");
			last_result = Some(result);
		}
		last_result.unwrap_or(Err(ProxyError::NoHealthyBackends))
	}

	/// Hedging issues up to `max_requests` parallel tries staggered by `delay`; the first
	/// non-retryable response wins and the losers are cancelled by drop.
	#[allow(clippy::too_many_arguments)]
	async fn hedged(
		&self,
		snapshot: &Arc<RuntimeConfig>,
		ctx: &mut RequestContext,
		_log: &mut RequestLog,
		route: &Arc<CompiledRoute>,
		features: &Arc<RouteFeatures>,
		_policies: &Arc<RoutePolicies>,
		policy: &retry::Policy,
		hedging: &retry::Hedging,
		req: Request,
		body: Bytes,
	) -> Result<Response, ProxyError> {
		let (head, _) = req.into_parts();
		let mut backends = Vec::new();
		for _ in 0..hedging.max_requests {
			let probe = rebuild_request(&head, &body);
			backends.push(
				self
					.select_backend(snapshot, ctx, route, features, &probe)
					.await?,
			);
		}

		let mut tries = FuturesUnordered::new();
		for (i, backend) in backends.into_iter().enumerate() {
			let request = rebuild_request(&head, &body);
			let delay = hedging.delay * i as u32;
			let this = self.clone();
			let features = features.clone();
			let window = features
				.outlier_detection
				.as_ref()
				.map(|o| o.window)
				.unwrap_or(Duration::from_secs(60));
			let per_try = per_try_timeout(&features, Some(policy));
			tries.push(async move {
				tokio::time::sleep(delay).await;
				attempt_once(&this, &features, window, per_try, &backend, request).await
			});
		}

		let mut last_err: Option<ProxyError> = None;
		while let Some(result) = tries.next().await {
			match result {
				Ok(resp) if !policy.status_retryable(resp.status()) => {
					ctx.status = Some(resp.status().as_u16());
					return Ok(resp);
				},
				Ok(resp) => {
					debug!(status = %resp.status(), "hedged try returned retryable status");
					last_err = Some(ProxyError::UpstreamCallFailed(format!(
						"hedged try returned {}",
						resp.status()
					)));
				},
				Err(err) if err.is_retryable() => {
					last_err = Some(err);
				},
				Err(err) => return Err(err),
			}
		}
		Err(last_err.unwrap_or(ProxyError::NoHealthyBackends))
	}

	/// One upstream attempt: breaker admission, in-flight accounting, per-try timeout,
	/// outcome recording, and upgrade handling.
	async fn single_attempt(
		&self,
		ctx: &mut RequestContext,
		log: &mut RequestLog,
		features: &RouteFeatures,
		backend: &Arc<BackendHandle>,
		mut request: Request,
	) -> Result<Response, ProxyError> {
		let breaker = ctx
			.route_id
			.as_ref()
			.and_then(|r| self.inputs.stores.breakers().get(r));
		let permit = match &breaker {
			Some(b) => Some(b.acquire().inspect_err(|_| {
				if let Some(route) = &ctx.route_id {
					self
						.inputs
						.metrics
						.breaker_opens
						.get_or_create(&crate::telemetry::metrics::RouteLabels {
							route: route.to_string(),
						})
						.inc();
				}
			})?),
			None => None,
		};

		let window = features
			.outlier_detection
			.as_ref()
			.map(|o| o.window)
			.unwrap_or(Duration::from_secs(60));
		let per_try = per_try_timeout(
			features,
			self
				.inputs
				.stores
				.policies()
				.get(ctx.route_id.as_deref().unwrap_or_default())
				.as_deref()
				.and_then(|p| p.retry.as_ref()),
		);
		let upgrade = extract_upgrade(&mut request);
		let result = attempt_once(self, features, window, per_try, backend, request).await;

		match &result {
			Ok(resp) => {
				ctx.upstream_status = Some(resp.status().as_u16());
				let failure = resp.status().is_server_error();
				if let Some(p) = permit {
					p.record(!failure);
				}
			},
			Err(_) => {
				if let Some(p) = permit {
					p.record(false);
				}
			},
		}
		log.upstream_status = ctx.upstream_status;

		match result {
			Ok(resp) if resp.status() == StatusCode::SWITCHING_PROTOCOLS => {
				handle_upgrade(upgrade, resp).await
			},
			other => other,
		}
	}

	fn send_mirror(&self, mirror: &MirrorConfig, req: &Request, body: &Bytes) {
		let Ok((target, tls)) = Target::parse_url(&mirror.backend) else {
			return;
		};
		let mut builder = ::http::Request::builder()
			.method(req.method().clone())
			.uri(req.uri().clone());
		for (name, value) in req.headers() {
			builder = builder.header(name, value);
		}
		let Ok(mut mirrored) = builder.body(Body::from(body.clone())) else {
			return;
		};
		mirrored.headers_mut().remove(header::CONTENT_LENGTH);
		let client = self.inputs.upstream.clone();
		tokio::spawn(async move {
			if let Err(err) = client.call(mirrored, &target, tls).await {
				debug!(%err, "mirror request failed");
			}
		});
	}
}

fn pick_from(
	pool: &Arc<Upstream>,
	ctx: &mut RequestContext,
	req: &Request,
) -> Result<Arc<BackendHandle>, ProxyError> {
	let hash_key = pool
		.balancer
		.hash_key_config()
		.map(|cfg| balance::resolve_hash_key(cfg, ctx, req));
	pool
		.pick(hash_key.as_deref())
		.ok_or(ProxyError::NoHealthyBackends)
}

fn per_try_timeout(features: &RouteFeatures, policy: Option<&retry::Policy>) -> Duration {
	let timeouts = features.timeouts.clone().unwrap_or_default();
	let deadlines = crate::http::timeout::Deadlines::from(&timeouts);
	deadlines.per_try(policy.and_then(|p| p.per_try_timeout))
}

/// Sends one request to one backend, tracking in-flight count and the outcome history.
async fn attempt_once(
	proxy: &HTTPProxy,
	features: &RouteFeatures,
	window: Duration,
	per_try: Duration,
	backend: &Arc<BackendHandle>,
	request: Request,
) -> Result<Response, ProxyError> {
	use std::sync::atomic::Ordering;
	if let Some(ssrf) = &features.ssrf {
		crate::client::verify_target(ssrf, &backend.target).await?;
	}
	backend.inflight.fetch_add(1, Ordering::Relaxed);
	let start = Instant::now();
	proxy
		.inputs
		.metrics
		.upstream_attempts
		.get_or_create(&crate::telemetry::metrics::BackendLabels {
			backend: backend.target.to_string(),
		})
		.inc();

	let call = proxy
		.inputs
		.upstream
		.call(request, &backend.target, backend.tls);
	let result = match tokio::time::timeout(per_try, call).await {
		Ok(result) => result,
		Err(_) => Err(ProxyError::UpstreamTimeout),
	};
	backend.inflight.fetch_sub(1, Ordering::Relaxed);

	let latency = start.elapsed();
	let error = match &result {
		Ok(resp) => resp.status().is_server_error(),
		Err(_) => true,
	};
	backend.record_result(error, latency, window);
	if error {
		proxy
			.inputs
			.metrics
			.upstream_failures
			.get_or_create(&crate::telemetry::metrics::BackendLabels {
				backend: backend.target.to_string(),
			})
			.inc();
	}
	result
}

/// Rewrites the path for strip_prefix / rewrite config and strips hop-by-hop headers. Used on
/// the buffered path where a fresh request is built per attempt.
fn clone_request(
	req: &Request,
	body: &Bytes,
	route: &Arc<CompiledRoute>,
	ctx: &mut RequestContext,
) -> Result<Request, ProxyError> {
	let mut builder = ::http::Request::builder()
		.method(req.method().clone())
		.uri(req.uri().clone())
		.version(normalize_version(req.version()));
	for (name, value) in req.headers() {
		builder = builder.header(name, value);
	}
	let mut cloned = builder
		.body(Body::from(body.clone()))
		.map_err(|e| ProxyError::Processing(e.into()))?;
	prepare_common(&mut cloned, route, ctx)?;
	Ok(cloned)
}

/// The streaming variant: keeps the original body and extensions (upgrades).
fn prepare_upstream_request(
	mut req: Request,
	route: &Arc<CompiledRoute>,
	ctx: &mut RequestContext,
) -> Result<Request, ProxyError> {
	*req.version_mut() = normalize_version(req.version());
	prepare_common(&mut req, route, ctx)?;
	Ok(req)
}

fn prepare_common(
	req: &mut Request,
	route: &Arc<CompiledRoute>,
	ctx: &mut RequestContext,
) -> Result<(), ProxyError> {
	if route.strip_prefix {
		let stripped = route.stripped_path(req.uri().path()).to_string();
		crate::http::modify_req_uri(req, |parts| {
			let query = parts
				.path_and_query
				.as_ref()
				.and_then(|pq| pq.query())
				.map(|q| format!("?{q}"))
				.unwrap_or_default();
			parts.path_and_query = Some(format!("{stripped}{query}").parse()?);
			Ok(())
		})
		.map_err(ProxyError::Processing)?;
	}
	if let Some(rewrite) = &route.features.rewrite {
		let matched_prefix = route.config.path_prefix.then_some(route.config.path.as_str());
		crate::http::filters::apply_rewrite(rewrite, matched_prefix, req)
			.map_err(|e| ProxyError::Processing(e.into()))?;
	}
	let _ = ctx;
	strip_hop_headers(req);
	Ok(())
}

fn rebuild_request(head: &::http::request::Parts, body: &Bytes) -> Request {
	let mut builder = ::http::Request::builder()
		.method(head.method.clone())
		.uri(head.uri.clone())
		.version(head.version);
	for (name, value) in &head.headers {
		builder = builder.header(name, value);
	}
	builder
		.body(Body::from(body.clone()))
		.expect("parts were valid before")
}

fn normalize_version(version: ::http::Version) -> ::http::Version {
	// The upstream pool negotiates its own version; HTTP/2 pseudo-header requests cannot be
	// replayed verbatim over HTTP/1 connections.
	match version {
		::http::Version::HTTP_2 | ::http::Version::HTTP_3 => ::http::Version::HTTP_11,
		v => v,
	}
}

// Hop-by-hop headers are stripped before forwarding; RFC 7230 obsoleted-but-still-seen ones
// included.
static HOP_HEADERS: [&str; 9] = [
	"connection",
	"proxy-connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

fn strip_hop_headers(req: &mut Request) {
	let upgrade = upgrade_type(req.headers());
	for h in HOP_HEADERS {
		req.headers_mut().remove(h);
	}
	// Re-add what is needed for protocol upgrades such as websockets.
	if let Some(upgrade) = upgrade {
		req
			.headers_mut()
			.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
		req.headers_mut().insert(header::UPGRADE, upgrade);
	}
}

fn upgrade_type(headers: &::http::HeaderMap) -> Option<HeaderValue> {
	let connection = headers.get(header::CONNECTION)?.to_str().ok()?;
	if connection
		.split(',')
		.any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
	{
		headers.get(header::UPGRADE).cloned()
	} else {
		None
	}
}

struct RequestUpgrade {
	upgrade_type: HeaderValue,
	upgrade: OnUpgrade,
}

fn extract_upgrade(req: &mut Request) -> Option<RequestUpgrade> {
	let upgrade_type = upgrade_type(req.headers())?;
	let upgrade = req.extensions_mut().remove::<OnUpgrade>()?;
	Some(RequestUpgrade {
		upgrade_type,
		upgrade,
	})
}

async fn handle_upgrade(
	req_upgrade: Option<RequestUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(RequestUpgrade {
		upgrade_type,
		upgrade,
	}) = req_upgrade
	else {
		return Err(ProxyError::UpstreamCallFailed(
			"backend attempted an upgrade the client did not request".to_string(),
		));
	};
	let resp_upgrade_type = upgrade_type_resp(resp.headers());
	if resp_upgrade_type.as_ref() != Some(&upgrade_type) {
		return Err(ProxyError::UpstreamCallFailed(format!(
			"upgrade mismatch: client asked {upgrade_type:?}, backend answered {resp_upgrade_type:?}"
		)));
	}
	let response_upgraded = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or_else(|| ProxyError::UpstreamCallFailed("backend upgrade unavailable".to_string()))?
		.await
		.map_err(|e| ProxyError::UpstreamCallFailed(format!("upgrade failed: {e}")))?;
	tokio::spawn(async move {
		let downstream = match upgrade.await {
			Ok(upgraded) => upgraded,
			Err(err) => {
				debug!(%err, "client upgrade failed");
				return;
			},
		};
		let mut downstream = TokioIo::new(downstream);
		let mut upstream = TokioIo::new(response_upgraded);
		if let Err(err) = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
			debug!(%err, "upgraded tunnel closed with error");
		}
	});
	Ok(resp)
}

fn upgrade_type_resp(headers: &::http::HeaderMap) -> Option<HeaderValue> {
	upgrade_type(headers)
}

fn coalesce_key(route: &str, req: &Request) -> String {
	format!(
		"{route}:{}:{}:{}?{}",
		req.method(),
		req.uri().host().unwrap_or(""),
		req.uri().path(),
		req.uri().query().unwrap_or("")
	)
}

fn is_json(headers: &::http::HeaderMap) -> bool {
	headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|ct| ct.starts_with("application/json"))
}

fn apply_replacement(replacement: &ContentReplacement, buffered: &mut BufferedResponse) {
	let content_type = buffered
		.headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	let applies = replacement.content_types.is_empty()
		|| replacement
			.content_types
			.iter()
			.any(|t| content_type.starts_with(t.as_str()));
	if !applies {
		return;
	}
	if let Ok(text) = std::str::from_utf8(&buffered.body)
		&& text.contains(replacement.from.as_str())
	{
		let replaced = text.replace(replacement.from.as_str(), &replacement.to);
		buffered.body = Bytes::from(replaced);
		buffered.headers.remove(header::CONTENT_LENGTH);
	}
}

fn apply_security_headers(headers: &mut ::http::HeaderMap) {
	let set = |headers: &mut ::http::HeaderMap, name: &'static str, value: &'static str| {
		headers.insert(name, HeaderValue::from_static(value));
	};
	set(headers, "x-content-type-options", "nosniff");
	set(headers, "x-frame-options", "DENY");
	set(headers, "referrer-policy", "no-referrer");
	set(
		headers,
		"strict-transport-security",
		"max-age=31536000; includeSubDomains",
	);
}

fn generate_request_id() -> String {
	let mut bytes = [0u8; 16];
	rand::rng().fill(&mut bytes);
	hex::encode(bytes)
}

fn original_path_and_query(req: &Request) -> String {
	req
		.uri()
		.path_and_query()
		.map(|pq| pq.to_string())
		.unwrap_or_else(|| "/".to_string())
}

// The http library will not put the authority into the URI for HTTP/1; normalize so the rest
// of the pipeline can rely on it.
fn normalize_uri(ctx: &RequestContext, req: &mut Request) -> Result<(), ProxyError> {
	if let ::http::Version::HTTP_10 | ::http::Version::HTTP_11 = req.version()
		&& req.uri().authority().is_none()
	{
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.and_then(|h| h.parse::<Authority>().ok())
			.ok_or(ProxyError::InvalidRequest)?;
		req.headers_mut().remove(header::HOST);
		crate::http::modify_req_uri(req, |parts| {
			parts.authority = Some(host);
			parts.scheme = Some(if ctx.tls.is_some() {
				Scheme::HTTPS
			} else {
				Scheme::HTTP
			});
			if parts.path_and_query.is_none() {
				parts.path_and_query = Some("/".parse().expect("static path"));
			}
			Ok(())
		})
		.map_err(ProxyError::Processing)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hop_headers_are_stripped_but_upgrade_survives() {
		let mut req: Request = ::http::Request::builder()
			.uri("http://h/")
			.header("connection", "upgrade")
			.header("upgrade", "websocket")
			.header("te", "trailers")
			.header("transfer-encoding", "chunked")
			.body(Body::empty())
			.unwrap();
		strip_hop_headers(&mut req);
		assert_eq!(req.headers().get(header::UPGRADE).unwrap(), "websocket");
		assert_eq!(req.headers().get(header::CONNECTION).unwrap(), "upgrade");
		assert!(req.headers().get("te").is_none());
		assert!(req.headers().get("transfer-encoding").is_none());
	}

	#[test]
	fn coalesce_keys_distinguish_query() {
		let a = ::http::Request::builder()
			.uri("http://h/p?x=1")
			.body(Body::empty())
			.unwrap();
		let b = ::http::Request::builder()
			.uri("http://h/p?x=2")
			.body(Body::empty())
			.unwrap();
		assert_ne!(coalesce_key("r", &a), coalesce_key("r", &b));
		assert_eq!(coalesce_key("r", &a), coalesce_key("r", &a));
	}

	#[test]
	fn request_ids_are_unique_hex() {
		let a = generate_request_id();
		let b = generate_request_id();
		assert_eq!(a.len(), 32);
		assert_ne!(a, b);
	}

	#[test]
	fn replacement_respects_content_type() {
		let mut buffered = BufferedResponse {
			status: StatusCode::OK,
			headers: {
				let mut h = ::http::HeaderMap::new();
				h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
				h
			},
			body: Bytes::from_static(b"internal.example.com is served by internal.example.com"),
		};
		apply_replacement(
			&ContentReplacement {
				from: "internal.example.com".into(),
				to: "api.example.com".into(),
				content_types: vec!["text/".into()],
			},
			&mut buffered,
		);
		assert_eq!(
			&buffered.body[..],
			b"api.example.com is served by api.example.com"
		);

		let mut image = BufferedResponse {
			status: StatusCode::OK,
			headers: {
				let mut h = ::http::HeaderMap::new();
				h.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
				h
			},
			body: Bytes::from_static(b"internal.example.com"),
		};
		apply_replacement(
			&ContentReplacement {
				from: "internal.example.com".into(),
				to: "api.example.com".into(),
				content_types: vec!["text/".into()],
			},
			&mut image,
		);
		assert_eq!(&image.body[..], b"internal.example.com");
	}
}
