use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

use crate::client::Client;
use crate::expr::{RequestContext, Template};
use crate::http::{Body, HeaderValue, Request, Response, StatusCode, header};
use crate::proxy::ProxyError;
use crate::types::route::{AggregateConfig, ChainStepConfig, StaticConfig};
use crate::*;

/// Echo handler: reflects the request back as JSON. Useful for wiring checks and tests.
pub fn echo(
	ctx: &RequestContext,
	req: &Request,
	body: &[u8],
) -> Result<Response, ProxyError> {
	let headers: Map<String, Value> = req
		.headers()
		.iter()
		.map(|(k, v)| {
			(
				k.to_string(),
				Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
			)
		})
		.collect();
	let payload = serde_json::json!({
		"method": req.method().as_str(),
		"path": req.uri().path(),
		"query": req.uri().query(),
		"headers": headers,
		"client_ip": ctx.client_ip.to_string(),
		"body": String::from_utf8_lossy(body),
	});
	Ok(
		::http::Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(payload.to_string()))
			.expect("static response must build"),
	)
}

/// Static file handler: serves files under the configured root with index resolution.
/// Path traversal is rejected before touching the filesystem.
pub async fn static_files(
	config: &StaticConfig,
	sub_path: &str,
) -> Result<Response, ProxyError> {
	let rel = sub_path.trim_start_matches('/');
	let rel_path = Path::new(rel);
	if rel_path
		.components()
		.any(|c| !matches!(c, Component::Normal(_)))
	{
		return Err(ProxyError::Rejected {
			status: StatusCode::BAD_REQUEST,
			message: "invalid path".to_string(),
		});
	}
	let mut full: PathBuf = config.root.join(rel_path);
	match tokio::fs::metadata(&full).await {
		Ok(meta) if meta.is_dir() => full = full.join(&config.index),
		Ok(_) => {},
		Err(_) if rel.is_empty() => full = config.root.join(&config.index),
		Err(_) => {},
	}
	let bytes = match tokio::fs::read(&full).await {
		Ok(bytes) => bytes,
		Err(_) => {
			return Err(ProxyError::Rejected {
				status: StatusCode::NOT_FOUND,
				message: "file not found".to_string(),
			});
		},
	};
	Ok(
		::http::Response::builder()
			.status(StatusCode::OK)
			.header(
				header::CONTENT_TYPE,
				content_type_for(full.extension().and_then(|e| e.to_str())),
			)
			.body(Body::from(bytes))
			.expect("static response must build"),
	)
}

fn content_type_for(ext: Option<&str>) -> HeaderValue {
	HeaderValue::from_static(match ext {
		Some("html") | Some("htm") => "text/html; charset=utf-8",
		Some("css") => "text/css",
		Some("js") => "application/javascript",
		Some("json") => "application/json",
		Some("png") => "image/png",
		Some("jpg") | Some("jpeg") => "image/jpeg",
		Some("gif") => "image/gif",
		Some("svg") => "image/svg+xml",
		Some("ico") => "image/x-icon",
		Some("txt") => "text/plain; charset=utf-8",
		Some("xml") => "application/xml",
		Some("pdf") => "application/pdf",
		Some("wasm") => "application/wasm",
		_ => "application/octet-stream",
	})
}

/// Sequential chain: sub-requests run in order; each step's JSON response is exposed to later
/// templates as `$response.*`. The final step's response is returned downstream.
pub async fn sequential(
	steps: &[ChainStepConfig],
	client: &Client,
	ctx: &mut RequestContext,
	req: &Request,
) -> Result<Response, ProxyError> {
	let mut last: Option<(StatusCode, Bytes)> = None;
	for (idx, step) in steps.iter().enumerate() {
		let sub = build_sub_request(&step.url, step.method.as_deref(), &step.headers, ctx, req)?;
		let sub = match &step.body {
			Some(body_tpl) => {
				let tpl = Template::compile(body_tpl)
					.map_err(|e| ProxyError::TransformationFailed(e))?;
				let rendered = tpl.resolve(ctx, req);
				sub.map(|_| Body::from(rendered))
			},
			None => sub,
		};
		let resp = client.simple_call(sub).await?;
		let status = resp.status();
		let bytes = axum::body::to_bytes(resp.into_body(), 8 << 20)
			.await
			.map_err(|e| ProxyError::Processing(e.into()))?;
		if step.abort_on_error && !status.is_success() {
			return Err(ProxyError::UpstreamCallFailed(format!(
				"chain step {idx} returned {status}"
			)));
		}
		// Expose the step result to subsequent templates.
		if let Ok(json) = serde_json::from_slice::<Value>(&bytes) {
			ctx.custom.insert("response".to_string(), json);
		}
		last = Some((status, bytes));
	}
	let (status, bytes) = last.ok_or_else(|| ProxyError::Processing(anyhow::anyhow!(
		"sequential chain has no steps"
	)))?;
	Ok(
		::http::Response::builder()
			.status(status)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(bytes))
			.expect("static response must build"),
	)
}

/// Parallel aggregate: sub-requests run concurrently; object responses merge under their
/// configured keys. `allow_partial` omits failed keys instead of failing the request.
pub async fn aggregate(
	config: &AggregateConfig,
	client: &Client,
	ctx: &mut RequestContext,
	req: &Request,
) -> Result<Response, ProxyError> {
	let mut subs = Vec::with_capacity(config.requests.len());
	for r in &config.requests {
		let sub = build_sub_request(&r.url, r.method.as_deref(), &r.headers, ctx, req)?;
		subs.push((r.key.clone(), sub));
	}
	let calls = subs.into_iter().map(|(key, sub)| {
		let client = client.clone();
		async move {
			let result = async {
				let resp = client.simple_call(sub).await?;
				let status = resp.status();
				let bytes = axum::body::to_bytes(resp.into_body(), 8 << 20)
					.await
					.map_err(|e| ProxyError::Processing(e.into()))?;
				if !status.is_success() {
					return Err(ProxyError::UpstreamCallFailed(format!(
						"aggregate {key} returned {status}"
					)));
				}
				let value = serde_json::from_slice::<Value>(&bytes)
					.unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into_owned()));
				Ok::<Value, ProxyError>(value)
			}
			.await;
			(key, result)
		}
	});
	let results = futures::future::join_all(calls).await;

	let mut merged = Map::new();
	for (key, result) in results {
		match result {
			Ok(value) => {
				merged.insert(key, value);
			},
			Err(err) if config.allow_partial => {
				debug!(key, %err, "aggregate sub-request failed, omitting");
			},
			Err(err) => return Err(err),
		}
	}
	Ok(
		::http::Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(Value::Object(merged).to_string()))
			.expect("static response must build"),
	)
}

/// FastCGI is config-surface only; the wire codec is an external collaborator plugged in
/// through this trait. Without one installed, FastCGI routes answer 501.
#[async_trait::async_trait]
pub trait FastcgiCodec: Send + Sync {
	async fn forward(
		&self,
		config: &crate::types::route::FastcgiConfig,
		req: Request,
		body: Bytes,
	) -> Result<Response, ProxyError>;
}

pub struct NoFastcgi;

#[async_trait::async_trait]
impl FastcgiCodec for NoFastcgi {
	async fn forward(
		&self,
		_config: &crate::types::route::FastcgiConfig,
		_req: Request,
		_body: Bytes,
	) -> Result<Response, ProxyError> {
		Err(ProxyError::Rejected {
			status: StatusCode::NOT_IMPLEMENTED,
			message: "no fastcgi codec installed".to_string(),
		})
	}
}

fn build_sub_request(
	url: &str,
	method: Option<&str>,
	headers: &indexmap::IndexMap<String, String>,
	ctx: &mut RequestContext,
	req: &Request,
) -> Result<Request, ProxyError> {
	let url_tpl = Template::compile(url).map_err(ProxyError::TransformationFailed)?;
	let resolved_url = url_tpl.resolve(ctx, req);
	let mut builder = ::http::Request::builder()
		.method(method.unwrap_or("GET"))
		.uri(resolved_url);
	for (name, value_tpl) in headers {
		let tpl = Template::compile(value_tpl).map_err(ProxyError::TransformationFailed)?;
		builder = builder.header(name.as_str(), tpl.resolve(ctx, req));
	}
	builder
		.body(Body::empty())
		.map_err(|e| ProxyError::Processing(e.into()))
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;
	use crate::serdes::yamlviajson;

	fn ctx() -> RequestContext {
		RequestContext::new("1.2.3.4:1".parse().unwrap(), ::http::Version::HTTP_11)
	}

	fn req() -> Request {
		::http::Request::builder()
			.method("POST")
			.uri("http://gw.local/api/run?user=7")
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn echo_reflects_the_request() {
		let resp = echo(&ctx(), &req(), b"hello").unwrap();
		let body = futures::executor::block_on(axum::body::to_bytes(resp.into_body(), 1 << 20)).unwrap();
		let v: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(v["method"], "POST");
		assert_eq!(v["path"], "/api/run");
		assert_eq!(v["body"], "hello");
		assert_eq!(v["client_ip"], "1.2.3.4");
	}

	#[tokio::test]
	async fn static_serves_files_and_indexes() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
		std::fs::write(dir.path().join("app.js"), "let x = 1;").unwrap();
		let config = StaticConfig {
			root: dir.path().to_path_buf(),
			index: "index.html".to_string(),
		};

		let resp = static_files(&config, "/").await.unwrap();
		assert_eq!(
			resp.headers().get(header::CONTENT_TYPE).unwrap(),
			"text/html; charset=utf-8"
		);

		let resp = static_files(&config, "/app.js").await.unwrap();
		assert_eq!(
			resp.headers().get(header::CONTENT_TYPE).unwrap(),
			"application/javascript"
		);

		assert!(static_files(&config, "/missing.css").await.is_err());
	}

	#[tokio::test]
	async fn static_rejects_traversal() {
		let dir = tempfile::tempdir().unwrap();
		let config = StaticConfig {
			root: dir.path().to_path_buf(),
			index: "index.html".to_string(),
		};
		let err = static_files(&config, "/../etc/passwd").await.unwrap_err();
		assert!(matches!(
			err,
			ProxyError::Rejected { status, .. } if status == StatusCode::BAD_REQUEST
		));
	}

	#[tokio::test]
	async fn sequential_chains_responses() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/first"))
			.respond_with(
				ResponseTemplate::new(200).set_body_raw(r#"{"token": "t-123"}"#, "application/json"),
			)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/second"))
			.respond_with(
				ResponseTemplate::new(200).set_body_raw(r#"{"done": true}"#, "application/json"),
			)
			.mount(&server)
			.await;

		let steps: Vec<ChainStepConfig> = yamlviajson::from_str(&format!(
			r#"
- url: "{0}/first"
- url: "{0}/second"
  method: POST
  headers: {{x-token: "$response.token"}}
"#,
			server.uri()
		))
		.unwrap();
		let mut c = ctx();
		let resp = sequential(&steps, &Client::for_tests(), &mut c, &req())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		// The first response was exposed to the second step's templates.
		assert_eq!(c.custom["response"]["done"], true);
	}

	#[tokio::test]
	async fn sequential_aborts_on_error_status() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/bad"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;
		let steps: Vec<ChainStepConfig> =
			yamlviajson::from_str(&format!("- url: \"{}/bad\"\n", server.uri())).unwrap();
		let err = sequential(&steps, &Client::for_tests(), &mut ctx(), &req())
			.await
			.unwrap_err();
		assert!(matches!(err, ProxyError::UpstreamCallFailed(_)));
	}

	#[tokio::test]
	async fn aggregate_merges_sub_responses() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(
				ResponseTemplate::new(200).set_body_raw(r#"{"count": 2}"#, "application/json"),
			)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/orders"))
			.respond_with(
				ResponseTemplate::new(200).set_body_raw(r#"[1, 2, 3]"#, "application/json"),
			)
			.mount(&server)
			.await;

		let config: AggregateConfig = yamlviajson::from_str(&format!(
			r#"
requests:
  - {{key: users, url: "{0}/users"}}
  - {{key: orders, url: "{0}/orders"}}
"#,
			server.uri()
		))
		.unwrap();
		let resp = aggregate(&config, &Client::for_tests(), &mut ctx(), &req())
			.await
			.unwrap();
		let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
		let v: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(v["users"]["count"], 2);
		assert_eq!(v["orders"], serde_json::json!([1, 2, 3]));
	}

	#[tokio::test]
	async fn aggregate_partial_failure_policy() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/ok"))
			.respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/down"))
			.respond_with(ResponseTemplate::new(502))
			.mount(&server)
			.await;

		let yaml = format!(
			r#"
requests:
  - {{key: ok, url: "{0}/ok"}}
  - {{key: down, url: "{0}/down"}}
allow_partial: true
"#,
			server.uri()
		);
		let config: AggregateConfig = yamlviajson::from_str(&yaml).unwrap();
		let resp = aggregate(&config, &Client::for_tests(), &mut ctx(), &req())
			.await
			.unwrap();
		let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
		let v: Value = serde_json::from_slice(&body).unwrap();
		assert!(v.get("ok").is_some());
		assert!(v.get("down").is_none());

		let mut strict: AggregateConfig = yamlviajson::from_str(&yaml).unwrap();
		strict.allow_partial = false;
		assert!(
			aggregate(&strict, &Client::for_tests(), &mut ctx(), &req())
				.await
				.is_err()
		);
	}
}
