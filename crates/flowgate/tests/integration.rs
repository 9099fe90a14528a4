use std::net::SocketAddr;
use std::sync::Arc;

use flowgate::client::Client;
use flowgate::http::{Body, Request, Response, StatusCode};
use flowgate::proxy::httpproxy::HTTPProxy;
use flowgate::store::Stores;
use flowgate::types::listener::ListenerConfig;
use flowgate::{Config, GatewayInputs};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build_proxy(yaml: &str) -> HTTPProxy {
	let config: Config = flowgate::serdes::yamlviajson::from_str(yaml).expect("config parses");
	flowgate::config::validator::validate(&config).expect("config validates");
	let stores = Stores::new(Arc::new(config), Client::for_tests(), None).expect("stores build");
	let mut registry = prometheus_client::registry::Registry::default();
	let inputs = GatewayInputs::new(
		stores,
		&mut registry,
		Client::for_tests(),
		Arc::new(
			flowgate::discovery::MemoryRegistry::new(&Default::default()).expect("memory registry"),
		),
	);
	HTTPProxy {
		inputs,
		listener: Arc::new(ListenerConfig {
			id: "test".into(),
			address: ":8080".into(),
			protocol: Default::default(),
			tls: None,
			http: Default::default(),
			udp: Default::default(),
		}),
	}
}

fn peer(ip: &str) -> SocketAddr {
	format!("{ip}:40000").parse().unwrap()
}

fn get(uri: &str) -> Request {
	::http::Request::builder()
		.uri(uri)
		.header("host", "gw.test")
		.body(Body::empty())
		.unwrap()
}

async fn send(proxy: &HTTPProxy, ip: &str, req: Request) -> Response {
	proxy.proxy_request(peer(ip), None, req).await
}

async fn body_of(resp: Response) -> bytes::Bytes {
	axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap()
}

#[tokio::test]
async fn echo_route_answers_without_backend() {
	let proxy = build_proxy(
		r#"
routes:
  - {id: echo, path: /echo, echo: true}
"#,
	);
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/echo")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(&body_of(resp).await).unwrap();
	assert_eq!(body["path"], "/echo");
	assert_eq!(body["client_ip"], "9.9.9.9");
}

#[tokio::test]
async fn unmatched_path_is_404_with_json_envelope() {
	let proxy = build_proxy("routes:\n  - {id: only, path: /known, echo: true}\n");
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/other")).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	let body: serde_json::Value = serde_json::from_slice(&body_of(resp).await).unwrap();
	assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn token_bucket_admits_exactly_burst_in_one_second() {
	let proxy = build_proxy(
		r#"
routes:
  - id: limited
    path: /limited
    echo: true
    rate_limit: {rate: 5, period: 1s, burst: 5, key: ip}
"#,
	);
	let mut ok = 0;
	let mut limited = 0;
	for _ in 0..20 {
		let resp = send(&proxy, "1.2.3.4", get("http://gw.test/limited")).await;
		match resp.status() {
			StatusCode::OK => ok += 1,
			StatusCode::TOO_MANY_REQUESTS => limited += 1,
			other => panic!("unexpected status {other}"),
		}
	}
	assert_eq!(ok, 5);
	assert_eq!(limited, 15);
}

#[tokio::test]
async fn circuit_breaker_short_circuits_after_threshold() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/flaky"))
		.respond_with(ResponseTemplate::new(500))
		.expect(3)
		.mount(&server)
		.await;

	let proxy = build_proxy(&format!(
		r#"
routes:
  - id: flaky
    path: /flaky
    backends: [{{url: "{}"}}]
    circuit_breaker: {{failure_threshold: 3, timeout: 1s}}
"#,
		server.uri()
	));
	for _ in 0..3 {
		let resp = send(&proxy, "9.9.9.9", get("http://gw.test/flaky")).await;
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}
	// The 4th request must not reach the backend (expect(3) above verifies on drop).
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/flaky")).await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	assert!(resp.headers().get(::http::header::RETRY_AFTER).is_some());
}

#[tokio::test]
async fn revoked_bearer_token_is_rejected() {
	let proxy = build_proxy("routes:\n  - {id: open, path: /, path_prefix: true, echo: true}\n");
	proxy
		.inputs
		.stores
		.revocation()
		.revoke("abc-123".to_string(), std::time::Duration::from_secs(3600))
		.await;

	let req = ::http::Request::builder()
		.uri("http://gw.test/data")
		.header("host", "gw.test")
		// Any bearer token whose jti claim resolves to abc-123; the revocation check keys on
		// the jti extracted from verified claims, exercised here via the raw-token hash path.
		.header("authorization", "Bearer opaque-token")
		.body(Body::empty())
		.unwrap();
	// Unrevoked opaque token passes.
	let resp = proxy.proxy_request(peer("9.9.9.9"), None, req).await;
	assert_eq!(resp.status(), StatusCode::OK);

	// Revoking the hash of the raw token locks it out.
	let key = flowgate::http::revocation::RevocationStore::token_key("opaque-token", None);
	proxy
		.inputs
		.stores
		.revocation()
		.revoke(key, std::time::Duration::from_secs(3600))
		.await;
	let req = ::http::Request::builder()
		.uri("http://gw.test/data")
		.header("host", "gw.test")
		.header("authorization", "Bearer opaque-token")
		.body(Body::empty())
		.unwrap();
	let resp = proxy.proxy_request(peer("9.9.9.9"), None, req).await;
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	let body: serde_json::Value = serde_json::from_slice(&body_of(resp).await).unwrap();
	assert_eq!(body["error"], "Token has been revoked");
}

#[tokio::test]
async fn blocklisted_source_is_rejected() {
	let proxy = build_proxy(
		r#"
security:
  ip_blocklist:
    static: ["1.2.3.0/24"]
routes:
  - {id: open, path: /, path_prefix: true, echo: true}
"#,
	);
	let resp = send(&proxy, "1.2.3.4", get("http://gw.test/")).await;
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/")).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn proxied_request_reaches_backend_and_strips_prefix() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/users"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"users": []}"#, "application/json"))
		.mount(&server)
		.await;

	let proxy = build_proxy(&format!(
		r#"
routes:
  - id: api
    path: /api
    path_prefix: true
    strip_prefix: true
    backends: [{{url: "{}"}}]
"#,
		server.uri()
	));
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/api/users")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(&body_of(resp).await[..], br#"{"users": []}"#);
}

#[tokio::test]
async fn cache_serves_identical_bytes_within_ttl() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/data"))
		.respond_with(ResponseTemplate::new(200).set_body_raw("payload-1", "text/plain"))
		.expect(1)
		.mount(&server)
		.await;

	let proxy = build_proxy(&format!(
		r#"
routes:
  - id: cached
    path: /data
    backends: [{{url: "{}"}}]
    cache: {{ttl: 60s}}
"#,
		server.uri()
	));
	let first = body_of(send(&proxy, "9.9.9.9", get("http://gw.test/data")).await).await;
	let second_resp = send(&proxy, "9.9.9.9", get("http://gw.test/data")).await;
	assert_eq!(second_resp.headers().get("x-cache").unwrap(), "HIT");
	let second = body_of(second_resp).await;
	assert_eq!(first, second);
}

#[tokio::test]
async fn retries_reach_a_healthy_attempt() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/sometimes"))
		.respond_with(ResponseTemplate::new(502))
		.up_to_n_times(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/sometimes"))
		.respond_with(ResponseTemplate::new(200).set_body_raw("recovered", "text/plain"))
		.mount(&server)
		.await;

	let proxy = build_proxy(&format!(
		r#"
routes:
  - id: retry
    path: /sometimes
    backends: [{{url: "{}"}}]
    retry_policy: {{max_retries: 2, initial_backoff: 10ms}}
"#,
		server.uri()
	));
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/sometimes")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(&body_of(resp).await[..], b"recovered");
}

#[tokio::test]
async fn idempotent_replay_returns_first_response() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/orders"))
		.respond_with(ResponseTemplate::new(201).set_body_raw(r#"{"order": 1}"#, "application/json"))
		.expect(1)
		.mount(&server)
		.await;

	let proxy = build_proxy(&format!(
		r#"
routes:
  - id: orders
    path: /orders
    backends: [{{url: "{}"}}]
    idempotency: {{ttl: 1h}}
"#,
		server.uri()
	));
	let post = || {
		::http::Request::builder()
			.method("POST")
			.uri("http://gw.test/orders")
			.header("host", "gw.test")
			.header("Idempotency-Key", "k-1")
			.body(Body::empty())
			.unwrap()
	};
	let first = send_req(&proxy, post()).await;
	assert_eq!(first.status(), StatusCode::CREATED);
	let replay = send_req(&proxy, post()).await;
	assert_eq!(replay.status(), StatusCode::CREATED);
	assert_eq!(&body_of(replay).await[..], br#"{"order": 1}"#);
}

async fn send_req(proxy: &HTTPProxy, req: Request) -> Response {
	proxy.proxy_request(peer("9.9.9.9"), None, req).await
}

#[tokio::test]
async fn traffic_split_sticks_with_cookie() {
	let blue = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_raw("blue", "text/plain"))
		.mount(&blue)
		.await;
	let green = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_raw("green", "text/plain"))
		.mount(&green)
		.await;

	let proxy = build_proxy(&format!(
		r#"
routes:
  - id: split
    path: /
    path_prefix: true
    sticky: {{cookie_name: grp}}
    traffic_split:
      groups:
        - {{name: blue, weight: 50, backends: [{{url: "{}"}}]}}
        - {{name: green, weight: 50, backends: [{{url: "{}"}}]}}
"#,
		blue.uri(),
		green.uri()
	));
	// A pinned cookie always lands on its group.
	for _ in 0..5 {
		let req = ::http::Request::builder()
			.uri("http://gw.test/app")
			.header("host", "gw.test")
			.header("cookie", "grp=green")
			.body(Body::empty())
			.unwrap();
		let resp = send_req(&proxy, req).await;
		assert_eq!(
			resp.headers().get("x-traffic-group").unwrap(),
			"green"
		);
		assert_eq!(&body_of(resp).await[..], b"green");
	}
	// Without a cookie the gateway assigns a group and offers it as a sticky cookie.
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/app")).await;
	let cookie = resp
		.headers()
		.get(::http::header::SET_COOKIE)
		.unwrap()
		.to_str()
		.unwrap()
		.to_string();
	assert!(cookie.starts_with("grp="), "{cookie}");
}

#[tokio::test]
async fn maintenance_mode_bypasses_configured_paths() {
	let proxy = build_proxy(
		r#"
security:
  maintenance: {enabled: true, bypass_paths: ["/healthz"], retry_after: 60s}
routes:
  - {id: all, path: /, path_prefix: true, echo: true}
"#,
	);
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/api")).await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(resp.headers().get(::http::header::RETRY_AFTER).unwrap(), "60");
	let resp = send(&proxy, "9.9.9.9", get("http://gw.test/healthz")).await;
	assert_eq!(resp.status(), StatusCode::OK);
}
