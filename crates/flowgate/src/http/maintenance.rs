use crate::expr::RequestContext;
use crate::http::{Body, Request, Response, StatusCode, header};
use crate::types::config::MaintenanceConfig;
use crate::*;

/// Maintenance mode: everything gets 503 except configured bypass paths and source addresses.
pub fn check(
	config: &MaintenanceConfig,
	ctx: &RequestContext,
	req: &Request,
) -> Option<Response> {
	if !config.enabled {
		return None;
	}
	let path = req.uri().path();
	if config
		.bypass_paths
		.iter()
		.any(|p| path == p || (p.ends_with('/') && path.starts_with(p.as_str())))
	{
		return None;
	}
	if config
		.bypass_ips
		.iter()
		.any(|net| net.contains(&ctx.client_ip))
	{
		return None;
	}
	let mut resp = crate::http::error_response(
		StatusCode::SERVICE_UNAVAILABLE,
		"service is under maintenance",
		None,
	);
	if let Some(retry_after) = config.retry_after
		&& let Ok(v) = http::HeaderValue::try_from(retry_after.as_secs().to_string())
	{
		resp.headers_mut().insert(header::RETRY_AFTER, v);
	}
	Some(resp)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx(ip: &str) -> RequestContext {
		RequestContext::new(format!("{ip}:1").parse().unwrap(), ::http::Version::HTTP_11)
	}

	fn req(path: &str) -> Request {
		::http::Request::builder()
			.uri(path)
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn rejects_with_retry_after() {
		let cfg = MaintenanceConfig {
			enabled: true,
			retry_after: Some(Duration::from_secs(120)),
			..Default::default()
		};
		let resp = check(&cfg, &ctx("1.2.3.4"), &req("/api")).unwrap();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "120");
	}

	#[test]
	fn bypass_paths_and_ips() {
		let cfg = MaintenanceConfig {
			enabled: true,
			bypass_paths: vec!["/healthz".into()],
			bypass_ips: vec!["10.0.0.0/8".parse().unwrap()],
			retry_after: None,
		};
		assert!(check(&cfg, &ctx("1.2.3.4"), &req("/healthz")).is_none());
		assert!(check(&cfg, &ctx("10.1.1.1"), &req("/api")).is_none());
		assert!(check(&cfg, &ctx("1.2.3.4"), &req("/api")).is_some());
	}
}
