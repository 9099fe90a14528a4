use crate::http::{Method, Request, header};
use crate::proxy::ProxyError;
use crate::types::features::CsrfConfig;
use crate::*;

/// Origin/Referer based CSRF protection for state-changing methods. Shadow mode logs the
/// would-be rejection and continues.
pub fn check(config: &CsrfConfig, req: &Request) -> Result<(), ProxyError> {
	if !config.enabled {
		return Ok(());
	}
	if matches!(
		*req.method(),
		Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
	) {
		return Ok(());
	}

	let source = req
		.headers()
		.get(header::ORIGIN)
		.or_else(|| req.headers().get(header::REFERER))
		.and_then(|v| v.to_str().ok());

	let ok = match source {
		Some(origin) => origin_allowed(config, req, origin),
		// Browsers send Origin on cross-site state changes; absence means non-browser traffic.
		None => true,
	};
	if ok {
		return Ok(());
	}
	if config.shadow {
		info!(origin = ?source, "csrf check would reject (shadow mode)");
		return Ok(());
	}
	Err(ProxyError::Rejected {
		status: http::StatusCode::FORBIDDEN,
		message: "cross-site request rejected".to_string(),
	})
}

fn origin_allowed(config: &CsrfConfig, req: &Request, origin: &str) -> bool {
	let origin_host = origin
		.strip_prefix("https://")
		.or_else(|| origin.strip_prefix("http://"))
		.unwrap_or(origin)
		.split('/')
		.next()
		.unwrap_or("");
	if config
		.allowed_origins
		.iter()
		.any(|allowed| allowed == origin || allowed == origin_host)
	{
		return true;
	}
	// Same-origin requests are always fine.
	req
		.uri()
		.host()
		.or_else(|| {
			req
				.headers()
				.get(header::HOST)
				.and_then(|v| v.to_str().ok())
		})
		.map(|host| {
			let host = host.split(':').next().unwrap_or(host);
			let origin_host = origin_host.split(':').next().unwrap_or(origin_host);
			host == origin_host
		})
		.unwrap_or(false)
}
