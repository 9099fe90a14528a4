pub mod auth;
pub mod blocklist;
pub mod cache;
pub mod circuitbreaker;
pub mod coalesce;
pub mod compression;
pub mod cors;
pub mod csrf;
pub mod filters;
pub mod idempotency;
pub mod ipfilter;
pub mod loadshed;
pub mod maintenance;
pub mod openapi;
pub mod quota;
pub mod ratelimit;
pub mod retry;
pub mod revocation;
pub mod route;
pub mod rules;
pub mod signing;
pub mod statusmap;
pub mod timeout;
pub mod transform;
pub mod waf;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};
use axum::body::to_bytes;
use bytes::Bytes;

use crate::proxy::{ProxyError, ProxyResponse};

pub mod x_headers {
	use http::HeaderName;

	pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
	pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
	pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
	pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
	pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
	pub const X_RETRY_ATTEMPT: HeaderName = HeaderName::from_static("x-retry-attempt");
	pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
	pub const X_TRAFFIC_GROUP: HeaderName = HeaderName::from_static("x-traffic-group");
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

pub fn get_host(req: &Request) -> Result<&str, ProxyError> {
	// We expect a normalized request, so this is always in the URI.
	let host = req.uri().host().ok_or(ProxyError::InvalidRequest)?;
	Ok(strip_port(host))
}

/// Buffers the body up to `limit` bytes and puts an equivalent body back.
pub async fn inspect_body(body: &mut Body, limit: usize) -> anyhow::Result<Bytes> {
	let orig = std::mem::replace(body, Body::empty());
	let bytes = to_bytes(orig, limit).await?;
	*body = Body::from(bytes.clone());
	Ok(bytes)
}

fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");
	if host_port.as_bytes().first() == Some(&b'[') {
		let i = host_port
			.find(']')
			.expect("parsing should validate brackets");
		&host_port[0..i + 1]
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

/// The outcome of one policy: keep going (possibly with response headers to add later), or
/// short-circuit with a direct response.
#[derive(Debug, Default)]
#[must_use]
pub struct PolicyResponse {
	pub direct_response: Option<Response>,
	pub response_headers: Option<HeaderMap>,
}

impl PolicyResponse {
	pub fn apply(self, hm: &mut HeaderMap) -> Result<(), ProxyResponse> {
		if let Some(mut dr) = self.direct_response {
			merge_in_headers(self.response_headers, dr.headers_mut());
			Err(ProxyResponse::DirectResponse(Box::new(dr)))
		} else {
			merge_in_headers(self.response_headers, hm);
			Ok(())
		}
	}

	pub fn should_short_circuit(&self) -> bool {
		self.direct_response.is_some()
	}

	pub fn with_response(self, other: Response) -> Self {
		PolicyResponse {
			direct_response: Some(other),
			response_headers: self.response_headers,
		}
	}

	pub fn merge(self, other: Self) -> Self {
		if other.direct_response.is_some() {
			other
		} else {
			match (self.direct_response, self.response_headers, other.response_headers) {
				(dr, None, None) => PolicyResponse {
					direct_response: dr,
					response_headers: None,
				},
				(dr, a, b) => PolicyResponse {
					direct_response: dr,
					response_headers: Some({
						let mut hm = HeaderMap::new();
						merge_in_headers(a, &mut hm);
						merge_in_headers(b, &mut hm);
						hm
					}),
				},
			}
		}
	}
}

pub fn merge_in_headers(additional_headers: Option<HeaderMap>, dest: &mut HeaderMap) {
	if let Some(rh) = additional_headers {
		for (k, v) in rh.into_iter() {
			let Some(k) = k else { continue };
			dest.insert(k, v);
		}
	}
}

/// A fully buffered response, cheap to clone and replay byte-for-byte.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl BufferedResponse {
	pub async fn from_response(resp: Response, limit: usize) -> anyhow::Result<BufferedResponse> {
		let (head, body) = resp.into_parts();
		let body = to_bytes(body, limit).await?;
		Ok(BufferedResponse {
			status: head.status,
			headers: head.headers,
			body,
		})
	}

	pub fn into_response(self) -> Response {
		let mut resp = ::http::Response::builder()
			.status(self.status)
			.body(Body::from(self.body))
			.expect("buffered response must rebuild");
		*resp.headers_mut() = self.headers;
		resp
	}
}

/// Renders the standard JSON error body `{error, status, details?}`.
pub fn error_response(status: StatusCode, error: &str, details: Option<&str>) -> Response {
	let body = match details {
		Some(d) => serde_json::json!({"error": error, "status": status.as_u16(), "details": d}),
		None => serde_json::json!({"error": error, "status": status.as_u16()}),
	};
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("static response must build")
}
