mod gateway;
pub mod handlers;
pub mod httpproxy;
pub mod tcpproxy;
pub mod udpproxy;

pub use gateway::Gateway;

use crate::http::{HeaderValue, Response, StatusCode, x_headers};
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum ProxyResponse {
	#[error("{0}")]
	Error(#[from] ProxyError),
	#[error("direct response")]
	DirectResponse(Box<Response>),
}

/// The request-path error taxonomy. `Rejected` carries a middleware refusal; upstream errors
/// map to 502/504; `Transient` style errors are consumed by the retry loop before surfacing.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no route matched")]
	RouteNotFound,
	#[error("invalid request")]
	InvalidRequest,
	#[error("{message}")]
	Rejected {
		status: StatusCode,
		message: String,
	},
	#[error("authentication failed: {0}")]
	AuthenticationFailed(String),
	#[error("rate limit exceeded")]
	RateLimitExceeded {
		limit: u64,
		remaining: u64,
		reset_seconds: u64,
	},
	#[error("quota exhausted")]
	QuotaExceeded { limit: u64, reset_seconds: u64 },
	#[error("upstream circuit is open")]
	CircuitOpen { retry_after: Duration },
	#[error("server is overloaded")]
	Overloaded,
	#[error("request body too large")]
	BodyTooLarge,
	#[error("response body too large")]
	ResponseTooLarge,
	#[error("no healthy backends")]
	NoHealthyBackends,
	#[error("backend does not exist")]
	BackendDoesNotExist,
	#[error("dns resolution failed")]
	DnsResolution,
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(String),
	#[error("upstream request timed out")]
	UpstreamTimeout,
	#[error("request timed out")]
	RequestTimeout,
	#[error("transformation failed: {0}")]
	TransformationFailed(String),
	#[error("coalesced request failed: {0}")]
	CoalesceFailed(String),
	#[error("timed out waiting for coalesced response")]
	CoalesceTimeout,
	#[error("required dependency unavailable: {0}")]
	DependencyUnavailable(String),
	#[error("processing failed: {0}")]
	Processing(#[source] anyhow::Error),
}

impl ProxyError {
	/// Transient errors are retried; everything else surfaces immediately.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			ProxyError::UpstreamCallFailed(_)
				| ProxyError::UpstreamTimeout
				| ProxyError::DnsResolution
				| ProxyError::NoHealthyBackends
		)
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::Rejected { status, .. } => *status,
			ProxyError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
			ProxyError::RateLimitExceeded { .. } | ProxyError::QuotaExceeded { .. } => {
				StatusCode::TOO_MANY_REQUESTS
			},
			ProxyError::CircuitOpen { .. }
			| ProxyError::Overloaded
			| ProxyError::NoHealthyBackends
			| ProxyError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::ResponseTooLarge => StatusCode::BAD_GATEWAY,
			ProxyError::BackendDoesNotExist => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::DnsResolution | ProxyError::UpstreamCallFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamTimeout | ProxyError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::CoalesceFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::CoalesceTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::TransformationFailed(_) | ProxyError::Processing(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		}
	}

	pub fn as_response(&self) -> Response {
		let status = self.status();
		let mut resp = crate::http::error_response(status, &self.to_string(), None);

		match self {
			ProxyError::RateLimitExceeded {
				limit,
				remaining,
				reset_seconds,
			} => {
				let headers = resp.headers_mut();
				if let Ok(hv) = HeaderValue::try_from(limit.to_string()) {
					headers.insert(x_headers::X_RATELIMIT_LIMIT, hv);
				}
				if let Ok(hv) = HeaderValue::try_from(remaining.to_string()) {
					headers.insert(x_headers::X_RATELIMIT_REMAINING, hv);
				}
				if let Ok(hv) = HeaderValue::try_from(reset_seconds.to_string()) {
					headers.insert(x_headers::X_RATELIMIT_RESET, hv);
					headers.insert(http::header::RETRY_AFTER, HeaderValue::try_from(
						reset_seconds.to_string(),
					).expect("numeric header value"));
				}
			},
			ProxyError::QuotaExceeded { reset_seconds, .. } => {
				if let Ok(hv) = HeaderValue::try_from(reset_seconds.to_string()) {
					resp.headers_mut().insert(http::header::RETRY_AFTER, hv);
				}
			},
			ProxyError::CircuitOpen { retry_after } => {
				if let Ok(hv) = HeaderValue::try_from(retry_after.as_secs().max(1).to_string()) {
					resp.headers_mut().insert(http::header::RETRY_AFTER, hv);
				}
			},
			_ => {},
		}
		resp
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_mapping_follows_taxonomy() {
		assert_eq!(ProxyError::RouteNotFound.status(), StatusCode::NOT_FOUND);
		assert_eq!(
			ProxyError::UpstreamTimeout.status(),
			StatusCode::GATEWAY_TIMEOUT
		);
		assert_eq!(
			ProxyError::UpstreamCallFailed("dial".into()).status(),
			StatusCode::BAD_GATEWAY
		);
		assert_eq!(
			ProxyError::Overloaded.status(),
			StatusCode::SERVICE_UNAVAILABLE
		);
	}

	#[test]
	fn rate_limit_response_carries_headers() {
		let resp = ProxyError::RateLimitExceeded {
			limit: 5,
			remaining: 0,
			reset_seconds: 2,
		}
		.as_response();
		assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(resp.headers().get(x_headers::X_RATELIMIT_LIMIT).unwrap(), "5");
		assert_eq!(resp.headers().get(http::header::RETRY_AFTER).unwrap(), "2");
	}

	#[test]
	fn retryable_classification() {
		assert!(ProxyError::UpstreamTimeout.is_retryable());
		assert!(ProxyError::NoHealthyBackends.is_retryable());
		assert!(!ProxyError::RouteNotFound.is_retryable());
		assert!(
			!ProxyError::Rejected {
				status: StatusCode::FORBIDDEN,
				message: "no".into()
			}
			.is_retryable()
		);
	}

	#[test]
	fn error_body_is_json_envelope() {
		let resp = ProxyError::RouteNotFound.as_response();
		let body = futures::executor::block_on(axum::body::to_bytes(resp.into_body(), 1024)).unwrap();
		let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(v["status"], 404);
		assert_eq!(v["error"], "no route matched");
	}
}
