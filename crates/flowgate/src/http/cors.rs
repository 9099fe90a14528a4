use std::str::FromStr;

use ::http::{HeaderValue, Method, StatusCode, header};

use crate::http::{PolicyResponse, Request};
use crate::types::features::CorsConfig;
use crate::*;

#[derive(Default, Debug, Clone)]
enum WildcardOrList<T> {
	#[default]
	None,
	Wildcard,
	List(Vec<T>),
}

impl<T: FromStr> TryFrom<&Vec<String>> for WildcardOrList<T> {
	type Error = T::Err;

	fn try_from(value: &Vec<String>) -> Result<Self, Self::Error> {
		if value.iter().any(|v| v == "*") {
			Ok(WildcardOrList::Wildcard)
		} else if value.is_empty() {
			Ok(WildcardOrList::None)
		} else {
			let vec: Vec<T> = value
				.iter()
				.map(|v| T::from_str(v))
				.collect::<Result<_, _>>()?;
			Ok(WildcardOrList::List(vec))
		}
	}
}

impl<T: ToString> WildcardOrList<T> {
	fn to_header_value(&self) -> Option<HeaderValue> {
		match self {
			WildcardOrList::None => None,
			WildcardOrList::Wildcard => Some(HeaderValue::from_static("*")),
			WildcardOrList::List(list) => {
				let value = list
					.iter()
					.map(|item| item.to_string())
					.collect::<Vec<_>>()
					.join(",");
				HeaderValue::from_str(&value).ok()
			},
		}
	}
}

/// Compiled CORS policy. Preflights for allowed origins are answered directly; other requests
/// carry the allow headers on their response. Non-matching origins are forwarded untouched.
#[derive(Debug, Clone)]
pub struct Cors {
	allow_credentials: bool,
	allow_headers: WildcardOrList<http::HeaderName>,
	allow_methods: WildcardOrList<Method>,
	allow_origins: WildcardOrList<String>,
	expose_headers: WildcardOrList<http::HeaderName>,
	max_age: Option<HeaderValue>,
}

impl Cors {
	pub fn compile(config: &CorsConfig) -> anyhow::Result<Cors> {
		Ok(Cors {
			allow_credentials: config.allow_credentials,
			allow_headers: WildcardOrList::try_from(&config.allowed_headers)?,
			allow_methods: WildcardOrList::try_from(&config.allowed_methods)?,
			allow_origins: WildcardOrList::try_from(&config.allowed_origins)?,
			expose_headers: WildcardOrList::try_from(&config.exposed_headers)?,
			max_age: config
				.max_age
				.map(|v| HeaderValue::from_str(&v.as_secs().to_string()))
				.transpose()?,
		})
	}

	pub fn apply(&self, req: &Request) -> PolicyResponse {
		let Some(origin) = req.headers().get(header::ORIGIN) else {
			return Default::default();
		};

		let allowed = match &self.allow_origins {
			WildcardOrList::None => false,
			WildcardOrList::Wildcard => true,
			WildcardOrList::List(origins) => {
				let os = origin.as_bytes();
				origins.iter().any(|want| want.as_bytes() == os)
			},
		};
		if !allowed {
			return Default::default();
		}

		if req.method() == Method::OPTIONS {
			let mut rb = ::http::Response::builder()
				.status(StatusCode::OK)
				.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
			if let Some(h) = self.allow_methods.to_header_value() {
				rb = rb.header(header::ACCESS_CONTROL_ALLOW_METHODS, h);
			}
			if let Some(h) = self.allow_headers.to_header_value() {
				rb = rb.header(header::ACCESS_CONTROL_ALLOW_HEADERS, h);
			}
			if let Some(h) = &self.max_age {
				rb = rb.header(header::ACCESS_CONTROL_MAX_AGE, h);
			}
			let response = rb
				.body(crate::http::Body::empty())
				.expect("preflight response must build");
			return PolicyResponse {
				direct_response: Some(response),
				response_headers: None,
			};
		}

		let mut response_headers = http::HeaderMap::with_capacity(3);
		response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
		if self.allow_credentials {
			response_headers.insert(
				header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
				HeaderValue::from_static("true"),
			);
		}
		if let Some(h) = self.expose_headers.to_header_value() {
			response_headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, h);
		}
		PolicyResponse {
			direct_response: None,
			response_headers: Some(response_headers),
		}
	}
}
