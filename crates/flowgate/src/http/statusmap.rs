use indexmap::IndexMap;

use crate::http::{Response, StatusCode};

/// Maps upstream statuses to configured downstream statuses. Mappings on 1xx/3xx are a no-op:
/// informational and redirect semantics carry protocol state the gateway must not rewrite.
pub fn apply(mapping: &IndexMap<u16, u16>, resp: &mut Response) {
	if mapping.is_empty() {
		return;
	}
	let current = resp.status().as_u16();
	if (100..200).contains(&current) || (300..400).contains(&current) {
		return;
	}
	if let Some(mapped) = mapping.get(&current)
		&& let Ok(status) = StatusCode::from_u16(*mapped)
	{
		*resp.status_mut() = status;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn resp(status: u16) -> Response {
		::http::Response::builder()
			.status(status)
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn maps_configured_statuses() {
		let mut mapping = IndexMap::new();
		mapping.insert(500u16, 502u16);
		let mut r = resp(500);
		apply(&mapping, &mut r);
		assert_eq!(r.status(), StatusCode::BAD_GATEWAY);
	}

	#[test]
	fn redirects_and_informational_are_untouched() {
		let mut mapping = IndexMap::new();
		mapping.insert(302u16, 200u16);
		mapping.insert(101u16, 200u16);
		let mut r = resp(302);
		apply(&mapping, &mut r);
		assert_eq!(r.status().as_u16(), 302);
		let mut r = resp(101);
		apply(&mapping, &mut r);
		assert_eq!(r.status().as_u16(), 101);
	}

	#[test]
	fn unmapped_statuses_pass_through() {
		let mut mapping = IndexMap::new();
		mapping.insert(500u16, 502u16);
		let mut r = resp(404);
		apply(&mapping, &mut r);
		assert_eq!(r.status().as_u16(), 404);
	}
}
