use async_compression::tokio::bufread::{BrotliEncoder, GzipDecoder, GzipEncoder};
use tokio::io::AsyncReadExt;

use crate::http::{Body, HeaderValue, Request, Response, header};
use crate::proxy::ProxyError;
use crate::types::features::{CompressionAlgorithm, CompressionConfig};
use crate::*;

/// Decompresses gzip request bodies when the client sent Content-Encoding. Bodies are already
/// buffered by the body-size cap, so this works on bytes.
pub async fn decompress_request(
	body: &[u8],
	content_encoding: Option<&str>,
) -> Result<Option<Bytes>, ProxyError> {
	match content_encoding {
		Some("gzip") => {
			let mut decoder = GzipDecoder::new(body);
			let mut out = Vec::new();
			decoder
				.read_to_end(&mut out)
				.await
				.map_err(|e| ProxyError::Rejected {
					status: http::StatusCode::BAD_REQUEST,
					message: format!("invalid gzip body: {e}"),
				})?;
			Ok(Some(Bytes::from(out)))
		},
		Some("identity") | None => Ok(None),
		Some(other) => Err(ProxyError::Rejected {
			status: http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
			message: format!("unsupported content encoding: {other}"),
		}),
	}
}

/// Picks the response encoding from Accept-Encoding against the configured algorithms.
pub fn negotiate(config: &CompressionConfig, req: &Request) -> Option<CompressionAlgorithm> {
	if !config.enabled {
		return None;
	}
	let accept = req
		.headers()
		.get(header::ACCEPT_ENCODING)
		.and_then(|v| v.to_str().ok())?;
	let accepts = |name: &str| {
		accept
			.split(',')
			.any(|e| e.trim().split(';').next() == Some(name))
	};
	config
		.algorithms
		.iter()
		.copied()
		.find(|algo| match algo {
			CompressionAlgorithm::Gzip => accepts("gzip"),
			CompressionAlgorithm::Brotli => accepts("br"),
		})
}

/// Compresses a buffered response body when it qualifies: configured content type, at or above
/// `min_size`, and not already encoded.
pub async fn compress_response(
	config: &CompressionConfig,
	algo: CompressionAlgorithm,
	resp: Response,
) -> Result<Response, ProxyError> {
	if resp.headers().contains_key(header::CONTENT_ENCODING) {
		return Ok(resp);
	}
	let content_type = resp
		.headers()
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	if !config
		.content_types
		.iter()
		.any(|t| content_type.starts_with(t.as_str()))
	{
		return Ok(resp);
	}

	let (mut head, body) = resp.into_parts();
	let bytes = axum::body::to_bytes(body, usize::MAX)
		.await
		.map_err(|e| ProxyError::Processing(e.into()))?;
	if (bytes.len() as u64) < config.min_size {
		return Ok(Response::from_parts(head, Body::from(bytes)));
	}

	let compressed = match algo {
		CompressionAlgorithm::Gzip => {
			let mut encoder = GzipEncoder::new(&bytes[..]);
			let mut out = Vec::with_capacity(bytes.len() / 2);
			encoder
				.read_to_end(&mut out)
				.await
				.map_err(|e| ProxyError::Processing(e.into()))?;
			out
		},
		CompressionAlgorithm::Brotli => {
			let mut encoder = BrotliEncoder::new(&bytes[..]);
			let mut out = Vec::with_capacity(bytes.len() / 2);
			encoder
				.read_to_end(&mut out)
				.await
				.map_err(|e| ProxyError::Processing(e.into()))?;
			out
		},
	};
	head.headers.insert(
		header::CONTENT_ENCODING,
		HeaderValue::from_static(match algo {
			CompressionAlgorithm::Gzip => "gzip",
			CompressionAlgorithm::Brotli => "br",
		}),
	);
	head.headers.remove(header::CONTENT_LENGTH);
	head
		.headers
		.append(header::VARY, HeaderValue::from_static("accept-encoding"));
	Ok(Response::from_parts(head, Body::from(compressed)))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config() -> CompressionConfig {
		CompressionConfig {
			min_size: 8,
			..Default::default()
		}
	}

	fn req(accept: Option<&str>) -> Request {
		let mut b = ::http::Request::builder().uri("/");
		if let Some(a) = accept {
			b = b.header(header::ACCEPT_ENCODING, a);
		}
		b.body(Body::empty()).unwrap()
	}

	fn text_response(body: &'static str) -> Response {
		::http::Response::builder()
			.status(200)
			.header(header::CONTENT_TYPE, "text/plain")
			.body(Body::from(body))
			.unwrap()
	}

	#[test]
	fn negotiation_follows_accept_encoding() {
		let cfg = config();
		assert_eq!(
			negotiate(&cfg, &req(Some("gzip, deflate"))),
			Some(CompressionAlgorithm::Gzip)
		);
		assert_eq!(negotiate(&cfg, &req(Some("br"))), None); // gzip-only config
		assert_eq!(negotiate(&cfg, &req(None)), None);
	}

	#[tokio::test]
	async fn gzip_roundtrip() {
		let resp = compress_response(
			&config(),
			CompressionAlgorithm::Gzip,
			text_response("hello world, hello world, hello world"),
		)
		.await
		.unwrap();
		assert_eq!(resp.headers().get(header::CONTENT_ENCODING).unwrap(), "gzip");
		let compressed = axum::body::to_bytes(resp.into_body(), usize::MAX)
			.await
			.unwrap();

		let decompressed = decompress_request(&compressed, Some("gzip"))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&decompressed[..], b"hello world, hello world, hello world");
	}

	#[tokio::test]
	async fn small_bodies_are_not_compressed() {
		let resp = compress_response(&config(), CompressionAlgorithm::Gzip, text_response("tiny"))
			.await
			.unwrap();
		assert!(resp.headers().get(header::CONTENT_ENCODING).is_none());
	}

	#[tokio::test]
	async fn unknown_request_encoding_is_rejected() {
		assert!(decompress_request(b"x", Some("zstd")).await.is_err());
	}
}
