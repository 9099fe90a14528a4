use itertools::Itertools;
use ring::hmac;
use secrecy::ExposeSecret;

use crate::http::{HeaderName, HeaderValue, Request};
use crate::proxy::ProxyError;
use crate::types::features::{InboundSigningConfig, SigningAlgorithm, SigningConfig};
use crate::*;

/// Backend request signing: HMAC over the canonical string
/// `timestamp || method || path || sorted-signed-headers || body-hash`, placed in
/// `<Prefix>Signature` / `<Prefix>Timestamp` / `<Prefix>KeyId` headers.
pub struct Signer {
	key: hmac::Key,
	key_id: String,
	headers: Vec<String>,
	prefix: String,
}

impl Signer {
	pub fn new(config: &SigningConfig) -> anyhow::Result<Signer> {
		let secret = config
			.secret
			.as_ref()
			.ok_or_else(|| anyhow::anyhow!("signing requires a secret"))?;
		let algorithm = match config.algorithm {
			SigningAlgorithm::HmacSha256 => hmac::HMAC_SHA256,
			SigningAlgorithm::HmacSha512 => hmac::HMAC_SHA512,
		};
		Ok(Signer {
			key: hmac::Key::new(algorithm, secret.expose_secret().as_bytes()),
			key_id: config.key_id.clone(),
			headers: config
				.headers
				.iter()
				.map(|h| h.to_ascii_lowercase())
				.collect(),
			prefix: config.prefix.clone(),
		})
	}

	fn canonical_string(&self, timestamp: &str, req: &Request, body_hash: &str) -> String {
		let signed_headers = self
			.headers
			.iter()
			.sorted()
			.filter_map(|name| {
				req
					.headers()
					.get(name.as_str())
					.and_then(|v| v.to_str().ok())
					.map(|v| format!("{name}:{v}"))
			})
			.join("\n");
		format!(
			"{timestamp}\n{}\n{}\n{signed_headers}\n{body_hash}",
			req.method(),
			req.uri().path()
		)
	}

	pub fn sign(&self, req: &mut Request, body: &[u8]) -> Result<(), ProxyError> {
		let timestamp = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_secs().to_string())
			.unwrap_or_default();
		let body_hash = hex::encode(ring::digest::digest(&ring::digest::SHA256, body));
		let canonical = self.canonical_string(&timestamp, req, &body_hash);
		let tag = hmac::sign(&self.key, canonical.as_bytes());

		let put = |req: &mut Request, suffix: &str, value: String| -> Result<(), ProxyError> {
			let name = HeaderName::try_from(format!("{}{suffix}", self.prefix).to_ascii_lowercase())
				.map_err(|e| ProxyError::Processing(e.into()))?;
			let value = HeaderValue::try_from(value).map_err(|e| ProxyError::Processing(e.into()))?;
			req.headers_mut().insert(name, value);
			Ok(())
		};
		put(req, "Signature", hex::encode(tag.as_ref()))?;
		put(req, "Timestamp", timestamp)?;
		put(req, "KeyId", self.key_id.clone())?;
		Ok(())
	}
}

/// Inbound counterpart: verifies the same canonical form on requests arriving from partners.
pub struct InboundVerifier {
	signer: Signer,
	max_skew: Option<Duration>,
	shadow: bool,
}

impl InboundVerifier {
	pub fn new(config: &InboundSigningConfig) -> anyhow::Result<InboundVerifier> {
		Ok(InboundVerifier {
			signer: Signer::new(&config.signing)?,
			max_skew: config.max_skew,
			shadow: config.shadow,
		})
	}

	pub fn verify(&self, req: &Request, body: &[u8]) -> Result<(), ProxyError> {
		match self.verify_inner(req, body) {
			Ok(()) => Ok(()),
			Err(reason) if self.shadow => {
				info!(reason, "inbound signature check would reject (shadow mode)");
				Ok(())
			},
			Err(reason) => Err(ProxyError::Rejected {
				status: http::StatusCode::UNAUTHORIZED,
				message: reason.to_string(),
			}),
		}
	}

	fn verify_inner(&self, req: &Request, body: &[u8]) -> Result<(), &'static str> {
		let get = |suffix: &str| {
			let name = format!("{}{suffix}", self.signer.prefix).to_ascii_lowercase();
			req
				.headers()
				.get(name.as_str())
				.and_then(|v| v.to_str().ok())
		};
		let signature = get("Signature").ok_or("missing signature")?;
		let timestamp = get("Timestamp").ok_or("missing signature timestamp")?;

		if let Some(max_skew) = self.max_skew {
			let ts: u64 = timestamp.parse().map_err(|_| "invalid signature timestamp")?;
			let now = std::time::SystemTime::now()
				.duration_since(std::time::UNIX_EPOCH)
				.map(|d| d.as_secs())
				.unwrap_or_default();
			if now.abs_diff(ts) > max_skew.as_secs() {
				return Err("signature timestamp outside allowed skew");
			}
		}

		let body_hash = hex::encode(ring::digest::digest(&ring::digest::SHA256, body));
		let canonical = self.signer.canonical_string(timestamp, req, &body_hash);
		let presented = hex::decode(signature).map_err(|_| "malformed signature")?;
		hmac::verify(&self.signer.key, canonical.as_bytes(), &presented)
			.map_err(|_| "signature mismatch")
	}
}
