use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};

use crate::client::Client;
use crate::expr::{AuthType, Identity, RequestContext};
use crate::http::{Body, HeaderName, HeaderValue, Request, header};
use crate::proxy::ProxyError;
use crate::types::config::{ApiKeyConfig, JwtConfig};
use crate::types::features::{AuthConfig, AuthMethod, OAuthConfig};
use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
	#[error("the token is invalid or malformed")]
	Invalid(#[source] jsonwebtoken::errors::Error),
	#[error("the token header is malformed")]
	InvalidHeader(#[source] jsonwebtoken::errors::Error),
	#[error("no credentials found")]
	Missing,
	#[error("token uses the unknown key {0:?}")]
	UnknownKeyId(String),
	#[error("token has been revoked")]
	Revoked,
}

/// Verifies bearer tokens against either a shared-secret HMAC key or a JWKS file.
pub struct JwtVerifier {
	/// kid -> key; the empty kid holds the shared-secret key.
	keys: HashMap<String, Jwk>,
}

struct Jwk {
	decoding: DecodingKey,
	validation: Validation,
}

impl JwtVerifier {
	pub fn new(config: &JwtConfig) -> anyhow::Result<JwtVerifier> {
		let mut keys = HashMap::new();
		let alg: Algorithm = config
			.algorithm
			.parse()
			.map_err(|_| anyhow::anyhow!("unsupported jwt algorithm: {}", config.algorithm))?;

		let mut validation = Validation::new(alg);
		if let Some(iss) = &config.issuer {
			validation.set_issuer(&[iss]);
		}
		if !config.audiences.is_empty() {
			validation.set_audience(&config.audiences);
		} else {
			validation.validate_aud = false;
		}

		if let Some(secret) = &config.secret {
			let raw = secret.expose_secret();
			let bytes = STANDARD
				.decode(raw)
				.unwrap_or_else(|_| raw.as_bytes().to_vec());
			keys.insert(
				String::new(),
				Jwk {
					decoding: DecodingKey::from_secret(&bytes),
					validation: validation.clone(),
				},
			);
		}
		if let Some(path) = &config.jwks_file {
			let jwks: JwkSet = serde_json::from_str(&std::fs::read_to_string(path)?)?;
			for jwk in jwks.keys {
				let Some(kid) = jwk.common.key_id.clone() else {
					anyhow::bail!("jwks key is missing the `kid` attribute");
				};
				let decoding = match &jwk.algorithm {
					AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)?,
					AlgorithmParameters::EllipticCurve(ec) => {
						DecodingKey::from_ec_components(&ec.x, &ec.y)?
					},
					other => anyhow::bail!("unsupported jwks key algorithm: {other:?}"),
				};
				keys.insert(
					kid,
					Jwk {
						decoding,
						validation: validation.clone(),
					},
				);
			}
		}
		if keys.is_empty() {
			anyhow::bail!("jwt requires a secret or jwks_file");
		}
		Ok(JwtVerifier { keys })
	}

	pub fn validate(&self, token: &str) -> Result<Map<String, Value>, TokenError> {
		let header = decode_header(token).map_err(TokenError::InvalidHeader)?;
		let key = match &header.kid {
			Some(kid) => self
				.keys
				.get(kid)
				.ok_or_else(|| TokenError::UnknownKeyId(kid.clone()))?,
			None => self.keys.get("").ok_or(TokenError::Missing)?,
		};
		let decoded = decode::<Map<String, Value>>(token, &key.decoding, &key.validation)
			.map_err(TokenError::Invalid)?;
		Ok(decoded.claims)
	}
}

pub fn bearer_token(req: &Request) -> Option<&str> {
	req
		.headers()
		.get(header::AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
}

/// The per-gateway authenticator. Route `auth` blocks choose which methods apply; a
/// successful method sets the request identity and stops the chain.
pub struct Authenticator {
	api_keys: Option<ApiKeyConfig>,
	jwt: Option<JwtVerifier>,
	client: Client,
}

impl Authenticator {
	pub fn new(
		api_keys: Option<ApiKeyConfig>,
		jwt: Option<JwtVerifier>,
		client: Client,
	) -> Authenticator {
		Authenticator {
			api_keys,
			jwt,
			client,
		}
	}

	pub async fn apply(
		&self,
		config: &AuthConfig,
		ctx: &mut RequestContext,
		req: &mut Request,
	) -> Result<(), ProxyError> {
		for method in &config.methods {
			let identity = match method {
				AuthMethod::ApiKey => self.try_api_key(req),
				AuthMethod::Jwt => self.try_jwt(req)?,
				AuthMethod::Oauth => match &config.oauth {
					Some(oauth) => self.try_oauth(oauth, req).await?,
					None => None,
				},
				// ext_auth runs as its own pipeline step; it only marks the auth type here.
				AuthMethod::ExtAuth => None,
			};
			if let Some(identity) = identity {
				propagate_claims(&identity, &config.claims_headers, req);
				ctx.identity = Some(identity);
				return Ok(());
			}
		}
		if config.required {
			return Err(ProxyError::AuthenticationFailed(
				"no valid credentials".to_string(),
			));
		}
		Ok(())
	}

	fn try_api_key(&self, req: &mut Request) -> Option<Identity> {
		let cfg = self.api_keys.as_ref()?;
		let presented = req
			.headers()
			.get(cfg.header.as_str())
			.and_then(|v| v.to_str().ok())?;
		let client_id = cfg.keys.get(presented)?.clone();
		req.headers_mut().remove(cfg.header.as_str());
		Some(Identity {
			client_id,
			auth_type: AuthType::ApiKey,
			claims: Map::new(),
		})
	}

	fn try_jwt(&self, req: &mut Request) -> Result<Option<Identity>, ProxyError> {
		let Some(verifier) = &self.jwt else {
			return Ok(None);
		};
		let Some(token) = bearer_token(req) else {
			return Ok(None);
		};
		let claims = verifier
			.validate(token)
			.map_err(|e| ProxyError::AuthenticationFailed(e.to_string()))?;
		let client_id = claims
			.get("sub")
			.and_then(|v| v.as_str())
			.unwrap_or("unknown")
			.into();
		Ok(Some(Identity {
			client_id,
			auth_type: AuthType::Jwt,
			claims,
		}))
	}

	async fn try_oauth(
		&self,
		oauth: &OAuthConfig,
		req: &Request,
	) -> Result<Option<Identity>, ProxyError> {
		let Some(token) = bearer_token(req) else {
			return Ok(None);
		};
		let body = serde_urlencoded_body(token);
		let mut introspect = ::http::Request::builder()
			.method("POST")
			.uri(&oauth.introspection_url)
			.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
			.body(Body::from(body))
			.map_err(|e| ProxyError::Processing(e.into()))?;
		let basic = STANDARD.encode(format!(
			"{}:{}",
			oauth.client_id,
			oauth
				.client_secret
				.as_ref()
				.map(|s| s.expose_secret().to_string())
				.unwrap_or_default()
		));
		introspect.headers_mut().insert(
			header::AUTHORIZATION,
			HeaderValue::try_from(format!("Basic {basic}"))
				.map_err(|e| ProxyError::Processing(e.into()))?,
		);

		let resp = tokio::time::timeout(oauth.timeout, self.client.simple_call(introspect))
			.await
			.map_err(|_| ProxyError::AuthenticationFailed("introspection timed out".to_string()))??;
		let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
			.await
			.map_err(|e| ProxyError::Processing(e.into()))?;
		let parsed: Map<String, Value> = serde_json::from_slice(&bytes)
			.map_err(|e| ProxyError::AuthenticationFailed(format!("bad introspection response: {e}")))?;
		if parsed.get("active").and_then(Value::as_bool) != Some(true) {
			return Err(ProxyError::AuthenticationFailed(
				"token is not active".to_string(),
			));
		}
		let client_id = parsed
			.get("client_id")
			.or_else(|| parsed.get("sub"))
			.and_then(|v| v.as_str())
			.unwrap_or("unknown")
			.into();
		Ok(Some(Identity {
			client_id,
			auth_type: AuthType::Oauth,
			claims: parsed,
		}))
	}
}

fn serde_urlencoded_body(token: &str) -> String {
	format!(
		"token={}",
		percent_encoding::utf8_percent_encode(token, percent_encoding::NON_ALPHANUMERIC)
	)
}

/// Copies configured claims into request headers for the backend.
fn propagate_claims(
	identity: &Identity,
	claims_headers: &indexmap::IndexMap<String, String>,
	req: &mut Request,
) {
	for (claim, header_name) in claims_headers {
		let Some(value) = identity.claims.get(claim) else {
			continue;
		};
		let rendered = match value {
			Value::String(s) => s.clone(),
			other => other.to_string(),
		};
		if let (Ok(name), Ok(value)) = (
			HeaderName::try_from(header_name.as_str()),
			HeaderValue::try_from(rendered),
		) {
			req.headers_mut().insert(name, value);
		}
	}
}
