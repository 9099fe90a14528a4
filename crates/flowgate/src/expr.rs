//! `$name` variable resolution against per-request context.
//!
//! Variables use dotted paths: `request.method`, `request.header.<name>`, `request.query.<name>`,
//! `request.cookie.<name>`, `jwt.<claim>`, `param.<name>`, `client.ip`, `client.id`, `tls.sni`,
//! `tls.peer_cn`, `timing.received`, `timing.elapsed_ms`, `group`, `response.status`. Unknown
//! roots fall back to the request's custom slot. Templates are pre-compiled at config load;
//! lookups are memoised per request.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::http::Request;
use crate::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Var {
	Method,
	Path,
	Host,
	Scheme,
	RawQuery,
	Query(String),
	Header(String),
	Cookie(String),
	Claim(String),
	Param(String),
	ClientIp,
	ClientId,
	AuthType,
	TlsSni,
	TlsPeerCn,
	TimingReceived,
	TimingElapsedMs,
	Group,
	ResponseStatus,
	UpstreamStatus,
	RetryAttempt,
	Custom(String),
}

impl Var {
	pub fn parse(name: &str) -> Result<Var, String> {
		let v = match name {
			"request.method" => Var::Method,
			"request.path" => Var::Path,
			"request.host" => Var::Host,
			"request.scheme" => Var::Scheme,
			"request.query" => Var::RawQuery,
			"client.ip" => Var::ClientIp,
			"client.id" => Var::ClientId,
			"client.auth_type" => Var::AuthType,
			"tls.sni" => Var::TlsSni,
			"tls.peer_cn" => Var::TlsPeerCn,
			"timing.received" => Var::TimingReceived,
			"timing.elapsed_ms" => Var::TimingElapsedMs,
			"group" => Var::Group,
			"response.status" => Var::ResponseStatus,
			"upstream.status" => Var::UpstreamStatus,
			"retry.attempt" => Var::RetryAttempt,
			other => match other.split_once('.') {
				Some(("request", rest)) => match rest.split_once('.') {
					Some(("header", n)) if !n.is_empty() => Var::Header(n.to_ascii_lowercase()),
					Some(("query", n)) if !n.is_empty() => Var::Query(n.to_string()),
					Some(("cookie", n)) if !n.is_empty() => Var::Cookie(n.to_string()),
					_ => return Err(format!("unknown variable: {other:?}")),
				},
				Some(("jwt", claim)) if !claim.is_empty() => Var::Claim(claim.to_string()),
				Some(("param", n)) if !n.is_empty() => Var::Param(n.to_string()),
				Some(_) => Var::Custom(other.to_string()),
				None => return Err(format!("unknown variable: {other:?}")),
			},
		};
		Ok(v)
	}

	fn cache_key(&self) -> Option<String> {
		// Only memoise lookups that require parsing work.
		match self {
			Var::Cookie(n) => Some(format!("cookie.{n}")),
			Var::Query(n) => Some(format!("query.{n}")),
			Var::Claim(n) => Some(format!("jwt.{n}")),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
	ApiKey,
	Jwt,
	Oauth,
	ExtAuth,
}

impl std::fmt::Display for AuthType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			AuthType::ApiKey => "api_key",
			AuthType::Jwt => "jwt",
			AuthType::Oauth => "oauth",
			AuthType::ExtAuth => "ext_auth",
		};
		write!(f, "{s}")
	}
}

/// The authenticated caller, set by the auth filter.
#[derive(Debug, Clone)]
pub struct Identity {
	pub client_id: Strng,
	pub auth_type: AuthType,
	pub claims: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
	pub sni: Option<String>,
	pub peer_cn: Option<String>,
}

/// Per-request record, created once at ingress and threaded through the pipeline. The pipeline
/// driver owns it; filters hold borrow-only views.
#[derive(Debug)]
pub struct RequestContext {
	pub start: Instant,
	pub received: std::time::SystemTime,
	pub peer_addr: SocketAddr,
	/// After the trusted-proxy XFF walk; `peer_addr` otherwise.
	pub client_ip: IpAddr,
	pub tls: Option<TlsInfo>,
	pub version: ::http::Version,

	pub route_id: Option<Strng>,
	pub path_params: HashMap<Strng, String>,

	pub identity: Option<Identity>,
	pub traffic_group: Option<Strng>,
	pub tenant: Option<Strng>,

	pub backend: Option<String>,
	pub retry_attempt: u32,

	pub status: Option<u16>,
	pub upstream_status: Option<u16>,
	pub bytes_sent: u64,

	vars: HashMap<String, Option<String>>,
	pub custom: Map<String, Value>,
}

impl RequestContext {
	pub fn new(peer_addr: SocketAddr, version: ::http::Version) -> Self {
		RequestContext {
			start: Instant::now(),
			received: std::time::SystemTime::now(),
			peer_addr,
			client_ip: peer_addr.ip(),
			tls: None,
			version,
			route_id: None,
			path_params: HashMap::new(),
			identity: None,
			traffic_group: None,
			tenant: None,
			backend: None,
			retry_attempt: 0,
			status: None,
			upstream_status: None,
			bytes_sent: 0,
			vars: HashMap::new(),
			custom: Map::new(),
		}
	}

	pub fn client_id(&self) -> Option<&Strng> {
		self.identity.as_ref().map(|i| &i.client_id)
	}

	pub fn claim(&self, name: &str) -> Option<&Value> {
		self.identity.as_ref().and_then(|i| i.claims.get(name))
	}

	/// Resolves a variable, memoising parse-heavy lookups.
	pub fn resolve(&mut self, var: &Var, req: &Request) -> Option<String> {
		if let Some(key) = var.cache_key() {
			if let Some(hit) = self.vars.get(&key) {
				return hit.clone();
			}
			let value = self.resolve_uncached(var, req);
			self.vars.insert(key, value.clone());
			return value;
		}
		self.resolve_uncached(var, req)
	}

	fn resolve_uncached(&self, var: &Var, req: &Request) -> Option<String> {
		match var {
			Var::Method => Some(req.method().as_str().to_string()),
			Var::Path => Some(req.uri().path().to_string()),
			Var::Host => req.uri().host().map(|h| h.to_string()),
			Var::Scheme => req.uri().scheme_str().map(|s| s.to_string()),
			Var::RawQuery => req.uri().query().map(|q| q.to_string()),
			Var::Query(name) => query_param(req.uri().query().unwrap_or(""), name),
			Var::Header(name) => req
				.headers()
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(|v| v.to_string()),
			Var::Cookie(name) => cookie_value(req, name),
			Var::Claim(name) => self.claim(name).map(value_to_string),
			Var::Param(name) => self.path_params.get(name.as_str()).cloned(),
			Var::ClientIp => Some(self.client_ip.to_string()),
			Var::ClientId => self.client_id().map(|c| c.to_string()),
			Var::AuthType => self.identity.as_ref().map(|i| i.auth_type.to_string()),
			Var::TlsSni => self.tls.as_ref().and_then(|t| t.sni.clone()),
			Var::TlsPeerCn => self.tls.as_ref().and_then(|t| t.peer_cn.clone()),
			Var::TimingReceived => self
				.received
				.duration_since(std::time::UNIX_EPOCH)
				.ok()
				.map(|d| d.as_secs().to_string()),
			Var::TimingElapsedMs => Some(self.start.elapsed().as_millis().to_string()),
			Var::Group => self.traffic_group.as_ref().map(|g| g.to_string()),
			Var::ResponseStatus => self.status.map(|s| s.to_string()),
			Var::UpstreamStatus => self.upstream_status.map(|s| s.to_string()),
			Var::RetryAttempt => Some(self.retry_attempt.to_string()),
			Var::Custom(path) => lookup_json_path(&Value::Object(self.custom.clone()), path)
				.map(|v| value_to_string(&v)),
		}
	}
}

fn value_to_string(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn lookup_json_path(root: &Value, path: &str) -> Option<Value> {
	let mut cur = root;
	for seg in path.split('.') {
		cur = cur.get(seg)?;
	}
	Some(cur.clone())
}

fn query_param(query: &str, name: &str) -> Option<String> {
	query.split('&').find_map(|pair| {
		let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
		if k == name {
			percent_encoding::percent_decode_str(v)
				.decode_utf8()
				.ok()
				.map(|c| c.into_owned())
		} else {
			None
		}
	})
}

fn cookie_value(req: &Request, name: &str) -> Option<String> {
	let header = req.headers().get(::http::header::COOKIE)?.to_str().ok()?;
	header.split(';').find_map(|pair| {
		let (k, v) = pair.trim().split_once('=')?;
		if k == name { Some(v.to_string()) } else { None }
	})
}

/// Resolves a limiter/sticky/hash key for the request.
pub fn extract_key(
	source: &crate::types::features::KeySource,
	ctx: &mut RequestContext,
	req: &Request,
) -> Option<String> {
	use crate::types::features::KeySource;
	let var = match source {
		KeySource::Ip => Var::ClientIp,
		KeySource::ClientId => Var::ClientId,
		KeySource::Header(n) => Var::Header(n.to_ascii_lowercase()),
		KeySource::Cookie(n) => Var::Cookie(n.clone()),
		KeySource::JwtClaim(n) => Var::Claim(n.clone()),
	};
	ctx.resolve(&var, req)
}

#[derive(Debug, Clone)]
enum Part {
	Lit(String),
	Var(Var),
}

/// A pre-compiled `$var` template. `$$` escapes a literal dollar; `${name}` delimits explicitly.
#[derive(Debug, Clone)]
pub struct Template {
	parts: Vec<Part>,
	source: String,
}

impl Template {
	pub fn compile(source: &str) -> Result<Template, String> {
		let mut parts = Vec::new();
		let mut lit = String::new();
		let mut chars = source.char_indices().peekable();
		while let Some((_, c)) = chars.next() {
			if c != '$' {
				lit.push(c);
				continue;
			}
			match chars.peek() {
				Some((_, '$')) => {
					chars.next();
					lit.push('$');
				},
				Some((_, '{')) => {
					chars.next();
					let mut name = String::new();
					let mut closed = false;
					for (_, c) in chars.by_ref() {
						if c == '}' {
							closed = true;
							break;
						}
						name.push(c);
					}
					if !closed {
						return Err(format!("unterminated ${{ in template: {source:?}"));
					}
					if !lit.is_empty() {
						parts.push(Part::Lit(std::mem::take(&mut lit)));
					}
					parts.push(Part::Var(Var::parse(name.trim())?));
				},
				_ => {
					let mut name = String::new();
					while let Some((_, c)) = chars.peek() {
						if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
							name.push(*c);
							chars.next();
						} else {
							break;
						}
					}
					if name.is_empty() {
						lit.push('$');
						continue;
					}
					if !lit.is_empty() {
						parts.push(Part::Lit(std::mem::take(&mut lit)));
					}
					parts.push(Part::Var(Var::parse(&name)?));
				},
			}
		}
		if !lit.is_empty() {
			parts.push(Part::Lit(lit));
		}
		Ok(Template {
			parts,
			source: source.to_string(),
		})
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	pub fn resolve(&self, ctx: &mut RequestContext, req: &Request) -> String {
		let mut out = String::new();
		for part in &self.parts {
			match part {
				Part::Lit(s) => out.push_str(s),
				Part::Var(v) => {
					if let Some(val) = ctx.resolve(v, req) {
						out.push_str(&val);
					}
				},
			}
		}
		out
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
	Eq,
	Ne,
	Matches,
	NotMatches,
	Contains,
	Exists,
}

/// A compiled rule condition: `$var <op> "literal"`, or a bare `$var` (truthy when non-empty).
#[derive(Debug, Clone)]
pub struct Condition {
	var: Var,
	op: Op,
	operand: Option<String>,
	regex: Option<regex::Regex>,
}

impl Condition {
	pub fn compile(source: &str) -> Result<Condition, String> {
		let s = source.trim();
		let var_str = s
			.strip_prefix('$')
			.ok_or_else(|| format!("condition must start with a variable: {source:?}"))?;

		let (name, rest) = match var_str.find(char::is_whitespace) {
			Some(idx) => (&var_str[..idx], var_str[idx..].trim_start()),
			None => (var_str, ""),
		};
		let var = Var::parse(name)?;
		if rest.is_empty() {
			return Ok(Condition {
				var,
				op: Op::Exists,
				operand: None,
				regex: None,
			});
		}
		let (op_str, lit) = match rest.find(char::is_whitespace) {
			Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
			None => return Err(format!("condition missing operand: {source:?}")),
		};
		let op = match op_str {
			"==" => Op::Eq,
			"!=" => Op::Ne,
			"=~" => Op::Matches,
			"!~" => Op::NotMatches,
			"contains" => Op::Contains,
			other => return Err(format!("unknown operator: {other:?}")),
		};
		let lit = lit
			.strip_prefix('"')
			.and_then(|l| l.strip_suffix('"'))
			.ok_or_else(|| format!("operand must be double-quoted: {source:?}"))?
			.to_string();
		let regex = match op {
			Op::Matches | Op::NotMatches => {
				Some(regex::Regex::new(&lit).map_err(|e| format!("invalid regex: {e}"))?)
			},
			_ => None,
		};
		Ok(Condition {
			var,
			op,
			operand: Some(lit),
			regex,
		})
	}

	pub fn evaluate(&self, ctx: &mut RequestContext, req: &Request) -> bool {
		let value = ctx.resolve(&self.var, req);
		match self.op {
			Op::Exists => value.is_some_and(|v| !v.is_empty()),
			Op::Eq => value.as_deref() == self.operand.as_deref(),
			Op::Ne => value.as_deref() != self.operand.as_deref(),
			Op::Contains => match (&value, &self.operand) {
				(Some(v), Some(o)) => v.contains(o.as_str()),
				_ => false,
			},
			Op::Matches => match (&value, &self.regex) {
				(Some(v), Some(re)) => re.is_match(v),
				_ => false,
			},
			Op::NotMatches => match (&value, &self.regex) {
				(Some(v), Some(re)) => !re.is_match(v),
				_ => true,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn request() -> Request {
		::http::Request::builder()
			.method("POST")
			.uri("http://example.com/users/42?tier=gold&x=a%20b")
			.header("x-debug", "1")
			.header("cookie", "session=abc; theme=dark")
			.body(Body::empty())
			.unwrap()
	}

	fn context() -> RequestContext {
		let mut ctx = RequestContext::new("10.1.2.3:5555".parse().unwrap(), ::http::Version::HTTP_11);
		ctx.path_params.insert("id".into(), "42".to_string());
		ctx.identity = Some(Identity {
			client_id: "acme".into(),
			auth_type: AuthType::Jwt,
			claims: serde_json::json!({"sub": "u1", "tier": "gold"})
				.as_object()
				.unwrap()
				.clone(),
		});
		ctx
	}

	#[test]
	fn template_resolves_request_vars() {
		let t = Template::compile("$request.method $request.path id=$param.id ip=$client.ip").unwrap();
		let out = t.resolve(&mut context(), &request());
		assert_eq!(out, "POST /users/42 id=42 ip=10.1.2.3");
	}

	#[test]
	fn template_braced_and_escaped() {
		let t = Template::compile("${request.header.x-debug}-$$literal").unwrap();
		assert_eq!(t.resolve(&mut context(), &request()), "1-$literal");
	}

	#[test]
	fn template_identity_without_vars() {
		let t = Template::compile("plain text, 5$ off").unwrap();
		assert_eq!(t.resolve(&mut context(), &request()), "plain text, 5$ off");
	}

	#[test]
	fn query_and_cookie_lookup() {
		let t = Template::compile("$request.query.tier/$request.cookie.theme").unwrap();
		assert_eq!(t.resolve(&mut context(), &request()), "gold/dark");
	}

	#[test]
	fn query_decoding() {
		let t = Template::compile("$request.query.x").unwrap();
		assert_eq!(t.resolve(&mut context(), &request()), "a b");
	}

	#[test]
	fn claim_lookup() {
		let t = Template::compile("$jwt.sub:$jwt.tier").unwrap();
		assert_eq!(t.resolve(&mut context(), &request()), "u1:gold");
	}

	#[test]
	fn unknown_var_is_compile_error() {
		assert!(Template::compile("$nope").is_err());
		assert!(Template::compile("$request.bogus.x").is_err());
	}

	#[test]
	fn conditions() {
		let req = request();
		let mut ctx = context();
		assert!(
			Condition::compile(r#"$request.header.x-debug == "1""#)
				.unwrap()
				.evaluate(&mut ctx, &req)
		);
		assert!(
			!Condition::compile(r#"$request.query.tier != "gold""#)
				.unwrap()
				.evaluate(&mut ctx, &req)
		);
		assert!(
			Condition::compile(r#"$request.path =~ "^/users/\d+$""#)
				.unwrap()
				.evaluate(&mut ctx, &req)
		);
		assert!(
			Condition::compile("$jwt.sub")
				.unwrap()
				.evaluate(&mut ctx, &req)
		);
		assert!(
			!Condition::compile("$request.header.missing")
				.unwrap()
				.evaluate(&mut ctx, &req)
		);
		assert!(Condition::compile("request.path").is_err());
		assert!(Condition::compile(r#"$request.path ~= "x""#).is_err());
	}
}
