use std::collections::HashMap;

use crate::http::{Method, Request};
use crate::types::features::RouteFeatures;
use crate::types::route::{MatchConfig, PredicateConfig, RouteConfig};
use crate::*;

/// The route list compiled once per config version. Matching walks routes in listed order;
/// the first match wins.
#[derive(Debug, Default)]
pub struct RouteTable {
	routes: Vec<Arc<CompiledRoute>>,
	needs_body: bool,
}

#[derive(Debug)]
pub struct CompiledRoute {
	pub id: Strng,
	pub config: Arc<RouteConfig>,
	/// Global defaults merged under the route's own blocks.
	pub features: Arc<RouteFeatures>,
	path: PathMatcher,
	pub strip_prefix: bool,
	methods: Vec<Method>,
	domains: Vec<DomainMatch>,
	matches: Option<MatchConfig>,
}

#[derive(Debug)]
enum PathMatcher {
	Exact(String),
	Prefix(String),
	/// Paths with `{param}` segments; exact segment count.
	Segments(Vec<Segment>),
}

#[derive(Debug)]
enum Segment {
	Lit(String),
	Param(Strng),
}

#[derive(Debug)]
enum DomainMatch {
	Exact(String),
	/// `*.example.com`
	Suffix(String),
}

pub type PathParams = HashMap<Strng, String>;

impl RouteTable {
	pub fn compile(config: &Config) -> anyhow::Result<RouteTable> {
		let mut routes = Vec::with_capacity(config.routes.len());
		let mut needs_body = false;
		for rc in &config.routes {
			let features = Arc::new(RouteFeatures::merge(&config.defaults, &rc.features));
			needs_body |= rc
				.matches
				.as_ref()
				.is_some_and(|m| !m.body.is_empty());
			let methods = rc
				.methods
				.iter()
				.map(|m| Method::from_bytes(m.as_bytes()))
				.collect::<Result<Vec<_>, _>>()?;
			let domains = rc
				.matches
				.iter()
				.flat_map(|m| m.domains.iter())
				.map(|d| match d.strip_prefix("*.") {
					Some(suffix) => DomainMatch::Suffix(format!(".{suffix}")),
					None => DomainMatch::Exact(d.to_ascii_lowercase()),
				})
				.collect();
			routes.push(Arc::new(CompiledRoute {
				id: rc.id.clone(),
				path: compile_path(&rc.path, rc.path_prefix),
				strip_prefix: rc.strip_prefix,
				methods,
				domains,
				matches: rc.matches.clone(),
				features,
				config: Arc::new(rc.clone()),
			}));
		}
		Ok(RouteTable { routes, needs_body })
	}

	/// Whether any route carries body predicates; callers buffer the body before matching then.
	pub fn needs_body(&self) -> bool {
		self.needs_body
	}

	pub fn routes(&self) -> &[Arc<CompiledRoute>] {
		&self.routes
	}

	pub fn get(&self, id: &str) -> Option<&Arc<CompiledRoute>> {
		self.routes.iter().find(|r| r.id.as_str() == id)
	}

	pub fn select(
		&self,
		host: &str,
		method: &Method,
		path: &str,
		req: &Request,
		body: Option<&serde_json::Value>,
	) -> Option<(Arc<CompiledRoute>, PathParams)> {
		for route in &self.routes {
			if let Some(params) = route.matches(host, method, path, req, body) {
				return Some((route.clone(), params));
			}
		}
		None
	}
}

impl CompiledRoute {
	fn matches(
		&self,
		host: &str,
		method: &Method,
		path: &str,
		req: &Request,
		body: Option<&serde_json::Value>,
	) -> Option<PathParams> {
		if !self.methods.is_empty() && !self.methods.contains(method) {
			return None;
		}
		if !self.domains.is_empty() {
			let host = host.to_ascii_lowercase();
			let ok = self.domains.iter().any(|d| match d {
				DomainMatch::Exact(e) => *e == host,
				DomainMatch::Suffix(s) => host.ends_with(s.as_str()),
			});
			if !ok {
				return None;
			}
		}
		let params = self.path.matches(path)?;
		if let Some(m) = &self.matches {
			let headers_ok = m.headers.iter().all(|p| {
				check_predicate(p, || {
					req
						.headers()
						.get(p.name.as_str())
						.and_then(|v| v.to_str().ok())
						.map(|v| v.to_string())
				})
			});
			if !headers_ok {
				return None;
			}
			let query = req.uri().query().unwrap_or("");
			let query_ok = m
				.query
				.iter()
				.all(|p| check_predicate(p, || query_param(query, &p.name)));
			if !query_ok {
				return None;
			}
			let cookies_ok = m
				.cookies
				.iter()
				.all(|p| check_predicate(p, || cookie_param(req, &p.name)));
			if !cookies_ok {
				return None;
			}
			if !m.body.is_empty() {
				let Some(body) = body else { return None };
				for bp in &m.body {
					let value = lookup_path(body, &bp.path);
					let ok = value
						.as_ref()
						.map(json_as_string)
						.is_some_and(|s| bp.regex.is_match(&s));
					if !ok {
						return None;
					}
				}
			}
		}
		Some(params)
	}

	/// The portion of the path remaining after prefix stripping.
	pub fn stripped_path<'a>(&self, path: &'a str) -> &'a str {
		if !self.strip_prefix {
			return path;
		}
		let PathMatcher::Prefix(prefix) = &self.path else {
			return path;
		};
		let rest = path.strip_prefix(prefix.as_str()).unwrap_or(path);
		if rest.starts_with('/') {
			rest
		} else if rest.is_empty() {
			"/"
		} else {
			path
		}
	}
}

fn compile_path(path: &str, prefix: bool) -> PathMatcher {
	if path.contains('{') {
		let segments = path
			.split('/')
			.skip(1)
			.map(|seg| {
				seg
					.strip_prefix('{')
					.and_then(|s| s.strip_suffix('}'))
					.map(|name| Segment::Param(name.into()))
					.unwrap_or_else(|| Segment::Lit(seg.to_string()))
			})
			.collect();
		PathMatcher::Segments(segments)
	} else if prefix {
		PathMatcher::Prefix(normalize_prefix(path))
	} else {
		PathMatcher::Exact(path.to_string())
	}
}

fn normalize_prefix(path: &str) -> String {
	path.strip_suffix('/').unwrap_or(path).to_string()
}

impl PathMatcher {
	fn matches(&self, path: &str) -> Option<PathParams> {
		match self {
			PathMatcher::Exact(p) => (p == path).then(PathParams::new),
			PathMatcher::Prefix(p) => {
				if p.is_empty() {
					return Some(PathParams::new());
				}
				let rest = path.strip_prefix(p.as_str())?;
				(rest.is_empty() || rest.starts_with('/')).then(PathParams::new)
			},
			PathMatcher::Segments(segments) => {
				let mut params = PathParams::new();
				let mut parts = path.split('/').skip(1);
				for seg in segments {
					let part = parts.next()?;
					match seg {
						Segment::Lit(lit) => {
							if lit != part {
								return None;
							}
						},
						Segment::Param(name) => {
							if part.is_empty() {
								return None;
							}
							params.insert(name.clone(), part.to_string());
						},
					}
				}
				if parts.next().is_some() {
					return None;
				}
				Some(params)
			},
		}
	}
}

fn check_predicate(p: &PredicateConfig, fetch: impl FnOnce() -> Option<String>) -> bool {
	let value = fetch();
	if let Some(present) = p.present {
		if present != value.is_some() {
			return false;
		}
		if value.is_none() {
			// Absent and required-absent; value checks cannot apply.
			return p.value.is_none() && p.regex.is_none();
		}
	}
	match (&value, &p.value, &p.regex) {
		(None, None, None) => true,
		(None, _, _) => false,
		(Some(v), Some(want), _) if v != want => false,
		(Some(v), _, Some(re)) if !re.is_match(v) => false,
		_ => true,
	}
}

fn query_param(query: &str, name: &str) -> Option<String> {
	query.split('&').find_map(|pair| {
		let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
		(k == name).then(|| v.to_string())
	})
}

fn cookie_param(req: &Request, name: &str) -> Option<String> {
	let header = req.headers().get(::http::header::COOKIE)?.to_str().ok()?;
	header.split(';').find_map(|pair| {
		let (k, v) = pair.trim().split_once('=')?;
		(k == name).then(|| v.to_string())
	})
}

fn lookup_path(root: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
	let mut cur = root;
	for seg in path.split('.') {
		cur = cur.get(seg)?;
	}
	Some(cur.clone())
}

fn json_as_string(v: &serde_json::Value) -> String {
	match v {
		serde_json::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;
	use crate::serdes::yamlviajson;

	fn table(y: &str) -> RouteTable {
		let config: Config = yamlviajson::from_str(y).unwrap();
		RouteTable::compile(&config).unwrap()
	}

	fn req(uri: &str) -> Request {
		::http::Request::builder()
			.uri(uri)
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn first_listed_route_wins() {
		let t = table(
			r#"
routes:
  - {id: a, path: /api, path_prefix: true, echo: true}
  - {id: b, path: /api/v2, path_prefix: true, echo: true}
"#,
		);
		let (r, _) = t
			.select("example.com", &Method::GET, "/api/v2/x", &req("/api/v2/x"), None)
			.unwrap();
		assert_eq!(r.id.as_str(), "a");
	}

	#[test]
	fn exact_match_unless_prefix() {
		let t = table("routes:\n  - {id: a, path: /api, echo: true}\n");
		assert!(
			t.select("h", &Method::GET, "/api", &req("/api"), None)
				.is_some()
		);
		assert!(
			t.select("h", &Method::GET, "/api/x", &req("/api/x"), None)
				.is_none()
		);
	}

	#[test]
	fn prefix_matches_whole_segments() {
		let t = table("routes:\n  - {id: a, path: /api, path_prefix: true, echo: true}\n");
		assert!(
			t.select("h", &Method::GET, "/api/users", &req("/api/users"), None)
				.is_some()
		);
		assert!(
			t.select("h", &Method::GET, "/apifoo", &req("/apifoo"), None)
				.is_none()
		);
	}

	#[test]
	fn method_filtering() {
		let t = table("routes:\n  - {id: a, path: /, methods: [POST], echo: true}\n");
		assert!(t.select("h", &Method::POST, "/", &req("/"), None).is_some());
		assert!(t.select("h", &Method::GET, "/", &req("/"), None).is_none());
	}

	#[test]
	fn domain_and_wildcard() {
		let t = table(
			r#"
routes:
  - id: a
    path: /
    path_prefix: true
    echo: true
    match:
      domains: ["api.example.com", "*.internal.example.com"]
"#,
		);
		assert!(
			t.select("api.example.com", &Method::GET, "/", &req("/"), None)
				.is_some()
		);
		assert!(
			t.select("x.internal.example.com", &Method::GET, "/", &req("/"), None)
				.is_some()
		);
		assert!(
			t.select("example.com", &Method::GET, "/", &req("/"), None)
				.is_none()
		);
	}

	#[test]
	fn path_params_are_extracted() {
		let t = table("routes:\n  - {id: a, path: \"/users/{id}/posts/{post}\", echo: true}\n");
		let (_, params) = t
			.select("h", &Method::GET, "/users/42/posts/7", &req("/users/42/posts/7"), None)
			.unwrap();
		assert_eq!(params.get("id").map(String::as_str), Some("42"));
		assert_eq!(params.get("post").map(String::as_str), Some("7"));
		assert!(
			t.select("h", &Method::GET, "/users/42", &req("/users/42"), None)
				.is_none()
		);
	}

	#[test]
	fn header_predicates_with_present_tristate() {
		let t = table(
			r#"
routes:
  - id: a
    path: /
    echo: true
    match:
      headers:
        - {name: x-beta, present: true}
        - {name: x-legacy, present: false}
"#,
		);
		let ok = ::http::Request::builder()
			.uri("/")
			.header("x-beta", "anything")
			.body(Body::empty())
			.unwrap();
		assert!(t.select("h", &Method::GET, "/", &ok, None).is_some());
		let missing = req("/");
		assert!(t.select("h", &Method::GET, "/", &missing, None).is_none());
		let legacy = ::http::Request::builder()
			.uri("/")
			.header("x-beta", "1")
			.header("x-legacy", "1")
			.body(Body::empty())
			.unwrap();
		assert!(t.select("h", &Method::GET, "/", &legacy, None).is_none());
	}

	#[test]
	fn body_predicates_match_json_paths() {
		let t = table(
			r#"
routes:
  - id: a
    path: /
    echo: true
    match:
      body:
        - {path: "user.role", regex: "^admin$"}
"#,
		);
		assert!(t.needs_body());
		let body = serde_json::json!({"user": {"role": "admin"}});
		assert!(
			t.select("h", &Method::GET, "/", &req("/"), Some(&body))
				.is_some()
		);
		let body = serde_json::json!({"user": {"role": "viewer"}});
		assert!(
			t.select("h", &Method::GET, "/", &req("/"), Some(&body))
				.is_none()
		);
		assert!(t.select("h", &Method::GET, "/", &req("/"), None).is_none());
	}

	#[test]
	fn strip_prefix_rewrites_path() {
		let t = table(
			"routes:\n  - {id: a, path: /api, path_prefix: true, strip_prefix: true, echo: true}\n",
		);
		let (r, _) = t
			.select("h", &Method::GET, "/api/users", &req("/api/users"), None)
			.unwrap();
		assert_eq!(r.stripped_path("/api/users"), "/users");
		assert_eq!(r.stripped_path("/api"), "/");
	}
}
