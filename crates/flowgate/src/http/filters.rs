use ::http::header::InvalidHeaderName;
use ::http::uri::InvalidUri;

use crate::expr::{RequestContext, Template};
use crate::http::uri::Scheme;
use crate::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use crate::types::features::{HeaderModifierConfig, RedirectConfig, RewriteConfig};
use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid URI")]
	InvalidURI,
	#[error("invalid URI: {0}")]
	InvalidHTTPURI(#[from] InvalidUri),
	#[error("invalid header name: {0}")]
	InvalidHeaderName(#[from] InvalidHeaderName),
	#[error("invalid header value: {0}")]
	InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
	#[error("invalid filter configuration: {0}")]
	InvalidFilterConfiguration(String),
	#[error("http error: {0}")]
	Http(#[from] ::http::Error),
}

/// Header set/add/remove with templated values.
#[derive(Debug, Clone)]
pub struct HeaderModifier {
	set: Vec<(HeaderName, Template)>,
	add: Vec<(HeaderName, Template)>,
	remove: Vec<HeaderName>,
}

impl HeaderModifier {
	pub fn compile(config: &HeaderModifierConfig) -> anyhow::Result<HeaderModifier> {
		let compile_pairs = |pairs: &indexmap::IndexMap<String, String>| {
			pairs
				.iter()
				.map(|(k, v)| {
					Ok((
						HeaderName::try_from(k.as_str())?,
						Template::compile(v).map_err(|e| anyhow::anyhow!(e))?,
					))
				})
				.collect::<anyhow::Result<Vec<_>>>()
		};
		Ok(HeaderModifier {
			set: compile_pairs(&config.set)?,
			add: compile_pairs(&config.add)?,
			remove: config
				.remove
				.iter()
				.map(|k| Ok(HeaderName::try_from(k.as_str())?))
				.collect::<anyhow::Result<Vec<_>>>()?,
		})
	}

	pub fn apply_request(&self, ctx: &mut RequestContext, req: &mut Request) -> Result<(), Error> {
		let mut resolved: Vec<(HeaderName, HeaderValue, bool)> = Vec::new();
		for (name, tpl) in &self.add {
			resolved.push((name.clone(), tpl.resolve(ctx, req).parse()?, false));
		}
		for (name, tpl) in &self.set {
			resolved.push((name.clone(), tpl.resolve(ctx, req).parse()?, true));
		}
		let headers = req.headers_mut();
		for (name, value, replace) in resolved {
			if replace {
				headers.insert(name, value);
			} else {
				headers.append(name, value);
			}
		}
		for name in &self.remove {
			headers.remove(name);
		}
		Ok(())
	}

	/// Response-side application; templates resolve against the originating request context.
	pub fn apply_response(
		&self,
		ctx: &mut RequestContext,
		req: &Request,
		headers: &mut HeaderMap,
	) -> Result<(), Error> {
		for (name, tpl) in &self.add {
			headers.append(name.clone(), tpl.resolve(ctx, req).parse()?);
		}
		for (name, tpl) in &self.set {
			headers.insert(name.clone(), tpl.resolve(ctx, req).parse()?);
		}
		for name in &self.remove {
			headers.remove(name);
		}
		Ok(())
	}
}

/// Redirect filter: answered at the gateway without contacting a backend.
pub fn apply_redirect(config: &RedirectConfig, req: &Request) -> Result<Response, Error> {
	let scheme = match &config.scheme {
		Some(s) => Scheme::try_from(s.as_str()).map_err(|_| Error::InvalidURI)?,
		None => req.uri().scheme().cloned().unwrap_or(Scheme::HTTP),
	};
	let authority = match &config.host {
		Some(h) => h.as_str().try_into()?,
		None => req.uri().authority().cloned().ok_or(Error::InvalidURI)?,
	};
	let path_and_query = match &config.path {
		Some(p) => {
			let mut new_path = p.clone();
			if let Some(q) = req.uri().query() {
				new_path.push('?');
				new_path.push_str(q);
			}
			new_path.try_into()?
		},
		None => req
			.uri()
			.path_and_query()
			.ok_or(Error::InvalidURI)?
			.clone(),
	};
	let new = Uri::builder()
		.scheme(scheme)
		.authority(authority)
		.path_and_query(path_and_query)
		.build()?;
	let status = config
		.status
		.and_then(|s| StatusCode::from_u16(s).ok())
		.unwrap_or(StatusCode::FOUND);
	Ok(
		::http::Response::builder()
			.status(status)
			.header(http::header::LOCATION, new.to_string())
			.body(http::Body::empty())?,
	)
}

#[derive(Debug, Clone)]
pub struct OriginalUrl(pub Uri);

/// URL rewrite applied before the request is forwarded upstream.
pub fn apply_rewrite(
	config: &RewriteConfig,
	matched_prefix: Option<&str>,
	req: &mut Request,
) -> Result<(), Error> {
	let orig = req.uri().clone();
	req.extensions_mut().insert(OriginalUrl(orig.clone()));

	let scheme = orig.scheme().cloned().unwrap_or(Scheme::HTTP);
	let authority = match &config.host {
		Some(h) => h.as_str().try_into()?,
		None => orig.authority().cloned().ok_or(Error::InvalidURI)?,
	};
	let path_and_query = if let Some(full) = &config.path {
		let mut new_path = full.clone();
		if let Some(q) = orig.query() {
			new_path.push('?');
			new_path.push_str(q);
		}
		new_path.try_into()?
	} else if let Some(prefix) = &config.prefix {
		let match_pfx = matched_prefix.ok_or_else(|| {
			Error::InvalidFilterConfiguration("prefix rewrite requires a prefix match".to_string())
		})?;
		let mut new_path = prefix.clone();
		let (_, rest) = orig.path().split_at(match_pfx.len().min(orig.path().len()));
		if !rest.is_empty() && !rest.starts_with('/') {
			new_path.push('/');
		}
		new_path.push_str(rest);
		if let Some(q) = orig.query() {
			new_path.push('?');
			new_path.push_str(q);
		}
		new_path.try_into()?
	} else {
		orig.path_and_query().ok_or(Error::InvalidURI)?.clone()
	};

	let new = Uri::builder()
		.scheme(scheme)
		.authority(authority)
		.path_and_query(path_and_query)
		.build()?;
	*req.uri_mut() = new;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn ctx() -> RequestContext {
		RequestContext::new("1.2.3.4:1".parse().unwrap(), ::http::Version::HTTP_11)
	}

	fn req(uri: &str) -> Request {
		::http::Request::builder()
			.uri(uri)
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn header_modifier_sets_and_removes() {
		let hm = HeaderModifier::compile(&crate::serdes::yamlviajson::from_str(
			r#"
set: {x-gateway: "fg", x-client: "$client.ip"}
remove: [x-internal]
"#,
		)
		.unwrap())
		.unwrap();
		let mut r = ::http::Request::builder()
			.uri("http://h/")
			.header("x-internal", "1")
			.body(Body::empty())
			.unwrap();
		hm.apply_request(&mut ctx(), &mut r).unwrap();
		assert_eq!(r.headers().get("x-gateway").unwrap(), "fg");
		assert_eq!(r.headers().get("x-client").unwrap(), "1.2.3.4");
		assert!(r.headers().get("x-internal").is_none());
	}

	#[test]
	fn redirect_preserves_query() {
		let cfg = RedirectConfig {
			scheme: Some("https".into()),
			host: Some("new.example.com".into()),
			path: None,
			status: Some(301),
		};
		let resp = apply_redirect(&cfg, &req("http://old.example.com/p?x=1")).unwrap();
		assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
		assert_eq!(
			resp.headers().get(http::header::LOCATION).unwrap(),
			"https://new.example.com/p?x=1"
		);
	}

	#[test]
	fn rewrite_prefix_swaps_matched_portion() {
		let cfg = RewriteConfig {
			path: None,
			prefix: Some("/internal".into()),
			host: None,
		};
		let mut r = req("http://h/api/users?page=2");
		apply_rewrite(&cfg, Some("/api"), &mut r).unwrap();
		assert_eq!(r.uri().path(), "/internal/users");
		assert_eq!(r.uri().query(), Some("page=2"));
		assert_eq!(
			r.extensions().get::<OriginalUrl>().unwrap().0.path(),
			"/api/users"
		);
	}

	#[test]
	fn rewrite_full_path() {
		let cfg = RewriteConfig {
			path: Some("/v2/everything".into()),
			prefix: None,
			host: Some("backend.internal".into()),
		};
		let mut r = req("http://h/old");
		apply_rewrite(&cfg, None, &mut r).unwrap();
		assert_eq!(r.uri().to_string(), "http://backend.internal/v2/everything");
	}
}
