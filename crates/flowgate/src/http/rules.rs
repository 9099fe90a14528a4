use indexmap::IndexMap;

use crate::expr::{Condition, RequestContext, Template};
use crate::http::{
	Body, HeaderName, HeaderValue, PolicyResponse, Request, Response, StatusCode, header,
};
use crate::proxy::ProxyError;
use crate::types::features::{RuleAction, RuleConfig, RulesConfig};
use crate::*;

/// Request/response phase rules: a compiled condition plus one action. Rules evaluate in
/// order; block/redirect short-circuit, the rest accumulate.
pub struct CompiledRules {
	pub request: Vec<CompiledRule>,
	pub response: Vec<CompiledRule>,
}

pub struct CompiledRule {
	when: Condition,
	action: CompiledAction,
}

enum CompiledAction {
	Block {
		status: StatusCode,
		message: Option<String>,
	},
	Redirect {
		location: Template,
		permanent: bool,
	},
	SetHeaders(Vec<(HeaderName, Template)>),
	Rewrite(Template),
	Group(Strng),
	Log(Template),
}

impl CompiledRules {
	pub fn compile(config: &RulesConfig) -> anyhow::Result<CompiledRules> {
		Ok(CompiledRules {
			request: config
				.request
				.iter()
				.map(CompiledRule::compile)
				.collect::<anyhow::Result<_>>()?,
			response: config
				.response
				.iter()
				.map(CompiledRule::compile)
				.collect::<anyhow::Result<_>>()?,
		})
	}
}

impl CompiledRule {
	fn compile(config: &RuleConfig) -> anyhow::Result<CompiledRule> {
		let when = Condition::compile(&config.when).map_err(|e| anyhow::anyhow!(e))?;
		let action = match &config.action {
			RuleAction::Block { status, message } => CompiledAction::Block {
				status: StatusCode::from_u16(*status)?,
				message: message.clone(),
			},
			RuleAction::Redirect {
				location,
				permanent,
			} => CompiledAction::Redirect {
				location: Template::compile(location).map_err(|e| anyhow::anyhow!(e))?,
				permanent: *permanent,
			},
			RuleAction::SetHeaders { headers } => CompiledAction::SetHeaders(compile_headers(headers)?),
			RuleAction::Rewrite { path } => {
				CompiledAction::Rewrite(Template::compile(path).map_err(|e| anyhow::anyhow!(e))?)
			},
			RuleAction::Group { group } => CompiledAction::Group(group.clone()),
			RuleAction::Log { message } => {
				CompiledAction::Log(Template::compile(message).map_err(|e| anyhow::anyhow!(e))?)
			},
		};
		Ok(CompiledRule { when, action })
	}
}

fn compile_headers(
	headers: &IndexMap<String, String>,
) -> anyhow::Result<Vec<(HeaderName, Template)>> {
	headers
		.iter()
		.map(|(k, v)| {
			Ok((
				HeaderName::try_from(k.as_str())?,
				Template::compile(v).map_err(|e| anyhow::anyhow!(e))?,
			))
		})
		.collect()
}

/// Runs the request-phase rules, mutating the request in place.
pub fn apply_request_rules(
	rules: &[CompiledRule],
	ctx: &mut RequestContext,
	req: &mut Request,
) -> Result<PolicyResponse, ProxyError> {
	for rule in rules {
		if !rule.when.evaluate(ctx, req) {
			continue;
		}
		match &rule.action {
			CompiledAction::Block { status, message } => {
				return Err(ProxyError::Rejected {
					status: *status,
					message: message
						.clone()
						.unwrap_or_else(|| "request blocked by rule".to_string()),
				});
			},
			CompiledAction::Redirect {
				location,
				permanent,
			} => {
				let target = location.resolve(ctx, req);
				let resp = ::http::Response::builder()
					.status(if *permanent {
						StatusCode::MOVED_PERMANENTLY
					} else {
						StatusCode::FOUND
					})
					.header(header::LOCATION, target)
					.body(Body::empty())
					.map_err(|e| ProxyError::Processing(e.into()))?;
				return Ok(PolicyResponse {
					direct_response: Some(resp),
					response_headers: None,
				});
			},
			CompiledAction::SetHeaders(headers) => {
				let resolved: Vec<(HeaderName, String)> = headers
					.iter()
					.map(|(name, tpl)| (name.clone(), tpl.resolve(ctx, req)))
					.collect();
				for (name, value) in resolved {
					if let Ok(v) = HeaderValue::try_from(value) {
						req.headers_mut().insert(name, v);
					}
				}
			},
			CompiledAction::Rewrite(path_tpl) => {
				let new_path = path_tpl.resolve(ctx, req);
				crate::http::modify_req_uri(req, |parts| {
					let query = parts
						.path_and_query
						.as_ref()
						.and_then(|pq| pq.query())
						.map(|q| format!("?{q}"))
						.unwrap_or_default();
					parts.path_and_query = Some(format!("{new_path}{query}").parse()?);
					Ok(())
				})
				.map_err(ProxyError::Processing)?;
			},
			CompiledAction::Group(group) => {
				ctx.traffic_group = Some(group.clone());
			},
			CompiledAction::Log(message) => {
				let rendered = message.resolve(ctx, req);
				info!(rule = rendered, "rule log");
			},
		}
	}
	Ok(PolicyResponse::default())
}

/// Response-phase rules; block rewrites the response, set_headers mutates it.
pub fn apply_response_rules(
	rules: &[CompiledRule],
	ctx: &mut RequestContext,
	req: &Request,
	resp: &mut Response,
) -> Result<(), ProxyError> {
	for rule in rules {
		if !rule.when.evaluate(ctx, req) {
			continue;
		}
		match &rule.action {
			CompiledAction::Block { status, message } => {
				*resp = crate::http::error_response(
					*status,
					message.as_deref().unwrap_or("response blocked by rule"),
					None,
				);
			},
			CompiledAction::SetHeaders(headers) => {
				let resolved: Vec<(HeaderName, String)> = headers
					.iter()
					.map(|(name, tpl)| (name.clone(), tpl.resolve(ctx, req)))
					.collect();
				for (name, value) in resolved {
					if let Ok(v) = HeaderValue::try_from(value) {
						resp.headers_mut().insert(name, v);
					}
				}
			},
			CompiledAction::Log(message) => {
				let rendered = message.resolve(ctx, req);
				info!(rule = rendered, "rule log");
			},
			// Request-phase only.
			CompiledAction::Redirect { .. } | CompiledAction::Rewrite(_) | CompiledAction::Group(_) => {},
		}
	}
	Ok(())
}
