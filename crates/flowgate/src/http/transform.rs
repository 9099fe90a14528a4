use serde_json::{Map, Value};

use crate::expr::{RequestContext, Template};
use crate::http::Request;
use crate::proxy::ProxyError;
use crate::types::features::BodyTransform;
use crate::*;

/// Compiled JSON body transform. Operations apply in a fixed order:
/// allow/deny -> set -> add -> remove -> rename -> flatten -> template.
/// Only `application/json` payloads are transformed; other content types pass through.
pub struct CompiledTransform {
	allow_fields: Vec<String>,
	deny_fields: Vec<String>,
	set_fields: Vec<(String, Template)>,
	add_fields: Vec<(String, Template)>,
	remove_fields: Vec<String>,
	rename_fields: Vec<(String, String)>,
	flatten: bool,
	template: Option<minijinja::Environment<'static>>,
}

impl std::fmt::Debug for CompiledTransform {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CompiledTransform").finish()
	}
}

const TEMPLATE_NAME: &str = "body";

impl CompiledTransform {
	pub fn compile(config: &BodyTransform) -> anyhow::Result<CompiledTransform> {
		let compile_pairs = |pairs: &indexmap::IndexMap<String, String>| {
			pairs
				.iter()
				.map(|(k, v)| {
					Template::compile(v)
						.map(|t| (k.clone(), t))
						.map_err(|e| anyhow::anyhow!(e))
				})
				.collect::<anyhow::Result<Vec<_>>>()
		};
		let template = config
			.template
			.as_ref()
			.map(|t| {
				let mut env = minijinja::Environment::new();
				env.add_template_owned(TEMPLATE_NAME, t.clone())?;
				Ok::<_, anyhow::Error>(env)
			})
			.transpose()?;
		Ok(CompiledTransform {
			allow_fields: config.allow_fields.clone(),
			deny_fields: config.deny_fields.clone(),
			set_fields: compile_pairs(&config.set_fields)?,
			add_fields: compile_pairs(&config.add_fields)?,
			remove_fields: config.remove_fields.clone(),
			rename_fields: config
				.rename_fields
				.iter()
				.map(|(a, b)| (a.clone(), b.clone()))
				.collect(),
			flatten: config.flatten,
			template: template,
		})
	}

	pub fn apply(
		&self,
		body: &[u8],
		ctx: &mut RequestContext,
		req: &Request,
	) -> Result<Bytes, ProxyError> {
		let mut value: Value = serde_json::from_slice(body)
			.map_err(|e| ProxyError::TransformationFailed(format!("body is not JSON: {e}")))?;

		if let Some(obj) = value.as_object_mut() {
			if !self.allow_fields.is_empty() {
				obj.retain(|k, _| self.allow_fields.iter().any(|f| f == k));
			}
			for f in &self.deny_fields {
				obj.remove(f);
			}
			for (field, tpl) in &self.set_fields {
				set_path(obj, field, Value::String(tpl.resolve(ctx, req)));
			}
			for (field, tpl) in &self.add_fields {
				if lookup_path(obj, field).is_none() {
					set_path(obj, field, Value::String(tpl.resolve(ctx, req)));
				}
			}
			for field in &self.remove_fields {
				remove_path(obj, field);
			}
			for (from, to) in &self.rename_fields {
				if let Some(v) = remove_path(obj, from) {
					set_path(obj, to, v);
				}
			}
			if self.flatten {
				let flattened = flatten_object(obj, "");
				*obj = flattened;
			}
		}

		if let Some(env) = &self.template {
			let tpl = env
				.get_template(TEMPLATE_NAME)
				.map_err(|e| ProxyError::TransformationFailed(e.to_string()))?;
			let rendered = tpl
				.render(minijinja::context! { body => value })
				.map_err(|e| ProxyError::TransformationFailed(e.to_string()))?;
			return Ok(Bytes::from(rendered));
		}

		serde_json::to_vec(&value)
			.map(Bytes::from)
			.map_err(|e| ProxyError::TransformationFailed(e.to_string()))
	}
}

fn lookup_path<'a>(obj: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
	let mut segments = path.split('.');
	let first = segments.next()?;
	let mut cur = obj.get(first)?;
	for seg in segments {
		cur = cur.get(seg)?;
	}
	Some(cur)
}

fn set_path(obj: &mut Map<String, Value>, path: &str, value: Value) {
	match path.split_once('.') {
		None => {
			obj.insert(path.to_string(), value);
		},
		Some((first, rest)) => {
			let entry = obj
				.entry(first.to_string())
				.or_insert_with(|| Value::Object(Map::new()));
			if !entry.is_object() {
				*entry = Value::Object(Map::new());
			}
			set_path(
				entry.as_object_mut().expect("ensured object above"),
				rest,
				value,
			);
		},
	}
}

fn remove_path(obj: &mut Map<String, Value>, path: &str) -> Option<Value> {
	let (first, rest) = match path.split_once('.') {
		Some((f, r)) => (f, Some(r)),
		None => (path, None),
	};
	match rest {
		None => obj.remove(first),
		Some(rest) => obj
			.get_mut(first)
			.and_then(|v| v.as_object_mut())
			.and_then(|m| remove_path(m, rest)),
	}
}

fn flatten_object(obj: &Map<String, Value>, prefix: &str) -> Map<String, Value> {
	let mut out = Map::new();
	for (k, v) in obj {
		let key = if prefix.is_empty() {
			k.clone()
		} else {
			format!("{prefix}.{k}")
		};
		match v {
			Value::Object(inner) => out.extend(flatten_object(inner, &key)),
			other => {
				out.insert(key, other.clone());
			},
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn transform(y: &str) -> CompiledTransform {
		CompiledTransform::compile(&crate::serdes::yamlviajson::from_str(y).unwrap()).unwrap()
	}

	fn ctx() -> RequestContext {
		RequestContext::new("1.2.3.4:1".parse().unwrap(), ::http::Version::HTTP_11)
	}

	fn req() -> Request {
		::http::Request::builder()
			.uri("http://h/orders")
			.body(Body::empty())
			.unwrap()
	}

	fn apply(t: &CompiledTransform, body: &str) -> Value {
		let out = t.apply(body.as_bytes(), &mut ctx(), &req()).unwrap();
		serde_json::from_slice(&out).unwrap()
	}

	#[test]
	fn allow_fields_keeps_only_listed() {
		let t = transform("allow_fields: [id, name]");
		let out = apply(&t, r#"{"id": 1, "name": "a", "secret": "x"}"#);
		assert_eq!(out, serde_json::json!({"id": 1, "name": "a"}));
	}

	#[test]
	fn allow_fields_is_idempotent() {
		let t = transform("allow_fields: [id]");
		let once = apply(&t, r#"{"id": 1, "b": 2}"#);
		let twice = apply(&t, &once.to_string());
		assert_eq!(once, twice);
	}

	#[test]
	fn set_add_remove_rename_order() {
		let t = transform(
			r#"
set_fields: {source: gateway}
add_fields: {name: anonymous}
remove_fields: [password]
rename_fields: {uid: user_id}
"#,
		);
		let out = apply(
			&t,
			r#"{"uid": 7, "name": "alice", "password": "pw"}"#,
		);
		assert_eq!(
			out,
			serde_json::json!({"name": "alice", "source": "gateway", "user_id": 7})
		);
	}

	#[test]
	fn set_resolves_variables_and_nested_paths() {
		let t = transform("set_fields: {\"meta.client\": \"$client.ip\"}");
		let out = apply(&t, r#"{"a": 1}"#);
		assert_eq!(out["meta"]["client"], "1.2.3.4");
	}

	#[test]
	fn flatten_collapses_nesting() {
		let t = transform("flatten: true");
		let out = apply(&t, r#"{"a": {"b": {"c": 1}}, "d": 2}"#);
		assert_eq!(out, serde_json::json!({"a.b.c": 1, "d": 2}));
	}

	#[test]
	fn template_replaces_body() {
		let t = transform("template: '{\"wrapped\": {{ body.id }}}'");
		let out = apply(&t, r#"{"id": 42}"#);
		assert_eq!(out, serde_json::json!({"wrapped": 42}));
	}

	#[test]
	fn non_json_body_errors() {
		let t = transform("remove_fields: [x]");
		assert!(t.apply(b"not json", &mut ctx(), &req()).is_err());
	}
}
