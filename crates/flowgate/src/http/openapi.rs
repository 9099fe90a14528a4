use std::collections::HashMap;

use crate::http::Request;
use crate::proxy::ProxyError;
use crate::types::features::ValidationConfig;
use crate::*;

/// The OpenAPI/JSON-schema validation seam. Validator internals are external collaborators;
/// the gateway compiles specs at load time and consults them per request through this trait.
pub trait SpecValidator: Send + Sync {
	fn validate_request(&self, req: &Request, body: Option<&[u8]>) -> Result<(), ValidationError>;
	fn validate_response(&self, status: u16, body: Option<&[u8]>) -> Result<(), ValidationError>;
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Registry of named spec validators, loaded from `openapi_specs` at startup.
#[derive(Default)]
pub struct SpecRegistry {
	specs: HashMap<Strng, Arc<dyn SpecValidator>>,
}

impl SpecRegistry {
	pub fn insert(&mut self, id: Strng, validator: Arc<dyn SpecValidator>) {
		self.specs.insert(id, validator);
	}

	pub fn get(&self, id: &str) -> Option<&Arc<dyn SpecValidator>> {
		self.specs.get(id)
	}
}

/// Minimal built-in schema checks for the inline `validation` block: required fields and
/// basic type assertions on a JSON body. Full JSON-schema engines plug in via `SpecValidator`.
pub fn validate_inline(
	config: &ValidationConfig,
	body: Option<&[u8]>,
) -> Result<(), ProxyError> {
	let Some(schema) = &config.request_schema else {
		return Ok(());
	};
	let Some(body) = body else {
		return Err(reject("request body required"));
	};
	let value: serde_json::Value =
		serde_json::from_slice(body).map_err(|e| reject(&format!("body is not JSON: {e}")))?;
	check_schema(schema, &value).map_err(|e| reject(&e))
}

fn check_schema(schema: &serde_json::Value, value: &serde_json::Value) -> Result<(), String> {
	if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
		let obj = value
			.as_object()
			.ok_or_else(|| "body must be a JSON object".to_string())?;
		for field in required.iter().filter_map(|f| f.as_str()) {
			if !obj.contains_key(field) {
				return Err(format!("missing required field: {field}"));
			}
		}
	}
	if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
		for (name, prop) in props {
			let Some(field) = value.get(name) else {
				continue;
			};
			if let Some(ty) = prop.get("type").and_then(|t| t.as_str())
				&& !type_matches(ty, field)
			{
				return Err(format!("field {name} must be of type {ty}"));
			}
		}
	}
	Ok(())
}

fn type_matches(ty: &str, value: &serde_json::Value) -> bool {
	match ty {
		"string" => value.is_string(),
		"number" => value.is_number(),
		"integer" => value.is_i64() || value.is_u64(),
		"boolean" => value.is_boolean(),
		"array" => value.is_array(),
		"object" => value.is_object(),
		"null" => value.is_null(),
		_ => true,
	}
}

fn reject(details: &str) -> ProxyError {
	ProxyError::Rejected {
		status: http::StatusCode::UNPROCESSABLE_ENTITY,
		message: details.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(schema: serde_json::Value) -> ValidationConfig {
		ValidationConfig {
			request_schema: Some(schema),
			response_schema: None,
		}
	}

	#[test]
	fn required_fields_are_enforced() {
		let cfg = config(serde_json::json!({"required": ["name"]}));
		validate_inline(&cfg, Some(br#"{"name": "a"}"#)).unwrap();
		assert!(validate_inline(&cfg, Some(br#"{"other": 1}"#)).is_err());
		assert!(validate_inline(&cfg, None).is_err());
	}

	#[test]
	fn type_assertions() {
		let cfg = config(serde_json::json!({
			"properties": {"age": {"type": "integer"}, "name": {"type": "string"}}
		}));
		validate_inline(&cfg, Some(br#"{"age": 3, "name": "a"}"#)).unwrap();
		assert!(validate_inline(&cfg, Some(br#"{"age": "three"}"#)).is_err());
	}

	#[test]
	fn absent_schema_is_a_noop() {
		validate_inline(&ValidationConfig::default(), None).unwrap();
	}
}
