use crate::http::Request;
use crate::proxy::ProxyError;
use crate::types::features::{WafConfig, WafMode};
use crate::*;

/// The WAF seam. Rule-engine internals live behind this trait; the built-in engine is a
/// pattern matcher over the request line, headers, and (optionally) the buffered body.
pub trait WafEngine: Send + Sync {
	fn inspect(&self, req: &Request, body: Option<&[u8]>) -> Option<WafFinding>;
}

#[derive(Debug, Clone)]
pub struct WafFinding {
	pub rule: String,
	pub matched: String,
}

pub struct Waf {
	mode: WafMode,
	engine: Arc<dyn WafEngine>,
}

impl Waf {
	pub fn new(config: &WafConfig) -> Waf {
		Waf {
			mode: config.mode,
			engine: Arc::new(PatternEngine {
				patterns: config.deny_patterns.clone(),
			}),
		}
	}

	pub fn with_engine(mode: WafMode, engine: Arc<dyn WafEngine>) -> Waf {
		Waf { mode, engine }
	}

	pub fn check(&self, req: &Request, body: Option<&[u8]>) -> Result<(), ProxyError> {
		let Some(finding) = self.engine.inspect(req, body) else {
			return Ok(());
		};
		match self.mode {
			WafMode::Detect => {
				info!(rule = finding.rule, matched = finding.matched, "waf detection");
				Ok(())
			},
			WafMode::Block => Err(ProxyError::Rejected {
				status: http::StatusCode::FORBIDDEN,
				message: "request blocked".to_string(),
			}),
		}
	}
}

struct PatternEngine {
	patterns: Vec<regex::Regex>,
}

impl WafEngine for PatternEngine {
	fn inspect(&self, req: &Request, body: Option<&[u8]>) -> Option<WafFinding> {
		// Percent-decode so encoded payloads cannot slip past the patterns.
		let raw = req.uri().to_string();
		let target = percent_encoding::percent_decode_str(&raw)
			.decode_utf8_lossy()
			.into_owned();
		for re in &self.patterns {
			if re.is_match(&target) {
				return Some(WafFinding {
					rule: re.as_str().to_string(),
					matched: "uri".to_string(),
				});
			}
			for (name, value) in req.headers() {
				if let Ok(v) = value.to_str()
					&& re.is_match(v)
				{
					return Some(WafFinding {
						rule: re.as_str().to_string(),
						matched: format!("header {name}"),
					});
				}
			}
			if let Some(body) = body {
				let text = String::from_utf8_lossy(body);
				if re.is_match(&text) {
					return Some(WafFinding {
						rule: re.as_str().to_string(),
						matched: "body".to_string(),
					});
				}
			}
		}
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn waf(mode: WafMode) -> Waf {
		Waf::new(&WafConfig {
			mode,
			deny_patterns: vec![regex::Regex::new(r"(?i)union\s+select").unwrap()],
			inspect_body: true,
		})
	}

	fn req(uri: &str) -> Request {
		::http::Request::builder()
			.uri(uri)
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn blocks_matching_uri() {
		let err = waf(WafMode::Block)
			.check(&req("http://h/q?id=1%20UNION%20SELECT"), None)
			.unwrap_err();
		assert!(matches!(err, ProxyError::Rejected { .. }));
	}

	#[test]
	fn detect_mode_only_logs() {
		waf(WafMode::Detect)
			.check(&req("http://h/q?id=1%20UNION%20SELECT"), None)
			.unwrap();
	}

	#[test]
	fn body_inspection() {
		let err = waf(WafMode::Block)
			.check(&req("http://h/q"), Some(b"x=1 union select password"))
			.unwrap_err();
		assert!(matches!(err, ProxyError::Rejected { .. }));
	}

	#[test]
	fn clean_requests_pass() {
		waf(WafMode::Block)
			.check(&req("http://h/products?page=2"), Some(b"{}"))
			.unwrap();
	}
}
