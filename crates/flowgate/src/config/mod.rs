pub mod loader;
pub mod validator;
pub mod watcher;

use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("{}{reason}", fmt_scope(scope))]
	Invalid { scope: String, reason: String },
	#[error("failed to read config: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to parse config: {0}")]
	Parse(#[source] anyhow::Error),
}

fn fmt_scope(scope: &str) -> String {
	if scope.is_empty() {
		String::new()
	} else {
		format!("{scope}: ")
	}
}

impl ConfigError {
	pub fn invalid(scope: impl Into<String>, reason: impl Into<String>) -> Self {
		ConfigError::Invalid {
			scope: scope.into(),
			reason: reason.into(),
		}
	}
}
