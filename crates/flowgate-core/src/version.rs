use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub build_profile: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION").to_string(),
			build_profile: if cfg!(debug_assertions) {
				"debug".to_string()
			} else {
				"release".to_string()
			},
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", BuildProfile:\"{}\"}}",
			self.version, self.build_profile
		)
	}
}
