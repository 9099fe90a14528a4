use std::fmt::{Debug, Display};
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde yaml represents some things differently than "JSON in YAML format" (tagged enums,
/// merge keys). We don't want that, so we transcode YAML via the JSON data model.
pub mod yamlviajson {
	use serde::{de, ser};

	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let de_yaml = serde_yaml::Deserializer::from_str(s);
		let mut buf = Vec::with_capacity(128);
		{
			let mut se_json = serde_json::Serializer::new(&mut buf);
			serde_transcode::transcode(de_yaml, &mut se_json)?;
		}
		Ok(serde_json_path_to_error::from_slice(&buf)?)
	}

	/// Like `from_str`, but records the paths of any keys the target type ignored.
	/// Unknown fields warn instead of aborting the load.
	pub fn from_str_ignored<T>(s: &str) -> anyhow::Result<(T, Vec<String>)>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let de_yaml = serde_yaml::Deserializer::from_str(s);
		let mut buf = Vec::with_capacity(128);
		{
			let mut se_json = serde_json::Serializer::new(&mut buf);
			serde_transcode::transcode(de_yaml, &mut se_json)?;
		}
		let mut ignored = Vec::new();
		let de = &mut serde_json::Deserializer::from_slice(&buf);
		let value = serde_ignored::deserialize(de, |path| ignored.push(path.to_string()))?;
		Ok((value, ignored))
	}

	pub fn to_string<T>(value: &T) -> anyhow::Result<String>
	where
		T: ?Sized + ser::Serialize,
	{
		let js = serde_json::to_string(value)?;
		let mut buf = Vec::with_capacity(128);
		let mut se_yaml = serde_yaml::Serializer::new(&mut buf);
		let mut de_serde = serde_json::Deserializer::from_str(&js);
		serde_transcode::transcode(&mut de_serde, &mut se_yaml)?;
		Ok(String::from_utf8(buf)?)
	}
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

/// Go-style duration strings ("5s", "1h30m") for config fields.
pub mod serde_dur {
	pub use duration_str::deserialize_duration as deserialize;
	use duration_str::HumanFormat;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	pub use duration_str::deserialize_option_duration as deserialize;
	use duration_str::HumanFormat;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}

pub fn ser_display_option<S: Serializer, T: Display>(
	t: &Option<T>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	match t {
		None => serializer.serialize_none(),
		Some(t) => serializer.serialize_str(&t.to_string()),
	}
}

pub fn ser_display_iter<S: Serializer, T, TI: Display>(
	t: &T,
	serializer: S,
) -> Result<S::Ok, S::Error>
where
	for<'a> &'a T: IntoIterator<Item = &'a TI>,
{
	use serde::ser::SerializeSeq;
	let mut seq = serializer.serialize_seq(None)?;
	for el in t {
		seq.serialize_element(&el.to_string())?;
	}
	seq.end()
}

pub fn ser_display<S: Serializer, T: Display>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&t.to_string())
}

pub fn ser_redact<S: Serializer, T>(_t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

pub fn de_parse<'de: 'a, 'a, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: TryFrom<&'a str>,
	<T as TryFrom<&'a str>>::Error: Display,
{
	let s: &'a str = <&str>::deserialize(deserializer)?;
	match T::try_from(s) {
		Ok(t) => Ok(t),
		Err(e) => Err(serde::de::Error::custom(e)),
	}
}

/// A value that can be given inline or loaded from a file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum FileOrInline {
	File { file: PathBuf },
	Inline(String),
}

impl FileOrInline {
	pub fn load(&self) -> io::Result<String> {
		match self {
			FileOrInline::File { file } => std::fs::read_to_string(file),
			FileOrInline::Inline(s) => Ok(s.clone()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, serde::Deserialize, PartialEq)]
	struct Sample {
		name: String,
		#[serde(with = "serde_dur")]
		wait: std::time::Duration,
	}

	#[test]
	fn yaml_parses_via_json_model() {
		let s: Sample = yamlviajson::from_str("name: a\nwait: 1h30m\n").unwrap();
		assert_eq!(s.name, "a");
		assert_eq!(s.wait, std::time::Duration::from_secs(5400));
	}

	#[test]
	fn unknown_fields_are_reported_not_fatal() {
		let (s, ignored) =
			yamlviajson::from_str_ignored::<Sample>("name: a\nwait: 5s\nbogus: 1\n").unwrap();
		assert_eq!(s.name, "a");
		assert_eq!(ignored, vec!["bogus".to_string()]);
	}
}
