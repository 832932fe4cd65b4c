#![forbid(unsafe_code)]

mod command;
mod event;
mod prefs;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::{ApiResponse, SubscriberCommand};
pub use event::{EventKind, RelayEvent, WireFormat};
pub use prefs::{FilterPrefs, Preferences, PrefsPatch};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Upstream channel (room) name.
///
/// Case-sensitive; a leading `#` (IRC form) is stripped so `#foo` and `foo`
/// name the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
	/// Create a validated `ChannelName`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		let bare = trimmed.strip_prefix('#').unwrap_or(trimmed);
		if bare.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if bare.chars().any(|c| c.is_whitespace() || c == ',' || c.is_control()) {
			return Err(ParseIdError::InvalidFormat(format!(
				"channel name may not contain whitespace, commas or control characters: {bare:?}"
			)));
		}
		Ok(Self(bare.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// IRC form (`#name`).
	pub fn irc_target(&self) -> String {
		format!("#{}", self.0)
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

impl TryFrom<String> for ChannelName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelName::new(value)
	}
}

impl From<ChannelName> for String {
	fn from(value: ChannelName) -> Self {
		value.0
	}
}

/// Identity of one downstream subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "sub-{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_name_strips_hash_and_keeps_case() {
		let c = ChannelName::new("#FraktalCow").unwrap();
		assert_eq!(c.as_str(), "FraktalCow");
		assert_eq!(c.irc_target(), "#FraktalCow");
		assert_ne!(c, ChannelName::new("fraktalcow").unwrap());
	}

	#[test]
	fn rejects_empty_and_malformed_channels() {
		assert_eq!(ChannelName::new("").unwrap_err(), ParseIdError::Empty);
		assert_eq!(ChannelName::new("  # ").unwrap_err(), ParseIdError::Empty);
		assert!(ChannelName::new("two words").is_err());
		assert!(ChannelName::new("a,b").is_err());
	}

	#[test]
	fn channel_name_serde_is_a_plain_string() {
		let c: ChannelName = serde_json::from_str("\"testchan\"").unwrap();
		assert_eq!(serde_json::to_string(&c).unwrap(), "\"testchan\"");
		assert!(serde_json::from_str::<ChannelName>("\"\"").is_err());
	}
}
