#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::PrefsPatch;

/// Subscriber → relay command received over the duplex transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SubscriberCommand {
	Subscribe {
		channel: String,
	},
	Unsubscribe {
		channel: String,
	},
	SetPreferences {
		#[serde(default)]
		channel: Option<String>,
		#[serde(default)]
		prefs: PrefsPatch,
	},
}

impl SubscriberCommand {
	pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
		serde_json::from_slice(bytes)
	}
}

/// `{"success": bool, "message": string}` envelope used by the HTTP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
	pub success: bool,
	pub message: String,
}

impl ApiResponse {
	pub fn ok(message: impl Into<String>) -> Self {
		Self {
			success: true,
			message: message.into(),
		}
	}

	pub fn fail(message: impl Into<String>) -> Self {
		Self {
			success: false,
			message: message.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_each_action() {
		assert_eq!(
			SubscriberCommand::parse(br#"{"action":"subscribe","channel":"foo"}"#).unwrap(),
			SubscriberCommand::Subscribe {
				channel: "foo".to_string()
			}
		);
		assert_eq!(
			SubscriberCommand::parse(br#"{"action":"unsubscribe","channel":"foo"}"#).unwrap(),
			SubscriberCommand::Unsubscribe {
				channel: "foo".to_string()
			}
		);

		let SubscriberCommand::SetPreferences { channel, prefs } =
			SubscriberCommand::parse(br#"{"action":"setPreferences","channel":"","prefs":{"clearchat":false}}"#).unwrap()
		else {
			panic!("expected SetPreferences");
		};
		assert_eq!(channel.as_deref(), Some(""));
		assert_eq!(prefs.clearchat, Some(false));
	}

	#[test]
	fn set_preferences_without_prefs_is_an_empty_patch() {
		let cmd = SubscriberCommand::parse(br#"{"action":"setPreferences"}"#).unwrap();
		assert_eq!(
			cmd,
			SubscriberCommand::SetPreferences {
				channel: None,
				prefs: PrefsPatch::default()
			}
		);
	}

	#[test]
	fn unknown_action_is_rejected() {
		assert!(SubscriberCommand::parse(br#"{"action":"explode","channel":"x"}"#).is_err());
		assert!(SubscriberCommand::parse(b"not json").is_err());
	}
}
