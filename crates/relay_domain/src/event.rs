#![forbid(unsafe_code)]

use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::ChannelName;

/// Event kinds relayed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	ChatMessage,
	Notice,
	UserNotice,
	ClearChat,
	RoomState,
	Subscribed,
}

impl EventKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::ChatMessage => "message",
			Self::Notice => "notice",
			Self::UserNotice => "usernotice",
			Self::ClearChat => "clearchat",
			Self::RoomState => "roomstate",
			Self::Subscribed => "subscribed",
		}
	}
}

/// Which downstream transport an event is encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
	/// Duplex socket: chat messages carry no timestamp.
	Socket,
	/// One-way event stream: chat messages carry an RFC 3339 `timestamp`.
	EventStream,
}

/// A relayed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
	ChatMessage {
		channel: ChannelName,
		user: String,
		message: String,
		received_at: SystemTime,
	},
	Notice {
		channel: ChannelName,
		system: String,
	},
	UserNotice {
		channel: ChannelName,
		system: String,
		msg_id: String,
	},
	ClearChat {
		channel: ChannelName,
	},
	RoomState {
		channel: ChannelName,
	},
	Subscribed {
		channel: ChannelName,
	},
}

impl RelayEvent {
	/// Chat message stamped with the current time.
	pub fn chat(channel: ChannelName, user: impl Into<String>, message: impl Into<String>) -> Self {
		Self::ChatMessage {
			channel,
			user: user.into(),
			message: message.into(),
			received_at: SystemTime::now(),
		}
	}

	pub fn kind(&self) -> EventKind {
		match self {
			Self::ChatMessage { .. } => EventKind::ChatMessage,
			Self::Notice { .. } => EventKind::Notice,
			Self::UserNotice { .. } => EventKind::UserNotice,
			Self::ClearChat { .. } => EventKind::ClearChat,
			Self::RoomState { .. } => EventKind::RoomState,
			Self::Subscribed { .. } => EventKind::Subscribed,
		}
	}

	pub fn channel(&self) -> &ChannelName {
		match self {
			Self::ChatMessage { channel, .. }
			| Self::Notice { channel, .. }
			| Self::UserNotice { channel, .. }
			| Self::ClearChat { channel }
			| Self::RoomState { channel }
			| Self::Subscribed { channel } => channel,
		}
	}

	/// Encode to the subscriber wire schema.
	pub fn to_wire(&self, format: WireFormat) -> serde_json::Value {
		let wire = match self {
			Self::ChatMessage {
				channel,
				user,
				message,
				received_at,
			} => WireEvent::Chat {
				user,
				message,
				channel: channel.as_str(),
				timestamp: match format {
					WireFormat::Socket => None,
					WireFormat::EventStream => Some(rfc3339(*received_at)),
				},
			},
			Self::Notice { channel, system } => WireEvent::Typed(TypedWire::Notice {
				channel: channel.as_str(),
				system,
			}),
			Self::UserNotice { channel, system, msg_id } => WireEvent::Typed(TypedWire::Usernotice {
				channel: channel.as_str(),
				system,
				msg_id,
			}),
			Self::ClearChat { channel } => WireEvent::Typed(TypedWire::Clearchat {
				channel: channel.as_str(),
			}),
			Self::RoomState { channel } => WireEvent::Typed(TypedWire::Roomstate {
				channel: channel.as_str(),
			}),
			Self::Subscribed { channel } => WireEvent::Typed(TypedWire::Subscribed {
				channel: channel.as_str(),
			}),
		};
		serde_json::to_value(wire).unwrap_or(serde_json::Value::Null)
	}

	/// Encode to wire JSON bytes.
	pub fn to_wire_bytes(&self, format: WireFormat) -> Vec<u8> {
		self.to_wire(format).to_string().into_bytes()
	}

	/// Error frame for a channel (not a relayed upstream event).
	pub fn error_wire(channel: Option<&ChannelName>, error: &str) -> Vec<u8> {
		serde_json::json!({
			"type": "error",
			"channel": channel.map(|c| c.as_str()).unwrap_or_default(),
			"error": error,
		})
		.to_string()
		.into_bytes()
	}
}

fn rfc3339(t: SystemTime) -> String {
	DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireEvent<'a> {
	Chat {
		user: &'a str,
		message: &'a str,
		channel: &'a str,
		#[serde(skip_serializing_if = "Option::is_none")]
		timestamp: Option<String>,
	},
	Typed(TypedWire<'a>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TypedWire<'a> {
	Notice { channel: &'a str, system: &'a str },
	Usernotice { channel: &'a str, system: &'a str, msg_id: &'a str },
	Clearchat { channel: &'a str },
	Roomstate { channel: &'a str },
	Subscribed { channel: &'a str },
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, UNIX_EPOCH};

	use serde_json::json;

	use super::*;

	fn chan(s: &str) -> ChannelName {
		ChannelName::new(s).unwrap()
	}

	#[test]
	fn chat_message_wire_depends_on_format() {
		let ev = RelayEvent::ChatMessage {
			channel: chan("testchan"),
			user: "alice".into(),
			message: "hi".into(),
			received_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
		};

		assert_eq!(
			ev.to_wire(WireFormat::Socket),
			json!({"user": "alice", "message": "hi", "channel": "testchan"})
		);
		assert_eq!(
			ev.to_wire(WireFormat::EventStream),
			json!({"user": "alice", "message": "hi", "channel": "testchan", "timestamp": "2023-11-14T22:13:20Z"})
		);
	}

	#[test]
	fn typed_events_use_lowercase_type_tags() {
		let c = chan("c");
		let cases = [
			(
				RelayEvent::Notice {
					channel: c.clone(),
					system: "slow mode".into(),
				},
				json!({"type": "notice", "channel": "c", "system": "slow mode"}),
			),
			(
				RelayEvent::UserNotice {
					channel: c.clone(),
					system: "x subscribed".into(),
					msg_id: "sub".into(),
				},
				json!({"type": "usernotice", "channel": "c", "system": "x subscribed", "msg_id": "sub"}),
			),
			(
				RelayEvent::ClearChat { channel: c.clone() },
				json!({"type": "clearchat", "channel": "c"}),
			),
			(
				RelayEvent::RoomState { channel: c.clone() },
				json!({"type": "roomstate", "channel": "c"}),
			),
			(
				RelayEvent::Subscribed { channel: c.clone() },
				json!({"type": "subscribed", "channel": "c"}),
			),
		];

		for (ev, expected) in cases {
			assert_eq!(ev.to_wire(WireFormat::Socket), expected);
			assert_eq!(ev.to_wire(WireFormat::EventStream), expected);
		}
	}

	#[test]
	fn error_frame_shape() {
		let bytes = RelayEvent::error_wire(Some(&chan("c")), "boom");
		let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(v, json!({"type": "error", "channel": "c", "error": "boom"}));
	}
}
