#![forbid(unsafe_code)]

//! IRCv3 line parsing:
//! `[@tags SPACE] [:prefix SPACE] command [SPACE params] [SPACE :trailing]`.

use std::collections::BTreeMap;
use std::time::SystemTime;

use relay_domain::{ChannelName, RelayEvent};
use thiserror::Error;

/// A parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
	pub tags: BTreeMap<String, String>,
	/// Server name or `nick!user@host`.
	pub prefix: Option<String>,
	pub command: String,
	/// Middle params followed by the trailing param, if any.
	pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
	#[error("empty message")]
	Empty,
	#[error("missing command")]
	MissingCommand,
}

impl IrcMessage {
	/// Parse a single line (a trailing `\r\n` is ignored).
	pub fn parse(line: &str) -> Result<Self, ParseError> {
		let mut rest = line.trim_end_matches(['\r', '\n']);
		if rest.trim().is_empty() {
			return Err(ParseError::Empty);
		}

		let mut tags = BTreeMap::new();
		if let Some(tagged) = rest.strip_prefix('@') {
			let (raw_tags, after) = tagged.split_once(' ').ok_or(ParseError::MissingCommand)?;
			for item in raw_tags.split(';').filter(|i| !i.is_empty()) {
				match item.split_once('=') {
					Some((k, v)) => tags.insert(k.to_string(), unescape_tag_value(v)),
					None => tags.insert(item.to_string(), String::new()),
				};
			}
			rest = after.trim_start_matches(' ');
		}

		let mut prefix = None;
		if let Some(prefixed) = rest.strip_prefix(':') {
			let (p, after) = prefixed.split_once(' ').ok_or(ParseError::MissingCommand)?;
			prefix = Some(p.to_string());
			rest = after.trim_start_matches(' ');
		}

		let (command, mut remaining) = match rest.split_once(' ') {
			Some((c, r)) => (c, r),
			None => (rest, ""),
		};
		if command.is_empty() {
			return Err(ParseError::MissingCommand);
		}

		let mut params = Vec::new();
		loop {
			remaining = remaining.trim_start_matches(' ');
			if remaining.is_empty() {
				break;
			}
			if let Some(trailing) = remaining.strip_prefix(':') {
				params.push(trailing.to_string());
				break;
			}
			match remaining.split_once(' ') {
				Some((p, r)) => {
					params.push(p.to_string());
					remaining = r;
				}
				None => {
					params.push(remaining.to_string());
					break;
				}
			}
		}

		Ok(Self {
			tags,
			prefix,
			command: command.to_ascii_uppercase(),
			params,
		})
	}

	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	/// Nick part of a `nick!user@host` prefix.
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		let nick = prefix.split_once('!').map(|(n, _)| n).unwrap_or(prefix);
		(!nick.is_empty() && !nick.contains('.')).then_some(nick)
	}

	/// Channel from the first param, only when it is a `#channel` target.
	pub fn channel(&self) -> Option<ChannelName> {
		let first = self.params.first()?;
		if !first.starts_with('#') {
			return None;
		}
		ChannelName::new(first.as_str()).ok()
	}

	/// Text after the channel param.
	pub fn text(&self) -> Option<&str> {
		if self.params.len() < 2 {
			return None;
		}
		self.params.last().map(String::as_str)
	}

	/// Map to a relayable event; `None` for everything the relay does not forward.
	pub fn to_event(&self, received_at: SystemTime) -> Option<RelayEvent> {
		let channel = self.channel()?;
		match self.command.as_str() {
			"PRIVMSG" => {
				let user = self
					.nick()
					.or_else(|| self.tag("login"))
					.or_else(|| self.tag("display-name"))
					.unwrap_or_default();
				Some(RelayEvent::ChatMessage {
					channel,
					user: user.to_string(),
					message: self.text().unwrap_or_default().to_string(),
					received_at,
				})
			}
			"NOTICE" => Some(RelayEvent::Notice {
				channel,
				system: self.text().unwrap_or_default().to_string(),
			}),
			"USERNOTICE" => Some(RelayEvent::UserNotice {
				channel,
				system: self
					.tag("system-msg")
					.or_else(|| self.text())
					.unwrap_or_default()
					.to_string(),
				msg_id: self.tag("msg-id").unwrap_or_default().to_string(),
			}),
			"CLEARCHAT" => Some(RelayEvent::ClearChat { channel }),
			"ROOMSTATE" => Some(RelayEvent::RoomState { channel }),
			_ => None,
		}
	}
}

/// IRCv3 tag value unescaping.
pub fn unescape_tag_value(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

/// Strip line breaks so user text cannot smuggle extra IRC commands.
pub fn sanitize_outgoing(text: &str) -> String {
	text.chars()
		.map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
		.collect()
}
