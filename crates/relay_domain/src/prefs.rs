#![forbid(unsafe_code)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ChannelName, EventKind};

/// Per-kind delivery flags. Chat messages and acks are never filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPrefs {
	pub notice: bool,
	pub usernotice: bool,
	pub clearchat: bool,
	pub roomstate: bool,
}

impl Default for FilterPrefs {
	fn default() -> Self {
		Self {
			notice: true,
			usernotice: true,
			clearchat: true,
			roomstate: true,
		}
	}
}

impl FilterPrefs {
	/// Only chat messages pass.
	pub const CHAT_ONLY: Self = Self {
		notice: false,
		usernotice: false,
		clearchat: false,
		roomstate: false,
	};

	pub fn allows(&self, kind: EventKind) -> bool {
		match kind {
			EventKind::ChatMessage | EventKind::Subscribed => true,
			EventKind::Notice => self.notice,
			EventKind::UserNotice => self.usernotice,
			EventKind::ClearChat => self.clearchat,
			EventKind::RoomState => self.roomstate,
		}
	}

	pub fn apply(&mut self, patch: &PrefsPatch) {
		if let Some(v) = patch.notice {
			self.notice = v;
		}
		if let Some(v) = patch.usernotice {
			self.usernotice = v;
		}
		if let Some(v) = patch.clearchat {
			self.clearchat = v;
		}
		if let Some(v) = patch.roomstate {
			self.roomstate = v;
		}
	}
}

/// Partial preference update; absent keys keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefsPatch {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub notice: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usernotice: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub clearchat: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub roomstate: Option<bool>,
}

impl PrefsPatch {
	pub fn is_empty(&self) -> bool {
		self.notice.is_none() && self.usernotice.is_none() && self.clearchat.is_none() && self.roomstate.is_none()
	}
}

/// A subscriber's preferences: a session default plus per-channel overrides.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
	default: FilterPrefs,
	per_channel: HashMap<ChannelName, FilterPrefs>,
}

impl Preferences {
	pub fn new(default: FilterPrefs) -> Self {
		Self {
			default,
			per_channel: HashMap::new(),
		}
	}

	/// Flags in effect for `channel` right now.
	pub fn effective(&self, channel: &ChannelName) -> FilterPrefs {
		self.per_channel.get(channel).copied().unwrap_or(self.default)
	}

	pub fn allows(&self, channel: &ChannelName, kind: EventKind) -> bool {
		self.effective(channel).allows(kind)
	}

	/// Patch one channel, or the default and every override when `channel` is `None`.
	pub fn apply(&mut self, channel: Option<&ChannelName>, patch: &PrefsPatch) {
		match channel {
			Some(channel) => {
				let mut flags = self.effective(channel);
				flags.apply(patch);
				self.per_channel.insert(channel.clone(), flags);
			}
			None => {
				self.default.apply(patch);
				for flags in self.per_channel.values_mut() {
					flags.apply(patch);
				}
			}
		}
	}

	/// Drop a channel override (on unsubscribe).
	pub fn forget(&mut self, channel: &ChannelName) {
		self.per_channel.remove(channel);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn chan(s: &str) -> ChannelName {
		ChannelName::new(s).unwrap()
	}

	#[test]
	fn chat_and_acks_pass_any_flags() {
		let p = FilterPrefs::CHAT_ONLY;
		assert!(p.allows(EventKind::ChatMessage));
		assert!(p.allows(EventKind::Subscribed));
		assert!(!p.allows(EventKind::Notice));
		assert!(!p.allows(EventKind::RoomState));
	}

	#[test]
	fn patch_only_touches_present_keys() {
		let mut p = FilterPrefs::default();
		p.apply(&PrefsPatch {
			clearchat: Some(false),
			..Default::default()
		});
		assert_eq!(
			p,
			FilterPrefs {
				clearchat: false,
				..FilterPrefs::default()
			}
		);
	}

	#[test]
	fn channel_override_shadows_default_and_global_patch_reaches_overrides() {
		let mut prefs = Preferences::default();
		let a = chan("a");
		let b = chan("b");

		prefs.apply(
			Some(&a),
			&PrefsPatch {
				notice: Some(false),
				..Default::default()
			},
		);
		assert!(!prefs.allows(&a, EventKind::Notice));
		assert!(prefs.allows(&b, EventKind::Notice));

		prefs.apply(
			None,
			&PrefsPatch {
				roomstate: Some(false),
				..Default::default()
			},
		);
		assert!(!prefs.allows(&a, EventKind::RoomState));
		assert!(!prefs.allows(&b, EventKind::RoomState));
		assert!(!prefs.allows(&a, EventKind::Notice));

		prefs.forget(&a);
		assert!(prefs.allows(&a, EventKind::Notice));
	}

	#[test]
	fn patch_deserializes_from_wire_keys() {
		let patch: PrefsPatch = serde_json::from_str(r#"{"notice": false, "usernotice": true}"#).unwrap();
		assert_eq!(patch.notice, Some(false));
		assert_eq!(patch.usernotice, Some(true));
		assert_eq!(patch.clearchat, None);
		assert!(!patch.is_empty());
	}
}
