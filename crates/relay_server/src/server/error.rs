#![forbid(unsafe_code)]

use relay_domain::ChannelName;
use thiserror::Error;

/// Failures surfaced by the relay core to its transports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
	/// Credentials or other required settings are missing; nothing was attempted.
	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("upstream unavailable for {channel}: {reason}")]
	UpstreamUnavailable { channel: ChannelName, reason: String },

	#[error("invalid channel name: {0}")]
	InvalidChannel(String),

	#[error("subscriber session is closed")]
	SessionClosed,
}

impl RelayError {
	pub(crate) fn unavailable(channel: &ChannelName, reason: impl Into<String>) -> Self {
		Self::UpstreamUnavailable {
			channel: channel.clone(),
			reason: reason.into(),
		}
	}
}
