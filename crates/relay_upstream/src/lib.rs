#![forbid(unsafe_code)]

pub mod twitch;

use std::fmt;

use async_trait::async_trait;
use relay_domain::{ChannelName, RelayEvent};
use thiserror::Error;
use uuid::Uuid;

/// Upstream chat-protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
	#[error("missing credentials: {0}")]
	MissingCredentials(&'static str),
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("login rejected: {0}")]
	LoginRejected(String),
	#[error("transport error: {0}")]
	Transport(String),
	#[error("timed out: {0}")]
	Timeout(&'static str),
	#[error("session closed")]
	Closed,
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Bot identity used for every upstream session.
#[derive(Debug, Clone)]
pub struct BotCredentials {
	pub username: String,
	pub token: SecretString,
}

impl BotCredentials {
	/// Validate that both the identity and the bearer token are present.
	pub fn from_parts(username: Option<&str>, token: Option<&SecretString>) -> Result<Self, UpstreamError> {
		let username = username
			.map(str::trim)
			.filter(|u| !u.is_empty())
			.ok_or(UpstreamError::MissingCredentials("bot username (TWITCH_BOT_USERNAME)"))?;
		let token = token
			.filter(|t| !t.is_empty())
			.ok_or(UpstreamError::MissingCredentials("bot token (TWITCH_USER_ACCESS_TOKEN)"))?;
		Ok(Self {
			username: username.to_string(),
			token: token.clone(),
		})
	}
}

/// Opens sessions against the chat network.
#[async_trait]
pub trait ChatConnector: Send + Sync + 'static {
	/// Connect and authenticate as `credentials`.
	async fn connect(&self, credentials: &BotCredentials) -> Result<Box<dyn ChatSession>, UpstreamError>;
}

/// One authenticated chat-protocol session.
#[async_trait]
pub trait ChatSession: Send + 'static {
	async fn join(&mut self, channel: &ChannelName) -> Result<(), UpstreamError>;

	async fn say(&mut self, channel: &ChannelName, text: &str) -> Result<(), UpstreamError>;

	/// Next relayable event; `Ok(None)` once the peer closed the session.
	///
	/// Must be cancellation-safe: dropping the future loses no received event, and
	/// protocol replies still owed are written on the next call.
	async fn next_event(&mut self) -> Result<Option<RelayEvent>, UpstreamError>;

	async fn disconnect(&mut self);
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
