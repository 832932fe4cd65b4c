#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use relay_domain::{ChannelName, RelayEvent};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::message::{IrcMessage, sanitize_outgoing};
use crate::{BotCredentials, ChatConnector, ChatSession, UpstreamError, new_session_id};

pub(crate) type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership";

/// Twitch IRC-over-WebSocket configuration.
#[derive(Debug, Clone)]
pub struct TwitchIrcConfig {
	pub irc_ws_url: String,
	pub login_timeout: Duration,
}

impl Default for TwitchIrcConfig {
	fn default() -> Self {
		Self {
			irc_ws_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
			login_timeout: Duration::from_secs(10),
		}
	}
}

/// Connector that opens one Twitch IRC session per call.
#[derive(Debug, Clone, Default)]
pub struct TwitchIrcConnector {
	cfg: TwitchIrcConfig,
}

impl TwitchIrcConnector {
	pub fn new(cfg: TwitchIrcConfig) -> Self {
		Self { cfg }
	}
}

#[async_trait]
impl ChatConnector for TwitchIrcConnector {
	async fn connect(&self, credentials: &BotCredentials) -> Result<Box<dyn ChatSession>, UpstreamError> {
		let url = Url::parse(&self.cfg.irc_ws_url)
			.map_err(|e| UpstreamError::Connect(format!("invalid irc url {}: {e}", self.cfg.irc_ws_url)))?;

		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.map_err(|e| UpstreamError::Connect(e.to_string()))?;

		let mut session = TwitchIrcSession {
			ws,
			pending: VecDeque::new(),
			outbox: VecDeque::new(),
			session_id: new_session_id(),
		};

		let token = credentials.token.expose();
		let pass = if token.starts_with("oauth:") {
			format!("PASS {token}")
		} else {
			format!("PASS oauth:{token}")
		};

		session.send_line(CAPABILITIES).await?;
		session.send_line(&pass).await?;
		session
			.send_line(&format!("NICK {}", credentials.username.to_ascii_lowercase()))
			.await?;

		tokio::time::timeout(self.cfg.login_timeout, session.await_welcome())
			.await
			.map_err(|_| UpstreamError::Timeout("irc login"))??;

		info!(session_id = %session.session_id, user = %credentials.username, "twitch irc session authenticated");
		Ok(Box::new(session))
	}
}

struct TwitchIrcSession {
	ws: TwitchWs,
	pending: VecDeque<IrcMessage>,
	/// Protocol replies owed to the server; a line leaves only once written.
	outbox: VecDeque<String>,
	session_id: String,
}

impl TwitchIrcSession {
	async fn send_line(&mut self, line: &str) -> Result<(), UpstreamError> {
		self.ws
			.send(Message::text(format!("{line}\r\n")))
			.await
			.map_err(|e| UpstreamError::Transport(e.to_string()))
	}

	/// Read one frame and queue its lines. Returns `false` once the socket is closed.
	async fn fill(&mut self) -> Result<bool, UpstreamError> {
		match self.ws.next().await {
			None | Some(Ok(Message::Close(_))) => Ok(false),
			Some(Err(e)) => Err(UpstreamError::Transport(e.to_string())),
			Some(Ok(Message::Text(text))) => {
				for line in text.as_str().split("\r\n").filter(|l| !l.is_empty()) {
					match IrcMessage::parse(line) {
						Ok(msg) => self.pending.push_back(msg),
						Err(e) => debug!(session_id = %self.session_id, error = %e, line, "skipping unparsable irc line"),
					}
				}
				Ok(true)
			}
			Some(Ok(_)) => Ok(true),
		}
	}

	fn queue_pong(&mut self, msg: &IrcMessage) {
		let token = msg.params.last().map(String::as_str).unwrap_or("tmi.twitch.tv");
		self.outbox.push_back(format!("PONG :{token}"));
	}

	async fn flush_outbox(&mut self) -> Result<(), UpstreamError> {
		while let Some(line) = self.outbox.front().cloned() {
			self.send_line(&line).await?;
			self.outbox.pop_front();
		}
		Ok(())
	}

	async fn await_welcome(&mut self) -> Result<(), UpstreamError> {
		loop {
			self.flush_outbox().await?;
			while let Some(msg) = self.pending.pop_front() {
				match msg.command.as_str() {
					"001" => return Ok(()),
					"PING" => self.queue_pong(&msg),
					"NOTICE" => {
						let text = msg.params.last().map(String::as_str).unwrap_or_default();
						if text.contains("Login authentication failed") || text.contains("Improperly formatted auth") {
							return Err(UpstreamError::LoginRejected(text.to_string()));
						}
					}
					_ => {}
				}
			}
			if !self.fill().await? {
				return Err(UpstreamError::Closed);
			}
		}
	}
}

#[async_trait]
impl ChatSession for TwitchIrcSession {
	async fn join(&mut self, channel: &ChannelName) -> Result<(), UpstreamError> {
		self.send_line(&format!("JOIN {}", channel.irc_target())).await
	}

	async fn say(&mut self, channel: &ChannelName, text: &str) -> Result<(), UpstreamError> {
		self.send_line(&format!("PRIVMSG {} :{}", channel.irc_target(), sanitize_outgoing(text)))
			.await
	}

	async fn next_event(&mut self) -> Result<Option<RelayEvent>, UpstreamError> {
		loop {
			self.flush_outbox().await?;
			while let Some(msg) = self.pending.pop_front() {
				match msg.command.as_str() {
					"PING" => {
						self.queue_pong(&msg);
						self.flush_outbox().await?;
					}
					"RECONNECT" => {
						warn!(session_id = %self.session_id, "twitch irc requested reconnect");
						return Ok(None);
					}
					_ => {
						if let Some(ev) = msg.to_event(SystemTime::now()) {
							return Ok(Some(ev));
						}
					}
				}
			}
			if !self.fill().await? {
				return Ok(None);
			}
		}
	}

	async fn disconnect(&mut self) {
		let _ = self.send_line("QUIT").await;
		if let Err(e) = self.ws.close(None).await {
			debug!(session_id = %self.session_id, error = %e, "irc websocket close failed");
		}
	}
}
