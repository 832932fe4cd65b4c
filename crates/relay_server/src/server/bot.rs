#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use relay_domain::{ChannelName, FilterPrefs, Preferences, RelayEvent, SubscriberId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::error::RelayError;
use crate::server::registry::ConnectionRegistry;
use crate::server::upstream::{Observer, ObserverQueue};

/// Prefix-triggered replies: `(trigger, reply)`. First match wins.
pub const DEFAULT_COMMANDS: &[(&str, &str)] = &[("!ping", "pong"), ("foo", "bar")];

/// Reserved id so the bot never collides with subscriber sessions.
const BOT_SUBSCRIBER_ID: SubscriberId = SubscriberId(0);

const BOT_QUEUE_CAPACITY: usize = 64;

pub fn reply_for<'a>(commands: &'a [(&'a str, &'a str)], text: &str) -> Option<&'a str> {
	commands
		.iter()
		.find(|(trigger, _)| text.starts_with(trigger))
		.map(|(_, reply)| *reply)
}

/// Watches one channel's chat and answers fixed commands through the same connection.
pub struct BotCommandProcessor {
	registry: Arc<ConnectionRegistry>,
	channel: ChannelName,
	ready_timeout: Duration,
	commands: &'static [(&'static str, &'static str)],
}

impl BotCommandProcessor {
	pub fn new(registry: Arc<ConnectionRegistry>, channel: ChannelName, ready_timeout: Duration) -> Self {
		Self {
			registry,
			channel,
			ready_timeout,
			commands: DEFAULT_COMMANDS,
		}
	}

	#[cfg(test)]
	pub fn with_commands(mut self, commands: &'static [(&'static str, &'static str)]) -> Self {
		self.commands = commands;
		self
	}

	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(async move {
			let channel = self.channel.clone();
			if let Err(e) = self.run().await {
				warn!(channel = %channel, error = %e, "[bot] command processor stopped");
			}
		})
	}

	async fn run(self) -> Result<(), RelayError> {
		let (tx, mut rx) = mpsc::channel(BOT_QUEUE_CAPACITY);
		let observer = Observer {
			id: BOT_SUBSCRIBER_ID,
			channel: self.channel.clone(),
			prefs: Arc::new(RwLock::new(Preferences::new(FilterPrefs::CHAT_ONLY))),
			queue: ObserverQueue::Events(tx),
		};

		let conn = self.registry.attach(observer)?.conn;
		if let Err(e) = conn.wait_ready(self.ready_timeout).await {
			self.registry.detach(&self.channel, BOT_SUBSCRIBER_ID);
			return Err(e);
		}
		info!(channel = %self.channel, "[bot] listening for commands");

		loop {
			let event = tokio::select! {
				ev = rx.recv() => ev,
				_ = conn.terminated() => None,
			};
			let Some(event) = event else {
				break;
			};

			let RelayEvent::ChatMessage { user, message, .. } = event else {
				continue;
			};
			debug!(channel = %self.channel, %user, %message, "[bot] chat");

			let Some(reply) = reply_for(self.commands, &message) else {
				continue;
			};

			metrics::counter!("relay_bot_commands_total").increment(1);
			match conn.say(reply).await {
				Ok(()) => info!(channel = %self.channel, %user, reply, "[bot] replied"),
				Err(e) => warn!(channel = %self.channel, error = %e, "[bot] reply failed"),
			}
		}

		self.registry.detach(&self.channel, BOT_SUBSCRIBER_ID);
		info!(channel = %self.channel, "[bot] connection ended");
		Ok(())
	}
}
