#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_domain::{ChannelName, PrefsPatch, RelayEvent, SubscriberCommand, SubscriberId, WireFormat};
use tracing::{debug, info, warn};

use crate::server::error::RelayError;
use crate::server::registry::{ConnectionRegistry, Released};
use crate::server::session::{OutboundTransport, SubscriberSession};

/// Configuration for `RelayMultiplexer`.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
	/// Maximum number of queued frames per subscriber.
	pub subscriber_queue_capacity: usize,
	/// How long `send` waits for a fresh connection to join.
	pub send_ready_timeout: Duration,
	/// How long closing a session waits for queued frames to flush.
	pub close_grace: Duration,
}

impl Default for MultiplexerConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 100,
			send_ready_timeout: Duration::from_secs(10),
			close_grace: Duration::from_secs(2),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
	Subscribed,
	AlreadySubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
	Unsubscribed,
	NotSubscribed,
}

/// Fans each channel's single upstream session out to many subscribers.
#[derive(Clone)]
pub struct RelayMultiplexer {
	registry: Arc<ConnectionRegistry>,
	cfg: MultiplexerConfig,
	next_id: Arc<AtomicU64>,
}

impl RelayMultiplexer {
	pub fn new(registry: Arc<ConnectionRegistry>, cfg: MultiplexerConfig) -> Self {
		Self {
			registry,
			cfg,
			next_id: Arc::new(AtomicU64::new(1)),
		}
	}

	pub fn registry(&self) -> &Arc<ConnectionRegistry> {
		&self.registry
	}

	/// Register a new subscriber whose frames are written to `transport`.
	pub fn open_session<T: OutboundTransport>(&self, format: WireFormat, transport: T) -> SubscriberSession {
		let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
		SubscriberSession::open(
			id,
			format,
			self.cfg.subscriber_queue_capacity,
			Arc::clone(&self.registry),
			transport,
		)
	}

	/// Start monitoring `channel`; a repeat subscribe is a no-op.
	///
	/// A channel whose connection has failed is attached again.
	pub fn subscribe(
		&self,
		session: &mut SubscriberSession,
		channel: &ChannelName,
	) -> Result<SubscribeOutcome, RelayError> {
		metrics::counter!("relay_subscribe_requests_total").increment(1);

		if session.monitors(channel) {
			if self.registry.is_connected(channel) {
				debug!(subscriber = %session.id(), channel = %channel, "already subscribed");
				return Ok(SubscribeOutcome::AlreadySubscribed);
			}
			debug!(subscriber = %session.id(), channel = %channel, "upstream connection gone; attaching again");
		}

		let observer = session.observer_for(channel).ok_or(RelayError::SessionClosed)?;
		let attached = self.registry.attach(observer)?;
		session.mark_monitored(channel.clone());
		session.push_event(&RelayEvent::Subscribed {
			channel: channel.clone(),
		});

		info!(
			subscriber = %session.id(),
			channel = %channel,
			new_connection = attached.created,
			observers = attached.conn.observer_count(),
			"subscribed"
		);
		Ok(SubscribeOutcome::Subscribed)
	}

	/// Stop monitoring `channel`; the last observer out closes the upstream.
	pub fn unsubscribe(&self, session: &mut SubscriberSession, channel: &ChannelName) -> UnsubscribeOutcome {
		metrics::counter!("relay_unsubscribe_requests_total").increment(1);

		if !session.unmark_monitored(channel) {
			debug!(subscriber = %session.id(), channel = %channel, "unsubscribe ignored; not subscribed");
			return UnsubscribeOutcome::NotSubscribed;
		}

		let detached = self.registry.detach(channel, session.id());
		info!(subscriber = %session.id(), channel = %channel, ?detached, "unsubscribed");
		UnsubscribeOutcome::Unsubscribed
	}

	/// Patch preferences for one channel, or for all when `channel` is `None`.
	///
	/// Takes effect for the next event delivered.
	pub fn set_preferences(&self, session: &SubscriberSession, channel: Option<&ChannelName>, patch: &PrefsPatch) {
		session.update_preferences(channel, patch);
		debug!(
			subscriber = %session.id(),
			channel = channel.map(ChannelName::as_str).unwrap_or("*"),
			?patch,
			"preferences updated"
		);
	}

	/// Post `text` to `channel`, opening (and pinning) a connection if needed.
	pub async fn send(&self, channel: &ChannelName, text: &str) -> Result<(), RelayError> {
		metrics::counter!("relay_send_requests_total").increment(1);

		let (conn, created) = self.registry.ensure_connected(channel)?;
		if created {
			debug!(channel = %channel, "send opened a new upstream connection");
		}
		conn.wait_ready(self.cfg.send_ready_timeout).await?;
		conn.say(text).await?;

		info!(channel = %channel, "message sent");
		Ok(())
	}

	/// Apply one command from a duplex subscriber.
	///
	/// Failures are reported to the subscriber as error frames; the session stays open.
	pub fn apply_command(&self, session: &mut SubscriberSession, cmd: SubscriberCommand) {
		match cmd {
			SubscriberCommand::Subscribe { channel } => match ChannelName::new(channel.as_str()) {
				Ok(channel) => {
					if let Err(e) = self.subscribe(session, &channel) {
						warn!(subscriber = %session.id(), channel = %channel, error = %e, "subscribe failed");
						session.push_error(Some(&channel), &e.to_string());
					}
				}
				Err(e) => {
					session.push_error(None, &RelayError::InvalidChannel(format!("{channel:?}: {e}")).to_string());
				}
			},
			SubscriberCommand::Unsubscribe { channel } => match ChannelName::new(channel.as_str()) {
				Ok(channel) => {
					self.unsubscribe(session, &channel);
				}
				Err(e) => debug!(subscriber = %session.id(), error = %e, "unsubscribe with invalid channel ignored"),
			},
			SubscriberCommand::SetPreferences { channel, prefs } => {
				let channel = channel.as_deref().map(str::trim).filter(|c| !c.is_empty());
				match channel.map(ChannelName::new).transpose() {
					Ok(channel) => self.set_preferences(session, channel.as_ref(), &prefs),
					Err(e) => {
						session.push_error(None, &RelayError::InvalidChannel(e.to_string()).to_string());
					}
				}
			}
		}
	}

	/// Detach from all channels and release the session.
	pub async fn close_session(&self, session: SubscriberSession) {
		let id = session.id();
		let monitored = session.monitored().count();
		session.close(self.cfg.close_grace).await;
		debug!(subscriber = %id, monitored, "subscriber session released");
	}

	/// HTTP subscribe: pin the channel's connection without a subscriber session.
	pub fn pin_channel(&self, channel: &ChannelName) -> Result<SubscribeOutcome, RelayError> {
		metrics::counter!("relay_subscribe_requests_total").increment(1);
		let (_conn, newly_pinned) = self.registry.pin(channel)?;
		Ok(if newly_pinned {
			SubscribeOutcome::Subscribed
		} else {
			SubscribeOutcome::AlreadySubscribed
		})
	}

	/// HTTP unsubscribe: drop the pin; sessions still watching keep their feed.
	pub fn release_channel(&self, channel: &ChannelName) -> UnsubscribeOutcome {
		metrics::counter!("relay_unsubscribe_requests_total").increment(1);
		match self.registry.release(channel) {
			Released::NotPinned => UnsubscribeOutcome::NotSubscribed,
			Released::Unpinned { .. } | Released::Disconnected => UnsubscribeOutcome::Unsubscribed,
		}
	}
}

impl std::fmt::Debug for RelayMultiplexer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RelayMultiplexer")
			.field("cfg", &self.cfg)
			.field("channels", &self.registry.len())
			.finish()
	}
}
