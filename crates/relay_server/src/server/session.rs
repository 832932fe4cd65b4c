#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use relay_domain::{ChannelName, Preferences, PrefsPatch, RelayEvent, SubscriberId, WireFormat};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::registry::ConnectionRegistry;
use crate::server::upstream::{Delivery, Observer, ObserverQueue};

/// The downstream peer went away.
#[derive(Debug, Clone, Copy, Error)]
#[error("downstream transport closed")]
pub struct TransportClosed;

/// Sink for one subscriber's serialized frames.
#[async_trait]
pub trait OutboundTransport: Send + 'static {
	async fn write_frame(&mut self, payload: Bytes) -> Result<(), TransportClosed>;

	/// Resolves once the peer is known to be gone.
	async fn closed(&mut self) {
		std::future::pending::<()>().await
	}

	/// Flush and close after the last frame.
	async fn finish(&mut self) {}
}

/// One downstream subscriber: its monitored channels, preferences and queue.
///
/// Dropping the session detaches it from every channel it monitored.
pub struct SubscriberSession {
	id: SubscriberId,
	format: WireFormat,
	prefs: Arc<RwLock<Preferences>>,
	monitored: HashSet<ChannelName>,
	queue_tx: Option<mpsc::Sender<Bytes>>,
	drain: Option<JoinHandle<()>>,
	registry: Arc<ConnectionRegistry>,
}

impl std::fmt::Debug for SubscriberSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriberSession")
			.field("id", &self.id)
			.field("format", &self.format)
			.field("monitored", &self.monitored)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl SubscriberSession {
	pub(crate) fn open<T: OutboundTransport>(
		id: SubscriberId,
		format: WireFormat,
		queue_capacity: usize,
		registry: Arc<ConnectionRegistry>,
		transport: T,
	) -> Self {
		let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
		let drain = tokio::spawn(drain_queue(id, queue_rx, transport));
		metrics::gauge!("relay_subscriber_sessions_active").increment(1.0);
		debug!(subscriber = %id, ?format, "subscriber session opened");

		Self {
			id,
			format,
			prefs: Arc::new(RwLock::new(Preferences::default())),
			monitored: HashSet::new(),
			queue_tx: Some(queue_tx),
			drain: Some(drain),
			registry,
		}
	}

	pub fn id(&self) -> SubscriberId {
		self.id
	}

	pub fn monitors(&self, channel: &ChannelName) -> bool {
		self.monitored.contains(channel)
	}

	pub fn monitored(&self) -> impl Iterator<Item = &ChannelName> {
		self.monitored.iter()
	}

	pub fn is_closed(&self) -> bool {
		self.queue_tx.as_ref().is_none_or(|tx| tx.is_closed())
	}

	/// Effective filter for `channel` right now.
	#[cfg(test)]
	pub fn preferences(&self, channel: &ChannelName) -> relay_domain::FilterPrefs {
		self.prefs.read().effective(channel)
	}

	pub(crate) fn update_preferences(&self, channel: Option<&ChannelName>, patch: &PrefsPatch) {
		self.prefs.write().apply(channel, patch);
	}

	pub(crate) fn observer_for(&self, channel: &ChannelName) -> Option<Observer> {
		let tx = self.queue_tx.clone()?;
		Some(Observer {
			id: self.id,
			channel: channel.clone(),
			prefs: Arc::clone(&self.prefs),
			queue: ObserverQueue::Wire { format: self.format, tx },
		})
	}

	pub(crate) fn mark_monitored(&mut self, channel: ChannelName) {
		self.monitored.insert(channel);
	}

	pub(crate) fn unmark_monitored(&mut self, channel: &ChannelName) -> bool {
		let removed = self.monitored.remove(channel);
		if removed {
			self.prefs.write().forget(channel);
		}
		removed
	}

	/// Enqueue a locally generated event (acks), bypassing preferences.
	pub fn push_event(&self, event: &RelayEvent) -> Delivery {
		self.push_frame(Bytes::from(event.to_wire_bytes(self.format)))
	}

	/// Enqueue a `{"type":"error"}` frame.
	pub fn push_error(&self, channel: Option<&ChannelName>, error: &str) -> Delivery {
		self.push_frame(Bytes::from(RelayEvent::error_wire(channel, error)))
	}

	fn push_frame(&self, frame: Bytes) -> Delivery {
		let Some(tx) = &self.queue_tx else {
			return Delivery::Closed;
		};
		match tx.try_send(frame) {
			Ok(()) => Delivery::Delivered,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("relay_events_dropped_total").increment(1);
				Delivery::Dropped
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
		}
	}

	/// Resolves once the drain task ended because the peer went away.
	pub async fn transport_closed(&mut self) {
		if let Some(drain) = self.drain.as_mut() {
			let _ = drain.await;
			self.drain = None;
		}
	}

	/// Detach from every channel, flush what is queued, then stop the drain.
	pub async fn close(mut self, grace: Duration) {
		self.detach_all();
		if let Some(mut drain) = self.drain.take()
			&& tokio::time::timeout(grace, &mut drain).await.is_err()
		{
			warn!(subscriber = %self.id, "subscriber drain did not finish in time; aborting");
			drain.abort();
		}
	}

	fn detach_all(&mut self) {
		for channel in self.monitored.drain() {
			self.registry.detach(&channel, self.id);
		}
		self.queue_tx = None;
	}
}

impl Drop for SubscriberSession {
	fn drop(&mut self) {
		self.detach_all();
		if let Some(drain) = self.drain.take() {
			drain.abort();
		}
		metrics::gauge!("relay_subscriber_sessions_active").decrement(1.0);
		debug!(subscriber = %self.id, "subscriber session closed");
	}
}

async fn drain_queue<T: OutboundTransport>(id: SubscriberId, mut rx: mpsc::Receiver<Bytes>, mut transport: T) {
	loop {
		tokio::select! {
			biased;

			frame = rx.recv() => match frame {
				Some(frame) => {
					if transport.write_frame(frame).await.is_err() {
						debug!(subscriber = %id, "downstream write failed; stopping drain");
						break;
					}
				}
				None => break,
			},

			_ = transport.closed() => {
				debug!(subscriber = %id, "downstream peer gone; stopping drain");
				break;
			}
		}
	}

	rx.close();
	transport.finish().await;
}
