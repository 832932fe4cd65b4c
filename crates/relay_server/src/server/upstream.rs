#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relay_domain::{ChannelName, Preferences, RelayEvent, SubscriberId, WireFormat};
use relay_upstream::{BotCredentials, ChatConnector, ChatSession, UpstreamError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::error::RelayError;
use crate::util::backoff::backoff_delay;

const CONTROL_QUEUE_CAPACITY: usize = 64;

/// Retry and backoff settings for upstream sessions.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
	/// Extra connect attempts after the first failure (0 disables retry).
	pub connect_retries: u32,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for UpstreamOptions {
	fn default() -> Self {
		Self {
			connect_retries: 0,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
		}
	}
}

/// Lifecycle of one upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
	Connecting,
	Ready,
	Failed(String),
	Closed,
}

impl ConnectionState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Failed(_) | Self::Closed)
	}
}

/// Where an observer's events go.
#[derive(Debug, Clone)]
pub enum ObserverQueue {
	/// Serialized frames bound for a downstream transport.
	Wire { format: WireFormat, tx: mpsc::Sender<Bytes> },
	/// Decoded events for in-process consumers.
	Events(mpsc::Sender<RelayEvent>),
}

/// A subscriber registered against one channel's connection.
#[derive(Debug, Clone)]
pub struct Observer {
	pub id: SubscriberId,
	pub channel: ChannelName,
	pub prefs: Arc<RwLock<Preferences>>,
	pub queue: ObserverQueue,
}

/// Result of handing one event to one observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Delivered,
	Filtered,
	/// Queue full; the event is lost for this observer only.
	Dropped,
	Closed,
}

impl Observer {
	/// Filter against current preferences, then enqueue without blocking.
	pub fn deliver(&self, event: &RelayEvent) -> Delivery {
		if event.channel() != &self.channel {
			return Delivery::Filtered;
		}
		if !self.prefs.read().allows(&self.channel, event.kind()) {
			return Delivery::Filtered;
		}

		match &self.queue {
			ObserverQueue::Wire { format, tx } => classify(tx.try_send(Bytes::from(event.to_wire_bytes(*format)))),
			ObserverQueue::Events(tx) => classify(tx.try_send(event.clone())),
		}
	}

	/// Enqueue an error frame for wire observers; in-process observers watch the state instead.
	fn notify_error(&self, error: &str) -> Delivery {
		match &self.queue {
			ObserverQueue::Wire { tx, .. } => {
				classify(tx.try_send(Bytes::from(RelayEvent::error_wire(Some(&self.channel), error))))
			}
			ObserverQueue::Events(_) => Delivery::Filtered,
		}
	}
}

fn classify<T>(res: Result<(), TrySendError<T>>) -> Delivery {
	match res {
		Ok(()) => Delivery::Delivered,
		Err(TrySendError::Full(_)) => Delivery::Dropped,
		Err(TrySendError::Closed(_)) => Delivery::Closed,
	}
}

/// Observers of one channel; dispatch never awaits.
#[derive(Debug, Default)]
pub struct ObserverSet {
	inner: Mutex<Vec<Observer>>,
}

impl ObserverSet {
	/// Returns false when an observer with the same id is already present.
	pub fn insert(&self, observer: Observer) -> bool {
		let mut inner = self.inner.lock();
		if inner.iter().any(|o| o.id == observer.id) {
			return false;
		}
		inner.push(observer);
		true
	}

	/// Remove `id`, returning the remaining count if it was present.
	pub fn remove(&self, id: SubscriberId) -> Option<usize> {
		let mut inner = self.inner.lock();
		let idx = inner.iter().position(|o| o.id == id)?;
		inner.swap_remove(idx);
		Some(inner.len())
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	/// Tell every observer the connection is gone for good.
	fn notify_error(&self, error: &str) {
		for observer in self.inner.lock().iter() {
			if observer.notify_error(error) == Delivery::Dropped {
				debug!(subscriber = %observer.id, channel = %observer.channel, "subscriber queue full; error frame dropped");
			}
		}
	}

	pub(crate) fn take_all(&self) -> Vec<Observer> {
		std::mem::take(&mut *self.inner.lock())
	}

	pub fn dispatch(&self, event: &RelayEvent) {
		let inner = self.inner.lock();
		let mut delivered: u64 = 0;
		let mut dropped: u64 = 0;
		for observer in inner.iter() {
			match observer.deliver(event) {
				Delivery::Delivered => delivered += 1,
				Delivery::Dropped => {
					dropped += 1;
					debug!(
						subscriber = %observer.id,
						channel = %observer.channel,
						kind = event.kind().as_str(),
						"subscriber queue full; dropping event"
					);
				}
				Delivery::Filtered | Delivery::Closed => {}
			}
		}
		drop(inner);

		if delivered > 0 {
			metrics::counter!("relay_events_delivered_total").increment(delivered);
		}
		if dropped > 0 {
			metrics::counter!("relay_events_dropped_total").increment(dropped);
		}
	}
}

enum UpstreamControl {
	Say {
		text: String,
		resp: oneshot::Sender<Result<(), UpstreamError>>,
	},
}

/// Shared handle to the single upstream session for a channel.
///
/// Dropping the last handle stops the connection task.
pub struct UpstreamConnection {
	channel: ChannelName,
	observers: Arc<ObserverSet>,
	control_tx: mpsc::Sender<UpstreamControl>,
	state_rx: watch::Receiver<ConnectionState>,
	shutdown_tx: watch::Sender<bool>,
	pinned: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

/// Connection task that has been created but not yet spawned.
pub(crate) struct UpstreamTask {
	channel: ChannelName,
	connector: Arc<dyn ChatConnector>,
	credentials: BotCredentials,
	opts: UpstreamOptions,
	observers: Arc<ObserverSet>,
	control_rx: mpsc::Receiver<UpstreamControl>,
	state_tx: watch::Sender<ConnectionState>,
	shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for UpstreamConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UpstreamConnection")
			.field("channel", &self.channel)
			.field("state", &*self.state_rx.borrow())
			.field("observers", &self.observers.len())
			.field("pinned", &self.is_pinned())
			.finish()
	}
}

impl UpstreamConnection {
	/// Build the shared handle plus its unspawned task.
	pub(crate) fn new(
		channel: ChannelName,
		connector: Arc<dyn ChatConnector>,
		credentials: BotCredentials,
		opts: UpstreamOptions,
	) -> (Arc<Self>, UpstreamTask) {
		let observers = Arc::new(ObserverSet::default());
		let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
		let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let conn = Arc::new(Self {
			channel: channel.clone(),
			observers: Arc::clone(&observers),
			control_tx,
			state_rx,
			shutdown_tx,
			pinned: AtomicBool::new(false),
			task: Mutex::new(None),
		});

		let task = UpstreamTask {
			channel,
			connector,
			credentials,
			opts,
			observers,
			control_rx,
			state_tx,
			shutdown_rx,
		};

		(conn, task)
	}

	pub(crate) fn start(&self, task: UpstreamTask) {
		let handle = tokio::spawn(task.run());
		*self.task.lock() = Some(handle);
	}

	pub fn state(&self) -> ConnectionState {
		self.state_rx.borrow().clone()
	}

	/// Whether the connection is connecting or ready (not failed or closed).
	pub fn is_live(&self) -> bool {
		!self.state_rx.borrow().is_terminal() && !*self.shutdown_tx.borrow()
	}

	pub fn observers(&self) -> &ObserverSet {
		&self.observers
	}

	pub fn observer_count(&self) -> usize {
		self.observers.len()
	}

	/// Keep the connection open even with zero observers. Returns false if it was already pinned.
	pub fn pin(&self) -> bool {
		!self.pinned.swap(true, Ordering::AcqRel)
	}

	/// Returns false if the connection was not pinned.
	pub fn unpin(&self) -> bool {
		self.pinned.swap(false, Ordering::AcqRel)
	}

	pub fn is_pinned(&self) -> bool {
		self.pinned.load(Ordering::Acquire)
	}

	/// Move observers and pinning from a replaced connection.
	pub(crate) fn adopt(&self, stale: &UpstreamConnection) {
		for observer in stale.observers.take_all() {
			self.observers.insert(observer);
		}
		if stale.is_pinned() {
			self.pin();
		}
	}

	/// Wait until the session has joined the channel, or give up.
	pub async fn wait_ready(&self, timeout: Duration) -> Result<(), RelayError> {
		let mut rx = self.state_rx.clone();
		let state = match tokio::time::timeout(timeout, rx.wait_for(|s| *s != ConnectionState::Connecting)).await {
			Ok(Ok(state)) => state.clone(),
			Ok(Err(_)) => ConnectionState::Closed,
			Err(_) => {
				return Err(RelayError::unavailable(
					&self.channel,
					format!("not ready after {}ms", timeout.as_millis()),
				));
			}
		};

		match state {
			ConnectionState::Ready => Ok(()),
			ConnectionState::Failed(reason) => Err(RelayError::unavailable(&self.channel, reason)),
			ConnectionState::Closed | ConnectionState::Connecting => {
				Err(RelayError::unavailable(&self.channel, "connection closed"))
			}
		}
	}

	/// Resolves once the connection has failed or closed.
	pub async fn terminated(&self) {
		let mut rx = self.state_rx.clone();
		let _ = rx.wait_for(ConnectionState::is_terminal).await;
	}

	/// Post a chat message on this channel through the upstream session.
	pub async fn say(&self, text: &str) -> Result<(), RelayError> {
		let (resp, rx) = oneshot::channel();
		self.control_tx
			.send(UpstreamControl::Say {
				text: text.to_string(),
				resp,
			})
			.await
			.map_err(|_| RelayError::unavailable(&self.channel, "connection closed"))?;

		match rx.await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(RelayError::unavailable(&self.channel, e.to_string())),
			Err(_) => Err(RelayError::unavailable(&self.channel, "connection closed")),
		}
	}

	pub fn request_shutdown(&self) {
		self.shutdown_tx.send_replace(true);
	}

	/// Stop the task and wait up to `grace` for it to disconnect.
	pub async fn shutdown(&self, grace: Duration) {
		self.request_shutdown();
		let handle = self.task.lock().take();
		if let Some(mut handle) = handle
			&& tokio::time::timeout(grace, &mut handle).await.is_err()
		{
			warn!(channel = %self.channel, "upstream task did not stop in time; aborting");
			handle.abort();
		}
	}
}

impl Drop for UpstreamConnection {
	fn drop(&mut self) {
		self.shutdown_tx.send_replace(true);
	}
}

enum PumpEnd {
	Shutdown,
	Lost(String),
}

/// Resolves when shutdown is requested or every handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
	let _ = rx.wait_for(|stop| *stop).await;
}

async fn open_session(
	connector: &dyn ChatConnector,
	credentials: &BotCredentials,
	channel: &ChannelName,
) -> Result<Box<dyn ChatSession>, UpstreamError> {
	let mut session = connector.connect(credentials).await?;
	if let Err(e) = session.join(channel).await {
		session.disconnect().await;
		return Err(e);
	}
	debug!(channel = %channel, "joined channel");
	Ok(session)
}

impl UpstreamTask {
	async fn run(mut self) {
		let channel = self.channel.clone();
		let mut failures: u32 = 0;

		info!(channel = %channel, "upstream connection starting");

		let final_state = loop {
			let opened = tokio::select! {
				biased;
				_ = shutdown_requested(&mut self.shutdown_rx) => break ConnectionState::Closed,
				res = open_session(self.connector.as_ref(), &self.credentials, &self.channel) => res,
			};

			let reason = match opened {
				Ok(mut session) => {
					failures = 0;
					self.state_tx.send_replace(ConnectionState::Ready);
					metrics::gauge!("relay_upstream_connections").increment(1.0);
					info!(channel = %channel, "upstream connection ready");

					let end = self.pump(session.as_mut()).await;
					session.disconnect().await;
					metrics::gauge!("relay_upstream_connections").decrement(1.0);

					match end {
						PumpEnd::Shutdown => break ConnectionState::Closed,
						PumpEnd::Lost(reason) => {
							warn!(channel = %channel, %reason, "upstream session lost");
							reason
						}
					}
				}
				Err(e) => {
					metrics::counter!("relay_upstream_connect_failures_total").increment(1);
					warn!(channel = %channel, error = %e, attempt = failures + 1, "upstream connect failed");
					e.to_string()
				}
			};

			if failures >= self.opts.connect_retries {
				break ConnectionState::Failed(reason);
			}

			let delay = backoff_delay(failures, self.opts.reconnect_min_delay, self.opts.reconnect_max_delay);
			failures += 1;
			self.state_tx.send_replace(ConnectionState::Connecting);
			debug!(channel = %channel, delay_ms = delay.as_millis(), retry = failures, "upstream reconnect scheduled");

			tokio::select! {
				biased;
				_ = shutdown_requested(&mut self.shutdown_rx) => break ConnectionState::Closed,
				_ = tokio::time::sleep(delay) => {}
			}
		};

		info!(channel = %channel, state = ?final_state, "upstream connection stopped");
		let failure = match &final_state {
			ConnectionState::Failed(reason) => Some(RelayError::unavailable(&channel, reason.as_str())),
			_ => None,
		};
		self.state_tx.send_replace(final_state);
		if let Some(e) = failure {
			self.observers.notify_error(&e.to_string());
		}

		self.control_rx.close();
		while let Ok(UpstreamControl::Say { resp, .. }) = self.control_rx.try_recv() {
			let _ = resp.send(Err(UpstreamError::Closed));
		}
	}

	async fn pump(&mut self, session: &mut dyn ChatSession) -> PumpEnd {
		loop {
			tokio::select! {
				_ = shutdown_requested(&mut self.shutdown_rx) => return PumpEnd::Shutdown,

				ctrl = self.control_rx.recv() => match ctrl {
					Some(UpstreamControl::Say { text, resp }) => {
						let res = session.say(&self.channel, &text).await;
						if let Err(e) = &res {
							warn!(channel = %self.channel, error = %e, "upstream say failed");
						}
						let _ = resp.send(res);
					}
					None => return PumpEnd::Shutdown,
				},

				ev = session.next_event() => match ev {
					Ok(Some(event)) => self.observers.dispatch(&event),
					Ok(None) => return PumpEnd::Lost("upstream closed the session".to_string()),
					Err(e) => return PumpEnd::Lost(e.to_string()),
				},
			}
		}
	}
}
