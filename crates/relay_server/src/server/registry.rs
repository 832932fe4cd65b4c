#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_domain::{ChannelName, SubscriberId};
use relay_upstream::{BotCredentials, ChatConnector, UpstreamError};
use tracing::{debug, info};

use crate::server::error::RelayError;
use crate::server::upstream::{Observer, UpstreamConnection, UpstreamOptions, UpstreamTask};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of attaching an observer.
#[derive(Debug)]
pub struct Attached {
	pub conn: Arc<UpstreamConnection>,
	/// A new upstream connection was opened for this call.
	pub created: bool,
}

/// Outcome of detaching an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
	NotAttached,
	Remaining(usize),
	/// Last observer gone; the connection was disconnected and removed.
	Disconnected,
}

/// Outcome of releasing a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
	NotPinned,
	/// Pin cleared; observers still hold the connection open.
	Unpinned { observers: usize },
	Disconnected,
}

/// Map of channel to its single upstream connection.
///
/// Every check-then-insert happens under one lock, so concurrent callers
/// for the same channel always share one connection.
pub struct ConnectionRegistry {
	inner: Mutex<HashMap<ChannelName, Arc<UpstreamConnection>>>,
	connector: Arc<dyn ChatConnector>,
	credentials: Result<BotCredentials, UpstreamError>,
	opts: UpstreamOptions,
}

impl ConnectionRegistry {
	pub fn new(
		connector: Arc<dyn ChatConnector>,
		credentials: Result<BotCredentials, UpstreamError>,
		opts: UpstreamOptions,
	) -> Self {
		Self {
			inner: Mutex::new(HashMap::new()),
			connector,
			credentials,
			opts,
		}
	}

	/// Bot identity used for upstream sessions, when configured.
	pub fn bot_username(&self) -> Option<&str> {
		self.credentials.as_ref().ok().map(|c| c.username.as_str())
	}

	/// Return the live connection for `channel`, opening one if needed.
	///
	/// A connection opened here has no observers yet, so it is pinned until released.
	pub fn ensure_connected(&self, channel: &ChannelName) -> Result<(Arc<UpstreamConnection>, bool), RelayError> {
		let (conn, created, ()) = self.ensure_with(channel, |conn, created| {
			if created {
				conn.pin();
			}
		})?;
		Ok((conn, created))
	}

	/// Ensure a connection and pin it, whoever opened it.
	///
	/// Returns whether this call set the pin.
	pub fn pin(&self, channel: &ChannelName) -> Result<(Arc<UpstreamConnection>, bool), RelayError> {
		let (conn, _created, newly_pinned) = self.ensure_with(channel, |conn, _| conn.pin())?;
		Ok((conn, newly_pinned))
	}

	/// Ensure a connection and register `observer` on it atomically.
	pub fn attach(&self, observer: Observer) -> Result<Attached, RelayError> {
		let channel = observer.channel.clone();
		let (conn, created, _) = self.ensure_with(&channel, move |conn, _| conn.observers().insert(observer))?;
		Ok(Attached { conn, created })
	}

	/// Remove one observer; the last unpinned observer out disconnects.
	pub fn detach(&self, channel: &ChannelName, id: SubscriberId) -> Detached {
		let removed = {
			let mut inner = self.inner.lock();
			let Some(conn) = inner.get(channel) else {
				return Detached::NotAttached;
			};
			let Some(remaining) = conn.observers().remove(id) else {
				return Detached::NotAttached;
			};
			if remaining > 0 || conn.is_pinned() {
				return Detached::Remaining(remaining);
			}
			remove_locked(&mut inner, channel)
		};

		if let Some(conn) = removed {
			conn.request_shutdown();
			info!(channel = %channel, "last observer left; upstream connection closed");
		}
		Detached::Disconnected
	}

	/// Clear the pin on `channel`; disconnect only if no observer remains.
	pub fn release(&self, channel: &ChannelName) -> Released {
		let removed = {
			let mut inner = self.inner.lock();
			let Some(conn) = inner.get(channel) else {
				return Released::NotPinned;
			};
			if !conn.unpin() {
				return Released::NotPinned;
			}
			let observers = conn.observer_count();
			if observers > 0 {
				debug!(channel = %channel, observers, "pin released; observers keep the connection open");
				return Released::Unpinned { observers };
			}
			remove_locked(&mut inner, channel)
		};

		if let Some(conn) = removed {
			conn.request_shutdown();
			info!(channel = %channel, "pin released; upstream connection closed");
		}
		Released::Disconnected
	}

	/// A live entry exists for `channel`.
	pub fn is_connected(&self, channel: &ChannelName) -> bool {
		self.inner.lock().get(channel).is_some_and(|c| c.is_live())
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	#[cfg(test)]
	pub fn get(&self, channel: &ChannelName) -> Option<Arc<UpstreamConnection>> {
		self.inner.lock().get(channel).cloned()
	}

	#[cfg(test)]
	pub fn observer_count(&self, channel: &ChannelName) -> usize {
		self.inner.lock().get(channel).map_or(0, |c| c.observer_count())
	}

	#[cfg(test)]
	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	#[cfg(test)]
	pub fn channels(&self) -> Vec<ChannelName> {
		let mut out: Vec<_> = self.inner.lock().keys().cloned().collect();
		out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
		out
	}

	/// Stop every connection and wait for the tasks to end.
	pub async fn shutdown_all(&self) {
		let conns: Vec<_> = {
			let mut inner = self.inner.lock();
			let drained = inner.drain().map(|(_, c)| c).collect();
			report_size(0);
			drained
		};

		info!(count = conns.len(), "shutting down upstream connections");
		for conn in conns {
			conn.shutdown(SHUTDOWN_GRACE).await;
		}
	}

	/// Look up or create the entry and run `f` on it while still holding the lock.
	///
	/// Failed or closed entries are replaced; their observers move to the new
	/// connection. The task for a new entry is spawned after the lock is released.
	fn ensure_with<R>(
		&self,
		channel: &ChannelName,
		f: impl FnOnce(&UpstreamConnection, bool) -> R,
	) -> Result<(Arc<UpstreamConnection>, bool, R), RelayError> {
		let credentials = self
			.credentials
			.as_ref()
			.map_err(|e| RelayError::Configuration(e.to_string()))?;

		let (conn, created, out, pending): (_, _, _, Option<UpstreamTask>) = {
			let mut inner = self.inner.lock();
			match inner.get(channel) {
				Some(existing) if existing.is_live() => {
					let out = f(existing, false);
					(Arc::clone(existing), false, out, None)
				}
				stale => {
					let (conn, task) = UpstreamConnection::new(
						channel.clone(),
						Arc::clone(&self.connector),
						credentials.clone(),
						self.opts.clone(),
					);
					if let Some(stale) = stale {
						debug!(channel = %channel, state = ?stale.state(), "replacing stale upstream connection");
						conn.adopt(stale);
						stale.request_shutdown();
					}
					let out = f(&conn, true);
					inner.insert(channel.clone(), Arc::clone(&conn));
					report_size(inner.len());
					(conn, true, out, Some(task))
				}
			}
		};

		if let Some(task) = pending {
			conn.start(task);
		}

		Ok((conn, created, out))
	}
}

fn remove_locked(
	inner: &mut HashMap<ChannelName, Arc<UpstreamConnection>>,
	channel: &ChannelName,
) -> Option<Arc<UpstreamConnection>> {
	let removed = inner.remove(channel);
	report_size(inner.len());
	removed
}

fn report_size(len: usize) {
	metrics::gauge!("relay_channels_connected").set(len as f64);
}
