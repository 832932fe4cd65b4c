#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_domain::{ChannelName, RelayEvent};
use relay_upstream::{BotCredentials, ChatConnector, ChatSession, UpstreamError, new_session_id};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

/// In-memory chat network used for local runs and tests.
///
/// Events are injected by channel and reach every live session that joined it;
/// messages said through a session are recorded.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
	state: Arc<Mutex<LoopbackState>>,
	emit_interval: Option<Duration>,
}

#[derive(Default)]
struct LoopbackState {
	sessions: Vec<LiveSession>,
	said: Vec<(ChannelName, String)>,
	connects: usize,
	fail_next: usize,
	next_session: u64,
}

struct LiveSession {
	id: u64,
	joined: HashSet<ChannelName>,
	tx: mpsc::UnboundedSender<RelayEvent>,
}

impl LoopbackConnector {
	pub fn new() -> Self {
		Self::default()
	}

	/// Emit a synthetic chat line on every joined channel at this interval.
	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = Some(interval);
		self
	}

	/// Deliver `event` to sessions joined to its channel. Returns how many got it.
	#[cfg(test)]
	pub fn inject(&self, event: RelayEvent) -> usize {
		let state = self.state.lock();
		state
			.sessions
			.iter()
			.filter(|s| s.joined.contains(event.channel()))
			.filter(|s| s.tx.send(event.clone()).is_ok())
			.count()
	}

	/// End every session joined to `channel` as if the peer hung up.
	#[cfg(test)]
	pub fn hang_up(&self, channel: &ChannelName) {
		self.state.lock().sessions.retain(|s| !s.joined.contains(channel));
	}

	#[cfg(test)]
	pub fn said(&self) -> Vec<(ChannelName, String)> {
		self.state.lock().said.clone()
	}

	#[cfg(test)]
	pub fn connect_count(&self) -> usize {
		self.state.lock().connects
	}

	/// Live sessions currently joined to `channel`.
	#[cfg(test)]
	pub fn joined_sessions(&self, channel: &ChannelName) -> usize {
		self.state.lock().sessions.iter().filter(|s| s.joined.contains(channel)).count()
	}

	/// Fail the next `n` connect attempts.
	#[cfg(test)]
	pub fn fail_next_connects(&self, n: usize) {
		self.state.lock().fail_next = n;
	}
}

#[async_trait]
impl ChatConnector for LoopbackConnector {
	async fn connect(&self, credentials: &BotCredentials) -> Result<Box<dyn ChatSession>, UpstreamError> {
		let (tx, rx) = mpsc::unbounded_channel();
		let id = {
			let mut state = self.state.lock();
			state.connects += 1;
			if state.fail_next > 0 {
				state.fail_next -= 1;
				return Err(UpstreamError::Connect("loopback: scripted failure".to_string()));
			}
			state.next_session += 1;
			let id = state.next_session;
			state.sessions.push(LiveSession {
				id,
				joined: HashSet::new(),
				tx,
			});
			id
		};

		let session_id = new_session_id();
		info!(user = %credentials.username, %session_id, "loopback session opened");

		let ticker = self.emit_interval.map(|every| {
			let mut interval = tokio::time::interval(every);
			interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
			interval
		});

		Ok(Box::new(LoopbackSession {
			id,
			rx,
			state: Arc::clone(&self.state),
			ticker,
			tick: 0,
		}))
	}
}

struct LoopbackSession {
	id: u64,
	rx: mpsc::UnboundedReceiver<RelayEvent>,
	state: Arc<Mutex<LoopbackState>>,
	ticker: Option<Interval>,
	tick: u64,
}

impl LoopbackSession {
	fn joined(&self) -> Vec<ChannelName> {
		let state = self.state.lock();
		state
			.sessions
			.iter()
			.find(|s| s.id == self.id)
			.map(|s| s.joined.iter().cloned().collect())
			.unwrap_or_default()
	}

	fn emit_tick(&mut self) {
		self.tick += 1;
		let state = self.state.lock();
		let Some(live) = state.sessions.iter().find(|s| s.id == self.id) else {
			return;
		};
		for channel in &live.joined {
			let text = format!("loopback message #{} in {channel}", self.tick);
			let _ = live.tx.send(RelayEvent::chat(channel.clone(), "loopback_user", text));
		}
	}
}

#[async_trait]
impl ChatSession for LoopbackSession {
	async fn join(&mut self, channel: &ChannelName) -> Result<(), UpstreamError> {
		let mut state = self.state.lock();
		let live = state
			.sessions
			.iter_mut()
			.find(|s| s.id == self.id)
			.ok_or(UpstreamError::Closed)?;
		live.joined.insert(channel.clone());
		debug!(session = self.id, channel = %channel, "loopback joined");
		Ok(())
	}

	async fn say(&mut self, channel: &ChannelName, text: &str) -> Result<(), UpstreamError> {
		if !self.joined().contains(channel) {
			return Err(UpstreamError::Transport(format!("not joined to {channel}")));
		}
		self.state.lock().said.push((channel.clone(), text.to_string()));
		Ok(())
	}

	async fn next_event(&mut self) -> Result<Option<RelayEvent>, UpstreamError> {
		loop {
			let rx = &mut self.rx;
			let ticker = &mut self.ticker;
			let tick = async move {
				match ticker {
					Some(ticker) => {
						ticker.tick().await;
					}
					None => std::future::pending::<()>().await,
				}
			};

			tokio::select! {
				ev = rx.recv() => return Ok(ev),
				_ = tick => self.emit_tick(),
			}
		}
	}

	async fn disconnect(&mut self) {
		let id = self.id;
		self.state.lock().sessions.retain(|s| s.id != id);
		self.rx.close();
		debug!(session = id, "loopback session closed");
	}
}
