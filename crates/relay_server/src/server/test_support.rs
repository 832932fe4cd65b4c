#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_domain::ChannelName;
use relay_upstream::{BotCredentials, SecretString, UpstreamError};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::time::timeout;

use crate::adapters::LoopbackConnector;
use crate::server::multiplexer::{MultiplexerConfig, RelayMultiplexer};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::{OutboundTransport, TransportClosed};
use crate::server::upstream::UpstreamOptions;

pub(crate) const WAIT: Duration = Duration::from_millis(1000);
pub(crate) const QUIET: Duration = Duration::from_millis(100);

pub(crate) fn chan(name: &str) -> ChannelName {
	ChannelName::new(name).expect("valid channel")
}

pub(crate) fn creds() -> Result<BotCredentials, UpstreamError> {
	BotCredentials::from_parts(Some("relaybot"), Some(&SecretString::new("token")))
}

pub(crate) fn registry(loopback: &LoopbackConnector) -> Arc<ConnectionRegistry> {
	registry_with(loopback, creds(), UpstreamOptions::default())
}

pub(crate) fn registry_with(
	loopback: &LoopbackConnector,
	credentials: Result<BotCredentials, UpstreamError>,
	opts: UpstreamOptions,
) -> Arc<ConnectionRegistry> {
	Arc::new(ConnectionRegistry::new(Arc::new(loopback.clone()), credentials, opts))
}

pub(crate) fn mux(registry: Arc<ConnectionRegistry>, capacity: usize) -> RelayMultiplexer {
	RelayMultiplexer::new(
		registry,
		MultiplexerConfig {
			subscriber_queue_capacity: capacity,
			send_ready_timeout: WAIT,
			close_grace: Duration::from_millis(200),
		},
	)
}

/// Wait until `channel`'s connection has joined upstream.
pub(crate) async fn ready(registry: &ConnectionRegistry, channel: &ChannelName) {
	let conn = registry.get(channel).expect("connection present");
	conn.wait_ready(WAIT).await.expect("connection ready");
}

/// Poll `cond` until it holds or the wait budget runs out.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
	let deadline = tokio::time::Instant::now() + WAIT;
	while tokio::time::Instant::now() < deadline {
		if cond() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	cond()
}

/// Transport that hands every frame to the test.
pub(crate) struct RecordingTransport {
	frames: mpsc::UnboundedSender<Bytes>,
}

pub(crate) struct Recorded {
	frames: mpsc::UnboundedReceiver<Bytes>,
}

pub(crate) fn recording() -> (RecordingTransport, Recorded) {
	let (tx, rx) = mpsc::unbounded_channel();
	(RecordingTransport { frames: tx }, Recorded { frames: rx })
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
	async fn write_frame(&mut self, payload: Bytes) -> Result<(), TransportClosed> {
		self.frames.send(payload).map_err(|_| TransportClosed)
	}
}

impl Recorded {
	pub(crate) async fn next_json(&mut self) -> serde_json::Value {
		let frame = timeout(WAIT, self.frames.recv())
			.await
			.expect("frame within timeout")
			.expect("transport open");
		serde_json::from_slice(&frame).expect("frame is json")
	}

	pub(crate) async fn assert_quiet(&mut self) {
		if let Ok(Some(frame)) = timeout(QUIET, self.frames.recv()).await {
			panic!("unexpected frame: {}", String::from_utf8_lossy(&frame));
		}
	}
}

/// Transport whose writes wait for explicit permits.
pub(crate) struct GatedTransport {
	inner: RecordingTransport,
	gate: Arc<Semaphore>,
	entered: Arc<Notify>,
}

pub(crate) struct Gate {
	gate: Arc<Semaphore>,
	entered: Arc<Notify>,
}

pub(crate) fn gated() -> (GatedTransport, Gate, Recorded) {
	let (inner, recorded) = recording();
	let gate = Arc::new(Semaphore::new(0));
	let entered = Arc::new(Notify::new());
	(
		GatedTransport {
			inner,
			gate: Arc::clone(&gate),
			entered: Arc::clone(&entered),
		},
		Gate { gate, entered },
		recorded,
	)
}

#[async_trait]
impl OutboundTransport for GatedTransport {
	async fn write_frame(&mut self, payload: Bytes) -> Result<(), TransportClosed> {
		self.entered.notify_one();
		self.gate.acquire().await.map_err(|_| TransportClosed)?.forget();
		self.inner.write_frame(payload).await
	}
}

impl Gate {
	/// Wait until the drain is blocked inside a write.
	pub(crate) async fn entered(&self) {
		timeout(WAIT, self.entered.notified()).await.expect("drain entered write");
	}

	pub(crate) fn open(&self) {
		self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
	}
}
