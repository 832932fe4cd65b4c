#![forbid(unsafe_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_domain::{SubscriberCommand, WireFormat};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::multiplexer::RelayMultiplexer;
use crate::server::session::{OutboundTransport, SubscriberSession, TransportClosed};

/// Write half of a subscriber's websocket.
pub struct WsTransport<S> {
	sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> OutboundTransport for WsTransport<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn write_frame(&mut self, payload: Bytes) -> Result<(), TransportClosed> {
		let text = String::from_utf8_lossy(&payload).into_owned();
		self.sink.send(Message::text(text)).await.map_err(|_| TransportClosed)
	}

	async fn finish(&mut self) {
		let _ = self.sink.close().await;
	}
}

/// Run one duplex subscriber until the peer leaves, then release everything it held.
pub async fn serve_socket<S>(mux: RelayMultiplexer, ws: WebSocketStream<S>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (sink, mut stream) = ws.split();
	let mut session = mux.open_session(WireFormat::Socket, WsTransport { sink });
	info!(subscriber = %session.id(), "websocket subscriber connected");

	read_commands(&mux, &mut session, &mut stream).await;

	info!(subscriber = %session.id(), monitored = session.monitored().count(), "websocket subscriber disconnected");
	mux.close_session(session).await;
}

async fn read_commands<S>(mux: &RelayMultiplexer, session: &mut SubscriberSession, stream: &mut SplitStream<WebSocketStream<S>>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	while let Some(msg) = stream.next().await {
		let payload = match msg {
			Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
			Ok(Message::Binary(bin)) => bin,
			Ok(Message::Close(_)) => return,
			Ok(_) => continue,
			Err(e) => {
				debug!(subscriber = %session.id(), error = %e, "websocket read failed");
				return;
			}
		};

		match SubscriberCommand::parse(&payload) {
			Ok(cmd) => mux.apply_command(session, cmd),
			Err(e) => warn!(subscriber = %session.id(), error = %e, "ignoring malformed subscriber command"),
		}

		if session.is_closed() {
			return;
		}
	}
}
