#![forbid(unsafe_code)]

use std::convert::Infallible;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::{Response, StatusCode, header};
use relay_domain::{ChannelName, WireFormat};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::server::http::HttpBody;
use crate::server::multiplexer::RelayMultiplexer;
use crate::server::session::{OutboundTransport, TransportClosed};

const BODY_QUEUE_CAPACITY: usize = 16;

/// Frames each payload as `data: <json>\n\n` into a streaming response body.
pub struct SseTransport {
	tx: mpsc::Sender<Bytes>,
}

pub fn sse_frame(payload: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(payload.len() + 8);
	buf.put_slice(b"data: ");
	buf.put_slice(payload);
	buf.put_slice(b"\n\n");
	buf.freeze()
}

#[async_trait]
impl OutboundTransport for SseTransport {
	async fn write_frame(&mut self, payload: Bytes) -> Result<(), TransportClosed> {
		self.tx.send(sse_frame(&payload)).await.map_err(|_| TransportClosed)
	}

	async fn closed(&mut self) {
		self.tx.closed().await
	}
}

fn body_from(rx: mpsc::Receiver<Bytes>) -> HttpBody {
	let stream = futures::stream::unfold(rx, |mut rx| async move {
		rx.recv().await.map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
	});
	StreamBody::new(stream).boxed_unsync()
}

/// One-way stream of `channel`'s events for as long as the client stays connected.
pub fn stream_channel(mux: &RelayMultiplexer, channel: ChannelName) -> Response<HttpBody> {
	let (tx, rx) = mpsc::channel(BODY_QUEUE_CAPACITY);
	let mux = mux.clone();

	tokio::spawn(async move {
		let mut session = mux.open_session(WireFormat::EventStream, SseTransport { tx });
		match mux.subscribe(&mut session, &channel) {
			Ok(_) => {
				info!(subscriber = %session.id(), channel = %channel, "event-stream subscriber connected");
				session.transport_closed().await;
				info!(subscriber = %session.id(), channel = %channel, "event-stream subscriber disconnected");
			}
			Err(e) => {
				warn!(channel = %channel, error = %e, "event-stream subscribe failed");
				session.push_error(Some(&channel), &e.to_string());
			}
		}
		mux.close_session(session).await;
	});

	let mut resp = Response::new(body_from(rx));
	*resp.status_mut() = StatusCode::OK;
	let headers = resp.headers_mut();
	headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/event-stream"));
	headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
	headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
	resp
}
