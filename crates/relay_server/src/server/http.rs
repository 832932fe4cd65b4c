#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_domain::{ApiResponse, ChannelName};
use relay_upstream::twitch::HelixClient;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use crate::server::multiplexer::{RelayMultiplexer, SubscribeOutcome, UnsubscribeOutcome};
use crate::server::{sse, ws};

pub type HttpBody = UnsyncBoxBody<Bytes, Infallible>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Upper bound on JSON request bodies.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const PRE_STYLE: &str = "background:#161b22;color:#c9d1d9;padding:16px;border-radius:8px;font-size:1.1em;";

/// Shared state for the public HTTP listener.
#[derive(Clone)]
pub struct AppState {
	pub mux: RelayMultiplexer,
	pub helix: Option<Arc<HelixClient>>,
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "failed to accept http connection");
				metrics::counter!("relay_http_accept_errors_total").increment(1);
				tokio::time::sleep(ACCEPT_BACKOFF).await;
				continue;
			}
		};
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, state.clone()));
			if let Err(err) = http1::Builder::new()
				.serve_connection(io, service)
				.with_upgrades()
				.await
			{
				debug!(%remote, error = %err, "http connection error");
			}
		});
	}
}

/// Dispatch one request. Generic over the body so tests can drive it directly.
pub async fn route<B>(req: Request<B>, state: AppState) -> Result<Response<HttpBody>, Infallible>
where
	B: Body + Send + 'static,
	B::Data: Send,
	B::Error: Into<BoxError>,
{
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let segments: Vec<String> = path
		.trim_matches('/')
		.split('/')
		.map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
		.collect();
	let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

	let resp = match (&method, segments.as_slice()) {
		(&Method::POST, ["irc", "subscribe"]) => match read_json::<ChannelRequest, _>(req).await {
			Some(body) => subscribe_response(&state, &body.channel, Render::Json),
			None => missing_channel(Render::Json),
		},
		(&Method::POST, ["irc", "subscribe", channel]) => subscribe_response(&state, channel, Render::Json),
		(&Method::GET, ["irc", "subscribe", channel]) => subscribe_response(&state, channel, Render::Html),
		(&Method::POST, ["irc", "unsubscribe"]) => match read_json::<ChannelRequest, _>(req).await {
			Some(body) => unsubscribe_response(&state, &body.channel, Render::Json),
			None => missing_channel(Render::Json),
		},
		(&Method::GET, ["irc", "unsubscribe", channel]) => unsubscribe_response(&state, channel, Render::Html),
		(&Method::POST, ["irc", "send"]) => send_response(&state, req).await,
		(&Method::GET, ["ws"]) => upgrade_socket(req, state.mux.clone()),
		(&Method::GET, ["irc", channel, "stream"]) => match ChannelName::new(*channel) {
			Ok(channel) => sse::stream_channel(&state.mux, channel),
			Err(_) => text(StatusCode::BAD_REQUEST, "Missing channel name"),
		},
		(&Method::GET, ["user", name]) => helix_response(&state, HelixQuery::User(name)).await,
		(&Method::GET, ["stream", name]) => helix_response(&state, HelixQuery::Stream(name)).await,
		(&Method::GET, ["games", "top"]) => helix_response(&state, HelixQuery::TopGames).await,
		_ => text(StatusCode::NOT_FOUND, "not found"),
	};

	debug!(%method, %path, status = resp.status().as_u16(), "http request");
	Ok(resp)
}

#[derive(Debug, Default, Deserialize)]
struct ChannelRequest {
	#[serde(default)]
	channel: String,
}

#[derive(Debug, Default, Deserialize)]
struct SendRequest {
	#[serde(default)]
	channel: String,
	#[serde(default)]
	message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Render {
	Json,
	Html,
}

async fn read_json<T, B>(req: Request<B>) -> Option<T>
where
	T: for<'de> Deserialize<'de>,
	B: Body,
	B::Error: Into<BoxError>,
{
	let bytes = match Limited::new(req.into_body(), MAX_REQUEST_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			debug!(error = %e, "failed to read request body");
			return None;
		}
	};
	serde_json::from_slice(&bytes).ok()
}

fn subscribe_response(state: &AppState, raw: &str, render: Render) -> Response<HttpBody> {
	let Ok(channel) = ChannelName::new(raw) else {
		return missing_channel(render);
	};

	let (status, body) = match state.mux.pin_channel(&channel) {
		Ok(SubscribeOutcome::Subscribed) => (
			StatusCode::OK,
			ApiResponse::ok(format!("Subscribed to IRC chat for channel {channel}")),
		),
		Ok(SubscribeOutcome::AlreadySubscribed) => (
			StatusCode::OK,
			ApiResponse::fail(format!("Already subscribed to IRC chat for channel {channel}")),
		),
		Err(e) => {
			warn!(channel = %channel, error = %e, "http subscribe failed");
			(StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::fail(e.to_string()))
		}
	};
	api(status, &body, render)
}

fn unsubscribe_response(state: &AppState, raw: &str, render: Render) -> Response<HttpBody> {
	let Ok(channel) = ChannelName::new(raw) else {
		return missing_channel(render);
	};

	let body = match state.mux.release_channel(&channel) {
		UnsubscribeOutcome::Unsubscribed => {
			ApiResponse::ok(format!("Unsubscribed from IRC chat for channel {channel}"))
		}
		UnsubscribeOutcome::NotSubscribed => {
			ApiResponse::fail(format!("Not subscribed to IRC chat for channel {channel}"))
		}
	};
	api(StatusCode::OK, &body, render)
}

async fn send_response<B>(state: &AppState, req: Request<B>) -> Response<HttpBody>
where
	B: Body,
	B::Error: Into<BoxError>,
{
	let req = read_json::<SendRequest, _>(req).await.unwrap_or_default();
	let channel = ChannelName::new(req.channel.as_str()).ok();
	let (Some(channel), false) = (channel, req.message.trim().is_empty()) else {
		return api(
			StatusCode::BAD_REQUEST,
			&ApiResponse::fail("Missing channel or message"),
			Render::Json,
		);
	};

	match state.mux.send(&channel, &req.message).await {
		Ok(()) => {
			let bot = state.mux.registry().bot_username().unwrap_or_default();
			api(StatusCode::OK, &ApiResponse::ok(format!("Message sent as {bot}")), Render::Json)
		}
		Err(e) => {
			warn!(channel = %channel, error = %e, "http send failed");
			api(
				StatusCode::INTERNAL_SERVER_ERROR,
				&ApiResponse::fail(e.to_string()),
				Render::Json,
			)
		}
	}
}

#[derive(Clone, Copy)]
enum HelixQuery<'a> {
	User(&'a str),
	Stream(&'a str),
	TopGames,
}

async fn helix_response(state: &AppState, query: HelixQuery<'_>) -> Response<HttpBody> {
	let missing = match query {
		HelixQuery::User(name) if name.trim().is_empty() => Some("Username parameter is missing"),
		HelixQuery::Stream(name) if name.trim().is_empty() => Some("Streamer name parameter is missing"),
		_ => None,
	};
	if let Some(missing) = missing {
		return json(StatusCode::BAD_REQUEST, &serde_json::json!({ "error": missing }));
	}
	let Some(helix) = state.helix.as_deref() else {
		return json(
			StatusCode::INTERNAL_SERVER_ERROR,
			&serde_json::json!({ "error": "Helix API client is not configured" }),
		);
	};

	let result = match query {
		HelixQuery::User(name) => helix.user(name).await,
		HelixQuery::Stream(name) => helix.stream(name).await,
		HelixQuery::TopGames => helix.top_games().await,
	};

	match result {
		Ok(data) => json(StatusCode::OK, &data),
		Err(e) => {
			warn!(error = %e, "helix request failed");
			json(
				StatusCode::INTERNAL_SERVER_ERROR,
				&serde_json::json!({ "error": e.to_string() }),
			)
		}
	}
}

fn upgrade_socket<B>(mut req: Request<B>, mux: RelayMultiplexer) -> Response<HttpBody> {
	let is_upgrade = req
		.headers()
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned() else {
		return text(StatusCode::BAD_REQUEST, "expected a websocket upgrade");
	};
	if !is_upgrade {
		return text(StatusCode::BAD_REQUEST, "expected a websocket upgrade");
	}

	let on_upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				ws::serve_socket(mux, ws).await;
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = Response::new(empty());
	*resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	let headers = resp.headers_mut();
	headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
	headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
	if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
		headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
	}
	resp
}

fn missing_channel(render: Render) -> Response<HttpBody> {
	match render {
		Render::Json => api(
			StatusCode::BAD_REQUEST,
			&ApiResponse::fail("Missing channel name"),
			Render::Json,
		),
		Render::Html => text(StatusCode::BAD_REQUEST, "Missing channel name"),
	}
}

fn api(status: StatusCode, body: &ApiResponse, render: Render) -> Response<HttpBody> {
	match render {
		Render::Json => json(status, body),
		Render::Html => {
			let pretty = serde_json::to_string_pretty(body).unwrap_or_default();
			let html = format!("<pre style='{PRE_STYLE}'>{}</pre>", escape_html(&pretty));
			with_body(status, "text/html; charset=utf-8", Bytes::from(html))
		}
	}
}

fn json<T: serde::Serialize + ?Sized>(status: StatusCode, body: &T) -> Response<HttpBody> {
	let bytes = serde_json::to_vec(body).unwrap_or_default();
	with_body(status, "application/json", Bytes::from(bytes))
}

fn text(status: StatusCode, body: &'static str) -> Response<HttpBody> {
	with_body(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

fn with_body(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<HttpBody> {
	let mut resp = Response::new(Full::new(body).boxed_unsync());
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
	resp
}

fn empty() -> HttpBody {
	Full::new(Bytes::new()).boxed_unsync()
}

fn escape_html(s: &str) -> String {
	s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Bind the public listener.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, "http listener bound");
	Ok(listener)
}
