#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::registry::ConnectionRegistry;

/// Liveness/readiness flags plus a view of the relay for `/readyz` detail.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	registry: Option<Arc<ConnectionRegistry>>,
}

impl HealthState {
	pub fn new(registry: Option<Arc<ConnectionRegistry>>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			registry,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	fn channels(&self) -> usize {
		self.registry.as_ref().map_or(0, |r| r.len())
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(health_response(req.method(), req.uri().path(), &state))
}

pub(crate) fn health_response(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => respond(
			StatusCode::OK,
			Bytes::from(format!("ready channels={}", state.channels())),
		),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readyz_follows_the_ready_flag() {
		let state = HealthState::new(None);
		let resp = health_response(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let resp = health_response(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::OK);

		state.mark_not_ready();
		let resp = health_response(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[test]
	fn healthz_and_unknown_paths() {
		let state = HealthState::new(None);
		assert_eq!(health_response(&Method::GET, "/healthz", &state).status(), StatusCode::OK);
		assert_eq!(health_response(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(health_response(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}
}
