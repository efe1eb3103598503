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
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::presence::PresenceRegistry;
use crate::server::router::GatewayCounters;
use crate::server::store::MessageStore;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	presence: PresenceRegistry,
	counters: Arc<GatewayCounters>,
	store: MessageStore,
}

#[derive(Serialize)]
struct StatusSnapshot {
	active_connections: usize,
	messages_total: u64,
	rate_limit_hits_total: u64,
	avg_response_us: u64,
	store_enabled: bool,
}

impl HealthState {
	pub fn new(presence: PresenceRegistry, counters: Arc<GatewayCounters>, store: MessageStore) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			presence,
			counters,
			store,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	async fn snapshot(&self) -> StatusSnapshot {
		StatusSnapshot {
			active_connections: self.presence.connection_count().await,
			messages_total: self.counters.messages_total.load(Ordering::Relaxed),
			rate_limit_hits_total: self.counters.rate_limit_hits_total.load(Ordering::Relaxed),
			avg_response_us: self.counters.avg_response_us(),
			store_enabled: self.store.is_enabled(),
		}
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
	if req.method() != Method::GET {
		return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let path = req.uri().path();
	match path {
		"/healthz" => Ok(plain(StatusCode::OK, Bytes::from_static(b"ok"))),
		"/readyz" => {
			if !state.is_ready() {
				return Ok(plain(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")));
			}

			if state.store.ping().await.is_err() {
				return Ok(plain(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"store-unavailable")));
			}

			Ok(plain(StatusCode::OK, Bytes::from_static(b"ready")))
		}
		"/statusz" => {
			let snapshot = state.snapshot().await;
			match serde_json::to_vec(&snapshot) {
				Ok(body) => Ok(Response::builder()
					.status(StatusCode::OK)
					.header("content-type", "application/json")
					.body(Full::new(Bytes::from(body)))
					.unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()))),
				Err(_) => Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())),
			}
		}
		_ => Ok(plain(StatusCode::NOT_FOUND, Bytes::new())),
	}
}

fn plain(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut response = Response::new(Full::new(body));
	*response.status_mut() = status;
	response
}
