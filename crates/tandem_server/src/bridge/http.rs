#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::activity::PuppetActivity;

/// Shared state behind `/healthz`, `/readyz`, `/metrics` and `/status`.
#[derive(Clone)]
pub struct HttpState {
	ready: Arc<AtomicBool>,
	activity: Arc<PuppetActivity>,
	metrics: Option<PrometheusHandle>,
}

impl HttpState {
	pub fn new(activity: Arc<PuppetActivity>, metrics: Option<PrometheusHandle>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			activity,
			metrics,
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
}

#[derive(Debug, Serialize)]
struct StatusBody {
	ready: bool,
	active_puppets: u32,
	max_puppets: u32,
	blocked: bool,
}

/// Running HTTP listener.
pub struct HttpHandle {
	addr: SocketAddr,
	task: JoinHandle<()>,
}

impl HttpHandle {
	pub fn local_addr(&self) -> SocketAddr {
		self.addr
	}

	pub fn stop(self) {
		self.task.abort();
		info!(addr = %self.addr, "http server stopped");
	}
}

/// Bind and serve in the background. Bind errors are returned to the caller.
pub async fn spawn_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<HttpHandle> {
	let listener = TcpListener::bind(bind).await?;
	let addr = listener.local_addr()?;
	let task = tokio::spawn(async move {
		if let Err(err) = run_http_server(listener, state).await {
			warn!(error = %err, "http server stopped");
		}
	});
	info!(%addr, "http server listening");
	Ok(HttpHandle { addr, task })
}

async fn run_http_server(listener: TcpListener, state: HttpState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let state = state.clone();
				async move { Ok::<_, hyper::Error>(route(req.method(), req.uri().path(), &state)) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
	resp
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

pub(crate) fn route(method: &Method, path: &str, state: &HttpState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return empty(StatusCode::METHOD_NOT_ALLOWED);
	}

	match path {
		"/healthz" => respond(StatusCode::OK, "text/plain", Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				respond(StatusCode::OK, "text/plain", Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", Bytes::from_static(b"not-ready"))
			}
		}
		"/metrics" => match &state.metrics {
			Some(handle) => respond(StatusCode::OK, "text/plain; version=0.0.4", handle.render()),
			None => empty(StatusCode::NOT_FOUND),
		},
		"/status" => {
			let snap = state.activity.snapshot();
			let body = StatusBody {
				ready: state.is_ready(),
				active_puppets: snap.current_count,
				max_puppets: snap.max_count,
				blocked: snap.is_blocked,
			};
			match serde_json::to_vec(&body) {
				Ok(json) => respond(StatusCode::OK, "application/json", json),
				Err(e) => {
					warn!(error = %e, "failed to encode status");
					empty(StatusCode::INTERNAL_SERVER_ERROR)
				}
			}
		}
		_ => empty(StatusCode::NOT_FOUND),
	}
}
