#![forbid(unsafe_code)]

//! Top-level bridge object: owns the database, registry, activity tracker,
//! session manager and supervisor, and sequences their startup and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tandem_domain::ProtocolVersion;
use tandem_platform::{BridgeState, LocalNetwork, RemoteConnector, StateEvent, UpdateChecker};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::activity::{ActivitySnapshot, PuppetActivity};
use crate::bridge::http::{HttpHandle, HttpState, spawn_http_server};
use crate::bridge::registry::Registry;
use crate::bridge::session::{SessionManager, StartReport};
use crate::bridge::supervisor::{Supervisor, SupervisorHandle, check_protocol_version};
use crate::config::BridgeConfig;
use crate::db::Database;

/// Bound on how long shutdown waits for in-flight startup connects to unwind.
const START_BATCH_DRAIN: Duration = Duration::from_secs(10);

/// External collaborators the bridge is wired to.
pub struct BridgeDeps {
	pub connector: Arc<dyn RemoteConnector>,
	pub local: Arc<dyn LocalNetwork>,
	pub update_checker: Option<Arc<dyn UpdateChecker>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BridgeStatus {
	pub users: usize,
	pub connected: usize,
	pub activity: ActivitySnapshot,
}

#[derive(Default)]
struct Running {
	http: Option<HttpHandle>,
	supervisor: Option<SupervisorHandle>,
	start_batch: Option<JoinHandle<Option<StartReport>>>,
	version_check: Option<JoinHandle<()>>,
}

pub struct Bridge {
	config: BridgeConfig,
	db: Database,
	registry: Arc<Registry>,
	activity: Arc<PuppetActivity>,
	sessions: Arc<SessionManager>,
	supervisor: Arc<Supervisor>,
	local: Arc<dyn LocalNetwork>,
	update_checker: Option<Arc<dyn UpdateChecker>>,
	http_state: HttpState,
	running: tokio::sync::Mutex<Running>,
	last_report: parking_lot::Mutex<Option<StartReport>>,
}

/// Protocol version compiled into this binary.
pub fn compiled_protocol_version() -> anyhow::Result<ProtocolVersion> {
	ProtocolVersion::parse(env!("CARGO_PKG_VERSION")).context("parse crate version")
}

impl Bridge {
	/// Connect the database and load every persisted user and puppet.
	///
	/// Any failure here is fatal to startup.
	pub async fn init(
		config: BridgeConfig,
		deps: BridgeDeps,
		metrics: Option<PrometheusHandle>,
	) -> anyhow::Result<Arc<Self>> {
		let db = Database::connect(&config.database.url, config.database.max_connections)
			.await
			.context("open bridge database")?;

		let registry = Arc::new(Registry::new(db.clone()));
		let activity = Arc::new(PuppetActivity::new(db.puppets(), config.limits));
		let sessions = Arc::new(SessionManager::new(
			Arc::clone(&registry),
			Arc::clone(&deps.connector),
			Arc::clone(&deps.local),
			Arc::clone(&activity),
			config.remote.reconnect,
		)
		.with_device(config.remote.device()));
		let supervisor = Arc::new(Supervisor::new(
			Arc::clone(&registry),
			Arc::clone(&activity),
			Arc::clone(&deps.local),
			db.disappearing(),
			config.supervisor,
		));

		let users = registry.get_all_users().await?;
		let puppets = registry.get_all_puppets().await?;
		info!(users = users.len(), puppets = puppets.len(), "registry loaded");

		let http_state = HttpState::new(Arc::clone(&activity), metrics);

		Ok(Arc::new(Self {
			config,
			db,
			registry,
			activity,
			sessions,
			supervisor,
			local: deps.local,
			update_checker: deps.update_checker,
			http_state,
			running: tokio::sync::Mutex::new(Running::default()),
			last_report: parking_lot::Mutex::new(None),
		}))
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn sessions(&self) -> &Arc<SessionManager> {
		&self.sessions
	}

	pub fn is_ready(&self) -> bool {
		self.http_state.is_ready()
	}

	/// Address of the HTTP surface, once started.
	pub async fn http_addr(&self) -> Option<SocketAddr> {
		self.running.lock().await.http.as_ref().map(HttpHandle::local_addr)
	}

	/// Start background work. Returns once everything is spawned.
	pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
		let mut running = self.running.lock().await;
		self.local
			.send_bridge_state(None, BridgeState::new(StateEvent::Starting))
			.await;

		if let Some(bind) = self.config.server.http_bind.as_deref() {
			let addr: SocketAddr = bind
				.parse()
				.with_context(|| format!("invalid http bind address {bind:?} (expected host:port)"))?;
			running.http = Some(spawn_http_server(addr, self.http_state.clone()).await?);
		}

		if let Some(checker) = self.update_checker.clone() {
			match compiled_protocol_version() {
				Ok(current) => {
					running.version_check = Some(tokio::spawn(async move {
						check_protocol_version(checker.as_ref(), current).await;
					}));
				}
				Err(e) => warn!(error = %e, "skipping protocol version check"),
			}
		}

		let this = Arc::clone(self);
		running.start_batch = Some(tokio::spawn(async move {
			match this.sessions.start_all().await {
				Ok(report) => {
					*this.last_report.lock() = Some(report.clone());
					Some(report)
				}
				Err(e) => {
					error!(error = %e, "session startup failed");
					None
				}
			}
		}));

		let activity = Arc::clone(&self.activity);
		tokio::spawn(async move {
			if let Err(e) = activity.recompute().await {
				warn!(error = %e, "initial activity count failed");
			}
		});

		running.supervisor = Some(Arc::clone(&self.supervisor).spawn());

		self.http_state.mark_ready();
		self.local
			.send_bridge_state(None, BridgeState::new(StateEvent::Running))
			.await;
		info!("bridge started");
		Ok(())
	}

	/// Wait for the startup connect batch and return its report.
	pub async fn wait_for_startup(&self) -> Option<StartReport> {
		let batch = self.running.lock().await.start_batch.take();
		match batch {
			Some(handle) => match handle.await {
				Ok(report) => report,
				Err(e) => {
					if !e.is_cancelled() {
						warn!(error = %e, "startup batch ended abnormally");
					}
					None
				}
			},
			None => self.start_report(),
		}
	}

	/// Report of the finished startup batch, if any.
	pub fn start_report(&self) -> Option<StartReport> {
		self.last_report.lock().clone()
	}

	pub fn status(&self) -> BridgeStatus {
		let users = self.registry.loaded_users();
		BridgeStatus {
			users: users.len(),
			connected: users.iter().filter(|u| u.is_connected()).count(),
			activity: self.activity.snapshot(),
		}
	}

	/// Stop accepting sessions, stop background work, release sessions and the registry.
	pub async fn stop(&self) {
		info!("bridge stopping");
		self.sessions.stop_accepting();
		self.http_state.mark_not_ready();

		let running = std::mem::take(&mut *self.running.lock().await);

		if let Some(http) = running.http {
			http.stop();
		}
		if let Some(supervisor) = running.supervisor {
			supervisor.stop().await;
		}
		if let Some(check) = running.version_check {
			check.abort();
		}

		self.sessions.disconnect_all().await;

		// In-flight connects release their own transport once they see the Stopped slot.
		if let Some(mut batch) = running.start_batch {
			match tokio::time::timeout(START_BATCH_DRAIN, &mut batch).await {
				Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "startup batch ended abnormally"),
				Ok(_) => {}
				Err(_) => {
					warn!(timeout = ?START_BATCH_DRAIN, "startup batch still running at shutdown; aborting");
					batch.abort();
				}
			}
		}

		self.registry.clear();
		self.db.close().await;
		info!("bridge stopped");
	}
}
