#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tandem_domain::{LocalUserId, PortalKey, RemoteId};
use tandem_platform::{
	BridgeState, DeviceProps, LocalNetwork, ReconnectPolicy, RemoteConnector, RemoteEvent, RemoteEventRx, RemoteSession, StateEvent,
};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::bridge::activity::PuppetActivity;
use crate::bridge::registry::Registry;
use crate::bridge::user::User;

/// Per-user session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	/// No remote account yet.
	Unconfigured,
	Connecting,
	Connected,
	Reconnecting,
	/// Configured but idle (never connected, disconnected or retries exhausted).
	Disconnected,
	/// Shut down with the process.
	Stopped,
}

impl SessionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			SessionState::Unconfigured => "unconfigured",
			SessionState::Connecting => "connecting",
			SessionState::Connected => "connected",
			SessionState::Reconnecting => "reconnecting",
			SessionState::Disconnected => "disconnected",
			SessionState::Stopped => "stopped",
		}
	}

	fn is_active(self) -> bool {
		matches!(
			self,
			SessionState::Connecting | SessionState::Connected | SessionState::Reconnecting
		)
	}
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Transport and event task owned by one user. Guarded by the user's session lock.
pub(crate) struct SessionSlot {
	pub(crate) state: SessionState,
	pub(crate) session: Option<Arc<dyn RemoteSession>>,
	events_task: Option<JoinHandle<()>>,
	/// Bumped whenever the slot is torn down, so stale event tasks can tell.
	generation: u64,
}

impl SessionSlot {
	pub(crate) fn new(state: SessionState) -> Self {
		Self {
			state,
			session: None,
			events_task: None,
			generation: 0,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("user {0} has no remote account")]
	NotConfigured(LocalUserId),

	#[error("active puppet limit reached; new logins are blocked")]
	CapacityReached,

	#[error("bridge is shutting down")]
	ShuttingDown,

	#[error("connect cancelled by a concurrent disconnect")]
	Cancelled,

	#[error("remote transport: {0:#}")]
	Transport(anyhow::Error),

	#[error("persist session change: {0:#}")]
	Storage(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
	Connected,
	/// A connect was already in flight or done; nothing was started.
	AlreadyActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartFailure {
	pub id: String,
	pub error: String,
}

/// Outcome of the startup connect batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
	pub attempted: usize,
	pub connected: usize,
	pub failures: Vec<StartFailure>,
	pub custom_puppets_started: usize,
	pub custom_puppet_failures: Vec<StartFailure>,
	/// No user had a remote account.
	pub unconfigured: bool,
}

/// Owns one remote session per user.
pub struct SessionManager {
	registry: Arc<Registry>,
	connector: Arc<dyn RemoteConnector>,
	local: Arc<dyn LocalNetwork>,
	activity: Arc<PuppetActivity>,
	policy: ReconnectPolicy,
	device: DeviceProps,
	accepting: AtomicBool,
}

impl SessionManager {
	pub fn new(
		registry: Arc<Registry>,
		connector: Arc<dyn RemoteConnector>,
		local: Arc<dyn LocalNetwork>,
		activity: Arc<PuppetActivity>,
		policy: ReconnectPolicy,
	) -> Self {
		Self {
			registry,
			connector,
			local,
			activity,
			policy,
			device: DeviceProps::default(),
			accepting: AtomicBool::new(true),
		}
	}

	/// Device identity sent with every session the connector opens.
	pub fn with_device(mut self, device: DeviceProps) -> Self {
		self.device = device;
		self
	}

	pub fn is_accepting(&self) -> bool {
		self.accepting.load(Ordering::Acquire)
	}

	/// Refuse every later connect, login and reconnect attempt.
	pub fn stop_accepting(&self) {
		self.accepting.store(false, Ordering::Release);
	}

	/// Connect every configured user, then start custom puppets.
	pub async fn start_all(self: &Arc<Self>) -> anyhow::Result<StartReport> {
		let users = self.registry.get_all_users().await?;

		let mut configured = Vec::new();
		for user in users {
			if user.remote_id().await.is_some() {
				configured.push(user);
			}
		}

		let mut report = StartReport {
			attempted: configured.len(),
			unconfigured: configured.is_empty(),
			..StartReport::default()
		};

		if report.unconfigured {
			info!("no configured users; reporting unconfigured bridge state");
			self.local
				.send_bridge_state(None, BridgeState::new(StateEvent::Unconfigured))
				.await;
		}

		let mut set = JoinSet::new();
		for user in configured {
			let this = Arc::clone(self);
			set.spawn(async move {
				let result = this.connect(&user).await;
				(user.mxid().clone(), result)
			});
		}

		while let Some(joined) = set.join_next().await {
			match joined {
				Ok((_, Ok(_))) => report.connected += 1,
				Ok((mxid, Err(e))) => {
					warn!(user = %mxid, error = %e, "startup connect failed");
					report.failures.push(StartFailure {
						id: mxid.to_string(),
						error: e.to_string(),
					});
				}
				Err(e) => {
					error!(error = %e, "startup connect task failed");
					report.failures.push(StartFailure {
						id: "<task>".to_string(),
						error: e.to_string(),
					});
				}
			}
		}

		if self.is_accepting() {
			self.start_custom_puppets(&mut report).await;
		}

		info!(
			attempted = report.attempted,
			connected = report.connected,
			failed = report.failures.len(),
			custom_puppets = report.custom_puppets_started,
			"session startup finished"
		);
		Ok(report)
	}

	async fn start_custom_puppets(&self, report: &mut StartReport) {
		let puppets = match self.registry.get_all_puppets_with_custom_mxid().await {
			Ok(puppets) => puppets,
			Err(e) => {
				warn!(error = %e, "failed to load custom puppets");
				return;
			}
		};

		let mut set = JoinSet::new();
		for puppet in puppets {
			let Some(login) = puppet.custom_login().await else {
				continue;
			};
			let local = Arc::clone(&self.local);
			set.spawn(async move {
				let result = local.start_custom_puppet(&login).await;
				(login.remote_id, result)
			});
		}

		while let Some(joined) = set.join_next().await {
			match joined {
				Ok((_, Ok(()))) => report.custom_puppets_started += 1,
				Ok((remote, Err(e))) => {
					warn!(puppet = %remote, error = %e, "failed to start custom puppet");
					report.custom_puppet_failures.push(StartFailure {
						id: remote.to_string(),
						error: format!("{e:#}"),
					});
				}
				Err(e) => {
					error!(error = %e, "custom puppet start task failed");
					report.custom_puppet_failures.push(StartFailure {
						id: "<task>".to_string(),
						error: e.to_string(),
					});
				}
			}
		}
	}

	/// Open and connect the user's remote session.
	///
	/// A second call while a session is connecting or connected is a no-op.
	pub async fn connect(self: &Arc<Self>, user: &Arc<User>) -> Result<ConnectOutcome, SessionError> {
		if !self.is_accepting() {
			return Err(SessionError::ShuttingDown);
		}
		let remote = user
			.remote_id()
			.await
			.ok_or_else(|| SessionError::NotConfigured(user.mxid().clone()))?;

		{
			let mut slot = user.session.lock();
			if slot.state.is_active() {
				debug!(user = %user.mxid(), state = %slot.state, "connect ignored; session already active");
				return Ok(ConnectOutcome::AlreadyActive);
			}
			slot.state = SessionState::Connecting;
		}

		metrics::counter!("tandem_server_session_connects_total").increment(1);
		self.local
			.send_bridge_state(
				Some(user.mxid()),
				BridgeState::new(StateEvent::Connecting).with_remote(&remote),
			)
			.await;

		let handle = match self.connector.open(&remote, &self.device).await {
			Ok(handle) => handle,
			Err(e) => return Err(self.fail_connect(user, &remote, e).await),
		};
		if let Err(e) = handle.session.connect().await {
			handle.session.disconnect().await;
			return Err(self.fail_connect(user, &remote, e).await);
		}

		let session = Arc::clone(&handle.session);
		let installed = {
			let mut slot = user.session.lock();
			if slot.state == SessionState::Connecting {
				slot.state = SessionState::Connected;
				slot.session = Some(Arc::clone(&session));
				slot.generation += 1;
				let generation = slot.generation;
				let this = Arc::clone(self);
				let task_user = Arc::clone(user);
				let task_session = Arc::clone(&session);
				slot.events_task = Some(tokio::spawn(async move {
					this.run_events(task_user, task_session, handle.events, generation)
						.await;
				}));
				true
			} else {
				false
			}
		};

		if !installed {
			// Torn down (disconnect or shutdown) while the handshake was in flight.
			session.disconnect().await;
			return Err(if self.is_accepting() {
				SessionError::Cancelled
			} else {
				SessionError::ShuttingDown
			});
		}

		metrics::gauge!("tandem_server_sessions_connected").increment(1.0);
		info!(user = %user.mxid(), remote = %remote, "session connected");
		self.local
			.send_bridge_state(
				Some(user.mxid()),
				BridgeState::new(StateEvent::Connected).with_remote(&remote),
			)
			.await;
		Ok(ConnectOutcome::Connected)
	}

	async fn fail_connect(&self, user: &User, remote: &RemoteId, e: anyhow::Error) -> SessionError {
		{
			let mut slot = user.session.lock();
			if slot.state == SessionState::Connecting {
				slot.state = SessionState::Disconnected;
			}
		}
		metrics::counter!("tandem_server_session_connect_failures_total").increment(1);
		warn!(user = %user.mxid(), remote = %remote, error = %e, "session connect failed");
		self.local
			.send_bridge_state(
				Some(user.mxid()),
				BridgeState::new(StateEvent::UnknownError)
					.with_remote(remote)
					.with_error("connect-failed", format!("{e:#}")),
			)
			.await;
		SessionError::Transport(e)
	}

	/// Tear down the user's session. Safe to call on an idle user.
	pub async fn disconnect(&self, user: &User) -> bool {
		self.teardown(user, SessionState::Disconnected, true).await
	}

	/// Release the transport and move the slot to `target`.
	///
	/// `abort_events` is false when called from the event task itself.
	async fn teardown(&self, user: &User, target: SessionState, abort_events: bool) -> bool {
		let (session, task, was_connected) = {
			let mut slot = user.session.lock();
			let was_connected = slot.state == SessionState::Connected;
			slot.generation += 1;
			if slot.state != SessionState::Unconfigured || target == SessionState::Stopped {
				slot.state = target;
			}
			(slot.session.take(), slot.events_task.take(), was_connected)
		};

		if let Some(task) = task
			&& abort_events
		{
			task.abort();
		}

		let Some(session) = session else {
			return false;
		};
		session.disconnect().await;
		if was_connected {
			metrics::gauge!("tandem_server_sessions_connected").decrement(1.0);
		}
		debug!(user = %user.mxid(), state = %target, "session released");
		true
	}

	/// Attach a remote account to the user and connect it.
	///
	/// Refused while the active-puppet limit is exceeded.
	pub async fn login(self: &Arc<Self>, user: &Arc<User>, remote: RemoteId) -> Result<ConnectOutcome, SessionError> {
		if !self.is_accepting() {
			return Err(SessionError::ShuttingDown);
		}
		if self.activity.is_blocked() {
			metrics::counter!("tandem_server_logins_refused_total").increment(1);
			warn!(user = %user.mxid(), "login refused; active puppet limit reached");
			return Err(SessionError::CapacityReached);
		}

		if user.remote_id().await.as_ref() != Some(&remote) {
			self.disconnect(user).await;
			self.registry
				.set_user_remote(user, Some(remote.clone()))
				.await
				.map_err(SessionError::Storage)?;
			let mut slot = user.session.lock();
			if slot.state == SessionState::Unconfigured {
				slot.state = SessionState::Disconnected;
			}
		}

		info!(user = %user.mxid(), remote = %remote, "login");
		self.connect(user).await
	}

	/// Disconnect, forget the remote account, and report the logout.
	pub async fn logout(&self, user: &Arc<User>) -> Result<(), SessionError> {
		self.forget_remote(user, true).await
	}

	async fn forget_remote(&self, user: &Arc<User>, abort_events: bool) -> Result<(), SessionError> {
		let remote = user.remote_id().await;
		self.teardown(user, SessionState::Disconnected, abort_events).await;
		self.registry
			.set_user_remote(user, None)
			.await
			.map_err(SessionError::Storage)?;
		user.session.lock().state = SessionState::Unconfigured;

		let mut state = BridgeState::new(StateEvent::LoggedOut);
		if let Some(remote) = &remote {
			state = state.with_remote(remote);
		}
		self.local.send_bridge_state(Some(user.mxid()), state).await;
		info!(user = %user.mxid(), "logged out");
		Ok(())
	}

	/// Stop every loaded user's session (shutdown).
	pub async fn disconnect_all(&self) {
		let users = self.registry.loaded_users();
		let released = futures::future::join_all(
			users
				.iter()
				.map(|user| self.teardown(user, SessionState::Stopped, true)),
		)
		.await;
		let count = released.into_iter().filter(|r| *r).count();
		info!(sessions = count, "sessions stopped");
	}

	async fn run_events(
		self: Arc<Self>,
		user: Arc<User>,
		session: Arc<dyn RemoteSession>,
		mut events: RemoteEventRx,
		generation: u64,
	) {
		let Some(remote) = user.remote_id().await else {
			return;
		};

		while let Some(event) = events.recv().await {
			match event {
				RemoteEvent::Message { chat, sender, timestamp } => {
					self.handle_message(&remote, chat, sender, timestamp).await;
				}
				RemoteEvent::Presence {
					sender,
					available,
					last_seen,
				} => {
					let this = Arc::clone(&self);
					tokio::spawn(async move {
						this.forward_presence(sender, available, last_seen).await;
					});
				}
				RemoteEvent::PhoneSeen { at } => {
					user.mark_phone_seen(DateTime::<Utc>::from(at)).await;
				}
				RemoteEvent::Disconnected { error } => {
					if !self.reconnect(&user, &session, generation, &error).await {
						break;
					}
				}
				RemoteEvent::LoggedOut { reason } => {
					info!(user = %user.mxid(), %reason, "remote network ended the session");
					if let Err(e) = self.forget_remote(&user, false).await {
						warn!(user = %user.mxid(), error = %e, "failed to record remote logout");
					}
					break;
				}
			}
		}

		let orphaned = {
			let mut slot = user.session.lock();
			if slot.generation == generation && slot.state.is_active() {
				let was_connected = slot.state == SessionState::Connected;
				slot.state = SessionState::Disconnected;
				slot.generation += 1;
				drop(slot.events_task.take());
				slot.session.take().map(|s| (s, was_connected))
			} else {
				None
			}
		};
		if let Some((session, was_connected)) = orphaned {
			session.disconnect().await;
			if was_connected {
				metrics::gauge!("tandem_server_sessions_connected").decrement(1.0);
			}
			warn!(user = %user.mxid(), "event stream ended; session released");
		}
		debug!(user = %user.mxid(), "event stream closed");
	}

	async fn handle_message(&self, account: &RemoteId, chat: RemoteId, sender: RemoteId, timestamp: i64) {
		let key = PortalKey::new(chat, account.clone());
		if let Err(e) = self.registry.get_or_create_portal(&key).await {
			warn!(portal = %key, error = %e, "failed to resolve portal");
		}

		match self.registry.get_or_create_puppet(&sender).await {
			Ok(Some(puppet)) => puppet.update_activity_ts(timestamp).await,
			Ok(None) => debug!(sender = %sender, "message from non-user sender"),
			Err(e) => warn!(sender = %sender, error = %e, "failed to resolve puppet"),
		}
	}

	async fn forward_presence(&self, sender: RemoteId, available: bool, last_seen: Option<SystemTime>) {
		let puppet = match self.registry.get_or_create_puppet(&sender).await {
			Ok(Some(puppet)) => puppet,
			Ok(None) => return,
			Err(e) => {
				warn!(sender = %sender, error = %e, "failed to resolve presence puppet");
				return;
			}
		};
		if !puppet.enable_presence().await {
			return;
		}
		if let Err(e) = self.local.send_presence(puppet.remote_id(), available, last_seen).await {
			debug!(puppet = %sender, error = %e, "failed to forward presence");
		}
	}

	/// Retry the transport with bounded backoff. Returns false once the session is gone.
	async fn reconnect(&self, user: &User, session: &Arc<dyn RemoteSession>, generation: u64, error: &str) -> bool {
		{
			let mut slot = user.session.lock();
			if slot.generation != generation || slot.state != SessionState::Connected {
				return false;
			}
			slot.state = SessionState::Reconnecting;
		}
		metrics::gauge!("tandem_server_sessions_connected").decrement(1.0);
		warn!(user = %user.mxid(), %error, "session dropped; reconnecting");
		self.local
			.send_bridge_state(
				Some(user.mxid()),
				BridgeState::new(StateEvent::TransientDisconnect).with_error("transport-dropped", error),
			)
			.await;

		for attempt in 1..=self.policy.max_attempts {
			tokio::time::sleep(self.policy.delay_for(attempt)).await;

			if !self.is_accepting() || !self.still_reconnecting(user, generation) {
				return false;
			}

			metrics::counter!("tandem_server_session_reconnect_attempts_total").increment(1);
			match session.connect().await {
				Ok(()) => {
					let resumed = {
						let mut slot = user.session.lock();
						let ok = slot.generation == generation && slot.state == SessionState::Reconnecting;
						if ok {
							slot.state = SessionState::Connected;
						}
						ok
					};
					if !resumed {
						return false;
					}
					metrics::gauge!("tandem_server_sessions_connected").increment(1.0);
					info!(user = %user.mxid(), attempt, "session reconnected");
					self.local
						.send_bridge_state(Some(user.mxid()), BridgeState::new(StateEvent::Connected))
						.await;
					return true;
				}
				Err(e) => {
					debug!(user = %user.mxid(), attempt, error = %e, "reconnect attempt failed");
				}
			}
		}

		let gave_up = {
			let mut slot = user.session.lock();
			let ours = slot.generation == generation && slot.state == SessionState::Reconnecting;
			if ours {
				slot.state = SessionState::Disconnected;
				slot.session = None;
				slot.generation += 1;
				// The handle belongs to this task; dropping it detaches.
				drop(slot.events_task.take());
			}
			ours
		};
		if gave_up {
			session.disconnect().await;
			error!(
				user = %user.mxid(),
				attempts = self.policy.max_attempts,
				"reconnect attempts exhausted"
			);
			self.local
				.send_bridge_state(
					Some(user.mxid()),
					BridgeState::new(StateEvent::UnknownError)
						.with_error("reconnect-exhausted", "reconnect attempts exhausted"),
				)
				.await;
		}
		false
	}

	fn still_reconnecting(&self, user: &User, generation: u64) -> bool {
		let slot = user.session.lock();
		slot.generation == generation && slot.state == SessionState::Reconnecting
	}
}
