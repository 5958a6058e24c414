#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_domain::{LocalRoomId, LocalUserId, RemoteId};
use tandem_platform::{
	BridgeState, CustomPuppetLogin, DeviceProps, LocalNetwork, ReconnectPolicy, RemoteConnector, RemoteEvent, RemoteEventTx,
	RemoteHandle, RemoteSession, StateEvent,
};
use tokio::sync::mpsc;

use crate::config::LimitSettings;
use crate::db::Database;

pub(crate) async fn memory_db() -> Database {
	Database::connect("sqlite::memory:", 1).await.expect("connect in-memory sqlite")
}

pub(crate) fn local_user(localpart: &str) -> LocalUserId {
	LocalUserId::new(format!("@{localpart}:local.test")).expect("valid local user id")
}

pub(crate) fn room(opaque: &str) -> LocalRoomId {
	LocalRoomId::new(format!("!{opaque}:local.test")).expect("valid room id")
}

pub(crate) fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
	ReconnectPolicy {
		min_delay: Duration::from_millis(5),
		max_delay: Duration::from_millis(20),
		max_attempts,
	}
}

pub(crate) fn unlimited() -> LimitSettings {
	LimitSettings::default()
}

/// Poll `f` until it holds or the timeout elapses.
pub(crate) async fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
	let start = tokio::time::Instant::now();
	while start.elapsed() < timeout {
		if f() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	f()
}

pub(crate) struct FakeSession {
	connected: AtomicBool,
	connects: AtomicU32,
	disconnects: AtomicU32,
	pings: AtomicU32,
	connect_delay: Duration,
	/// Upcoming `connect` calls that fail.
	fail_remaining: AtomicU32,
	events: RemoteEventTx,
}

impl FakeSession {
	pub(crate) fn connects(&self) -> u32 {
		self.connects.load(Ordering::SeqCst)
	}

	pub(crate) fn disconnects(&self) -> u32 {
		self.disconnects.load(Ordering::SeqCst)
	}

	pub(crate) fn pings(&self) -> u32 {
		self.pings.load(Ordering::SeqCst)
	}

	pub(crate) fn is_connected_now(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	pub(crate) fn fail_next_connects(&self, n: u32) {
		self.fail_remaining.store(n, Ordering::SeqCst);
	}

	pub(crate) async fn emit(&self, event: RemoteEvent) {
		self.events.send(event).await.expect("event stream open");
	}
}

#[async_trait]
impl RemoteSession for FakeSession {
	async fn connect(&self) -> anyhow::Result<()> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		if !self.connect_delay.is_zero() {
			tokio::time::sleep(self.connect_delay).await;
		}
		let failing = self
			.fail_remaining
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if failing {
			anyhow::bail!("scripted connect failure");
		}
		self.connected.store(true, Ordering::SeqCst);
		Ok(())
	}

	async fn disconnect(&self) {
		self.disconnects.fetch_add(1, Ordering::SeqCst);
		self.connected.store(false, Ordering::SeqCst);
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	async fn ping_phone(&self) -> anyhow::Result<()> {
		self.pings.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

/// Connector with scripted per-account failures.
#[derive(Default)]
pub(crate) struct FakeConnector {
	open_delay: Duration,
	connect_delay: Duration,
	fail_open: Mutex<HashSet<String>>,
	sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
	opens: AtomicU32,
	last_device: Mutex<Option<DeviceProps>>,
}

impl FakeConnector {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
		self.open_delay = delay;
		self
	}

	/// Delay each session's handshake.
	pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
		self.connect_delay = delay;
		self
	}

	pub(crate) fn fail_open_for(&self, remote_user: &str) {
		self.fail_open.lock().insert(remote_user.to_string());
	}

	/// Most recently opened session for the account.
	pub(crate) fn session(&self, remote_user: &str) -> Option<Arc<FakeSession>> {
		self.sessions.lock().get(remote_user).cloned()
	}

	pub(crate) fn opens(&self) -> u32 {
		self.opens.load(Ordering::SeqCst)
	}

	pub(crate) fn last_device(&self) -> Option<DeviceProps> {
		self.last_device.lock().clone()
	}
}

#[async_trait]
impl RemoteConnector for FakeConnector {
	async fn open(&self, account: &RemoteId, device: &DeviceProps) -> anyhow::Result<RemoteHandle> {
		self.opens.fetch_add(1, Ordering::SeqCst);
		*self.last_device.lock() = Some(device.clone());
		if !self.open_delay.is_zero() {
			tokio::time::sleep(self.open_delay).await;
		}
		if self.fail_open.lock().contains(&account.user) {
			anyhow::bail!("scripted open failure for {account}");
		}

		let (tx, rx) = mpsc::channel(16);
		let session = Arc::new(FakeSession {
			connected: AtomicBool::new(false),
			connects: AtomicU32::new(0),
			disconnects: AtomicU32::new(0),
			pings: AtomicU32::new(0),
			connect_delay: self.connect_delay,
			fail_remaining: AtomicU32::new(0),
			events: tx,
		});
		self.sessions
			.lock()
			.insert(account.user.clone(), Arc::clone(&session));
		Ok(RemoteHandle { session, events: rx })
	}
}

/// Local-network sink that records every call.
#[derive(Default)]
pub(crate) struct RecordingSink {
	pub(crate) states: Mutex<Vec<(Option<LocalUserId>, StateEvent)>>,
	pub(crate) notices: Mutex<Vec<(LocalUserId, Option<LocalRoomId>, String)>>,
	pub(crate) redactions: Mutex<Vec<(LocalRoomId, String)>>,
	pub(crate) presence: Mutex<Vec<(RemoteId, bool)>>,
	pub(crate) custom_puppets: Mutex<Vec<RemoteId>>,
	pub(crate) fail_custom_puppets: AtomicBool,
	pub(crate) fail_notices: AtomicBool,
}

impl RecordingSink {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn states_for(&self, user: Option<&LocalUserId>) -> Vec<StateEvent> {
		self.states
			.lock()
			.iter()
			.filter(|(u, _)| u.as_ref() == user)
			.map(|(_, s)| *s)
			.collect()
	}

	pub(crate) fn notice_count(&self) -> usize {
		self.notices.lock().len()
	}
}

#[async_trait]
impl LocalNetwork for RecordingSink {
	async fn send_bridge_state(&self, user: Option<&LocalUserId>, state: BridgeState) {
		self.states.lock().push((user.cloned(), state.state_event));
	}

	async fn send_presence(&self, puppet: &RemoteId, available: bool, _last_seen: Option<SystemTime>) -> anyhow::Result<()> {
		self.presence.lock().push((puppet.clone(), available));
		Ok(())
	}

	async fn send_notice(&self, user: &LocalUserId, room: Option<&LocalRoomId>, text: &str) -> anyhow::Result<()> {
		if self.fail_notices.load(Ordering::SeqCst) {
			anyhow::bail!("scripted notice failure");
		}
		self.notices
			.lock()
			.push((user.clone(), room.cloned(), text.to_string()));
		Ok(())
	}

	async fn redact(&self, room: &LocalRoomId, event_id: &str) -> anyhow::Result<()> {
		self.redactions.lock().push((room.clone(), event_id.to_string()));
		Ok(())
	}

	async fn start_custom_puppet(&self, login: &CustomPuppetLogin) -> anyhow::Result<()> {
		if self.fail_custom_puppets.load(Ordering::SeqCst) {
			anyhow::bail!("scripted custom puppet failure");
		}
		self.custom_puppets.lock().push(login.remote_id.clone());
		Ok(())
	}
}
