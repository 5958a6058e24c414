#![forbid(unsafe_code)]

pub mod backoff;
pub mod update;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tandem_domain::{DevicePlatform, LocalRoomId, LocalUserId, RemoteId};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use backoff::{ReconnectPolicy, backoff_delay};
pub use update::{HttpUpdateChecker, UpdateChecker, UpdateInfo, VersionStatus};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Remote transport → bridge event.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
	/// A message was seen in a chat.
	Message {
		chat: RemoteId,
		sender: RemoteId,
		/// Unix seconds as reported by the remote network.
		timestamp: i64,
	},

	/// Contact presence changed.
	Presence {
		sender: RemoteId,
		available: bool,
		last_seen: Option<SystemTime>,
	},

	/// The account's primary device answered.
	PhoneSeen { at: SystemTime },

	/// Transport dropped unexpectedly.
	Disconnected { error: String },

	/// Remote network revoked the session.
	LoggedOut { reason: String },
}

pub type RemoteEventTx = mpsc::Sender<RemoteEvent>;
pub type RemoteEventRx = mpsc::Receiver<RemoteEvent>;

/// One authenticated remote-network session.
#[async_trait::async_trait]
pub trait RemoteSession: Send + Sync + 'static {
	/// Establish (or re-establish) the transport.
	async fn connect(&self) -> anyhow::Result<()>;

	/// Tear down the transport. Must be safe to call repeatedly.
	async fn disconnect(&self);

	fn is_connected(&self) -> bool;

	/// Ask the primary device to answer (best-effort liveness probe).
	async fn ping_phone(&self) -> anyhow::Result<()>;
}

/// Session plus the event stream it feeds.
pub struct RemoteHandle {
	pub session: Arc<dyn RemoteSession>,
	pub events: RemoteEventRx,
}

impl fmt::Debug for RemoteHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RemoteHandle")
			.field("connected", &self.session.is_connected())
			.finish_non_exhaustive()
	}
}

/// How the bridge presents itself on the primary device's linked-devices list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProps {
	pub os_name: String,
	pub platform: DevicePlatform,
}

impl Default for DeviceProps {
	fn default() -> Self {
		Self {
			os_name: "Tandem bridge".to_string(),
			platform: DevicePlatform::Unknown,
		}
	}
}

/// Factory for remote sessions.
#[async_trait::async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
	/// Build a (not yet connected) session for the given account, registered as `device`.
	async fn open(&self, account: &RemoteId, device: &DeviceProps) -> anyhow::Result<RemoteHandle>;
}

/// Bridge state reported to the local network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateEvent {
	Starting,
	Unconfigured,
	Running,
	Connecting,
	Connected,
	TransientDisconnect,
	BadCredentials,
	UnknownError,
	LoggedOut,
}

impl StateEvent {
	pub const fn as_str(self) -> &'static str {
		match self {
			StateEvent::Starting => "STARTING",
			StateEvent::Unconfigured => "UNCONFIGURED",
			StateEvent::Running => "RUNNING",
			StateEvent::Connecting => "CONNECTING",
			StateEvent::Connected => "CONNECTED",
			StateEvent::TransientDisconnect => "TRANSIENT_DISCONNECT",
			StateEvent::BadCredentials => "BAD_CREDENTIALS",
			StateEvent::UnknownError => "UNKNOWN_ERROR",
			StateEvent::LoggedOut => "LOGGED_OUT",
		}
	}
}

impl fmt::Display for StateEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Bridge state payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeState {
	pub state_event: StateEvent,
	pub timestamp: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remote_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

impl BridgeState {
	pub fn new(state_event: StateEvent) -> Self {
		let timestamp = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0);
		Self {
			state_event,
			timestamp,
			remote_id: None,
			error: None,
			message: None,
		}
	}

	pub fn with_remote(mut self, remote: &RemoteId) -> Self {
		self.remote_id = Some(remote.to_string());
		self
	}

	pub fn with_error(mut self, error: impl Into<String>, message: impl Into<String>) -> Self {
		self.error = Some(error.into());
		self.message = Some(message.into());
		self
	}
}

/// Credentials of a puppet that also controls its own local-network account.
#[derive(Debug, Clone)]
pub struct CustomPuppetLogin {
	pub remote_id: RemoteId,
	pub local_id: LocalUserId,
	pub access_token: SecretString,
	pub next_batch: String,
}

/// Local-network side of the bridge.
#[async_trait::async_trait]
pub trait LocalNetwork: Send + Sync + 'static {
	/// Report bridge state, globally (`user == None`) or for one account.
	async fn send_bridge_state(&self, user: Option<&LocalUserId>, state: BridgeState);

	/// Mirror a remote contact's presence onto its puppet.
	async fn send_presence(&self, puppet: &RemoteId, available: bool, last_seen: Option<SystemTime>) -> anyhow::Result<()>;

	/// Send a bot notice to a user (management room if known).
	async fn send_notice(&self, user: &LocalUserId, room: Option<&LocalRoomId>, text: &str) -> anyhow::Result<()>;

	/// Redact a bridged event.
	async fn redact(&self, room: &LocalRoomId, event_id: &str) -> anyhow::Result<()>;

	/// Validate and start syncing a double-puppeted account.
	async fn start_custom_puppet(&self, login: &CustomPuppetLogin) -> anyhow::Result<()>;
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
