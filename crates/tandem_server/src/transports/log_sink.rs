#![forbid(unsafe_code)]

use std::time::SystemTime;

use async_trait::async_trait;
use tandem_domain::{LocalRoomId, LocalUserId, RemoteId};
use tandem_platform::{BridgeState, CustomPuppetLogin, LocalNetwork};
use tracing::{debug, info};

/// Local-network sink that only logs what it is asked to do.
#[derive(Debug, Default)]
pub struct LoggingLocalNetwork;

impl LoggingLocalNetwork {
	pub fn new() -> Self {
		Self
	}
}

#[async_trait]
impl LocalNetwork for LoggingLocalNetwork {
	async fn send_bridge_state(&self, user: Option<&LocalUserId>, state: BridgeState) {
		match user {
			Some(user) => info!(%user, state = %state.state_event, error = ?state.error, "bridge state"),
			None => info!(state = %state.state_event, "global bridge state"),
		}
	}

	async fn send_presence(&self, puppet: &RemoteId, available: bool, last_seen: Option<SystemTime>) -> anyhow::Result<()> {
		debug!(%puppet, available, has_last_seen = last_seen.is_some(), "presence");
		Ok(())
	}

	async fn send_notice(&self, user: &LocalUserId, room: Option<&LocalRoomId>, text: &str) -> anyhow::Result<()> {
		match room {
			Some(room) => info!(%user, %room, %text, "notice"),
			None => info!(%user, %text, "notice (no management room)"),
		}
		Ok(())
	}

	async fn redact(&self, room: &LocalRoomId, event_id: &str) -> anyhow::Result<()> {
		info!(%room, event_id, "redact");
		Ok(())
	}

	async fn start_custom_puppet(&self, login: &CustomPuppetLogin) -> anyhow::Result<()> {
		info!(puppet = %login.remote_id, local = %login.local_id, "custom puppet started");
		Ok(())
	}
}
