#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tandem_domain::RemoteId;
use tandem_platform::{DeviceProps, RemoteConnector, RemoteEventTx, RemoteHandle, RemoteSession, new_session_id};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Connector whose sessions connect and then stay idle.
#[derive(Debug, Default)]
pub struct NullConnector;

impl NullConnector {
	pub fn new() -> Self {
		Self
	}
}

struct NullSession {
	account: RemoteId,
	session_id: String,
	connected: AtomicBool,
	// Held so the event stream stays open until the session is dropped.
	_events: RemoteEventTx,
}

#[async_trait]
impl RemoteSession for NullSession {
	async fn connect(&self) -> anyhow::Result<()> {
		self.connected.store(true, Ordering::Relaxed);
		info!(account = %self.account, session_id = %self.session_id, "null session online");
		Ok(())
	}

	async fn disconnect(&self) {
		if self.connected.swap(false, Ordering::Relaxed) {
			info!(account = %self.account, session_id = %self.session_id, "null session offline");
		}
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	async fn ping_phone(&self) -> anyhow::Result<()> {
		debug!(account = %self.account, "ignored phone ping (null session)");
		Ok(())
	}
}

#[async_trait]
impl RemoteConnector for NullConnector {
	async fn open(&self, account: &RemoteId, device: &DeviceProps) -> anyhow::Result<RemoteHandle> {
		debug!(%account, os_name = %device.os_name, platform = device.platform.code(), "opening null session");
		let (tx, rx) = mpsc::channel(1);
		let session = NullSession {
			account: account.clone(),
			session_id: new_session_id(),
			connected: AtomicBool::new(false),
			_events: tx,
		};
		Ok(RemoteHandle {
			session: Arc::new(session),
			events: rx,
		})
	}
}
