#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tandem_domain::{RemoteId, Server};
use tandem_platform::{DeviceProps, RemoteConnector, RemoteEvent, RemoteEventTx, RemoteHandle, RemoteSession, new_session_id};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::util::time::unix_now;

/// Dev-only connector whose sessions emit synthetic traffic.
pub struct DemoConnector {
	emit_interval: Duration,
}

impl Default for DemoConnector {
	fn default() -> Self {
		Self::new()
	}
}

impl DemoConnector {
	pub fn new() -> Self {
		Self {
			emit_interval: Duration::from_secs(5),
		}
	}

	/// Customize emit interval (useful for tests).
	#[allow(dead_code)]
	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}
}

struct DemoSession {
	account: RemoteId,
	session_id: String,
	emit_interval: Duration,
	events: RemoteEventTx,
	task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DemoSession {
	fn make_event(account: &RemoteId, tick: u64) -> RemoteEvent {
		// Every fourth tick reports the primary device instead of a message.
		if tick % 4 == 0 {
			return RemoteEvent::PhoneSeen { at: SystemTime::now() };
		}
		let contact = RemoteId::user(format!("demo{}", tick % 3 + 1));
		let chat = if tick % 2 == 0 {
			RemoteId::new("demo-group", Server::Group)
		} else {
			contact.clone()
		};
		debug!(%account, %chat, tick, "demo event");
		RemoteEvent::Message {
			chat,
			sender: contact,
			timestamp: unix_now(),
		}
	}

	async fn emit_loop(account: RemoteId, events: RemoteEventTx, emit_interval: Duration) {
		let mut interval: Interval = tokio::time::interval(emit_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		let mut tick: u64 = 0;

		loop {
			interval.tick().await;
			tick += 1;
			match events.try_send(Self::make_event(&account, tick)) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(%account, "demo session events channel full; dropping event");
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					debug!(%account, "demo session events channel closed");
					break;
				}
			}
		}
	}
}

#[async_trait]
impl RemoteSession for DemoSession {
	async fn connect(&self) -> anyhow::Result<()> {
		let mut task = self.task.lock();
		if task.as_ref().is_some_and(|t| !t.is_finished()) {
			return Ok(());
		}
		*task = Some(tokio::spawn(Self::emit_loop(
			self.account.clone(),
			self.events.clone(),
			self.emit_interval,
		)));
		info!(
			account = %self.account,
			session_id = %self.session_id,
			interval_ms = self.emit_interval.as_millis(),
			"demo session online"
		);
		Ok(())
	}

	async fn disconnect(&self) {
		if let Some(task) = self.task.lock().take() {
			task.abort();
			info!(account = %self.account, session_id = %self.session_id, "demo session offline");
		}
	}

	fn is_connected(&self) -> bool {
		self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
	}

	async fn ping_phone(&self) -> anyhow::Result<()> {
		self.events
			.try_send(RemoteEvent::PhoneSeen { at: SystemTime::now() })
			.map_err(|e| anyhow::anyhow!("demo ping: {e}"))
	}
}

impl Drop for DemoSession {
	fn drop(&mut self) {
		if let Some(task) = self.task.get_mut().take() {
			task.abort();
		}
	}
}

#[async_trait]
impl RemoteConnector for DemoConnector {
	async fn open(&self, account: &RemoteId, device: &DeviceProps) -> anyhow::Result<RemoteHandle> {
		info!(%account, os_name = %device.os_name, platform = device.platform.code(), "opening demo session");
		let (tx, rx) = mpsc::channel(64);
		let session = DemoSession {
			account: account.clone(),
			session_id: new_session_id(),
			emit_interval: self.emit_interval,
			events: tx,
			task: parking_lot::Mutex::new(None),
		};
		Ok(RemoteHandle {
			session: Arc::new(session),
			events: rx,
		})
	}
}
