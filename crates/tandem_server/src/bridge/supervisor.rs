#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_domain::ProtocolVersion;
use tandem_platform::{LocalNetwork, UpdateChecker, VersionStatus};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::bridge::activity::PuppetActivity;
use crate::bridge::registry::Registry;
use crate::config::SupervisorSettings;
use crate::db::{DisappearingMessage, DisappearingQuery};

/// Minimum gap between two pings of the same phone.
const PHONE_PING_COOLDOWN: Duration = Duration::from_secs(10 * 60 * 60);

/// Periodic housekeeping and health checks.
pub struct Supervisor {
	registry: Arc<Registry>,
	activity: Arc<PuppetActivity>,
	local: Arc<dyn LocalNetwork>,
	disappearing: DisappearingQuery,
	settings: SupervisorSettings,
	/// Sleepers for messages that expire before the next cycle.
	pending_redactions: parking_lot::Mutex<JoinSet<()>>,
}

/// Running supervisor task.
pub struct SupervisorHandle {
	shutdown: watch::Sender<bool>,
	task: JoinHandle<()>,
	supervisor: Arc<Supervisor>,
}

impl SupervisorHandle {
	pub async fn stop(self) {
		let _ = self.shutdown.send(true);
		if let Err(e) = self.task.await
			&& !e.is_cancelled()
		{
			warn!(error = %e, "supervisor task ended abnormally");
		}
		self.supervisor.pending_redactions.lock().abort_all();
		debug!("supervisor stopped");
	}
}

fn chrono_duration(d: Duration) -> chrono::Duration {
	chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl Supervisor {
	pub fn new(
		registry: Arc<Registry>,
		activity: Arc<PuppetActivity>,
		local: Arc<dyn LocalNetwork>,
		disappearing: DisappearingQuery,
		settings: SupervisorSettings,
	) -> Self {
		Self {
			registry,
			activity,
			local,
			disappearing,
			settings,
			pending_redactions: parking_lot::Mutex::new(JoinSet::new()),
		}
	}

	pub fn spawn(self: Arc<Self>) -> SupervisorHandle {
		let (shutdown, rx) = watch::channel(false);
		let this = Arc::clone(&self);
		let task = tokio::spawn(async move { this.run(rx).await });
		SupervisorHandle {
			shutdown,
			task,
			supervisor: self,
		}
	}

	async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		info!(interval_secs = self.settings.interval.as_secs(), "supervisor started");
		self.housekeep_disappearing(Utc::now()).await;

		let mut ticker = tokio::time::interval(self.settings.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// The first tick completes immediately and housekeeping already ran.
		ticker.tick().await;

		loop {
			tokio::select! {
				_ = ticker.tick() => self.run_cycle(Utc::now()).await,
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				}
			}
		}
	}

	/// One supervisory pass.
	pub async fn run_cycle(&self, now: DateTime<Utc>) {
		self.housekeep_disappearing(now).await;
		let warned = self.warn_users_about_disconnection(now).await;
		let pinged = self.ping_stale_phones(now).await;
		if let Err(e) = self.activity.recompute().await {
			debug!(error = %e, "activity recount skipped this cycle");
		}
		debug!(warned, pinged, "supervisor cycle finished");
	}

	/// Redact due messages now and schedule those expiring before the next cycle.
	pub async fn housekeep_disappearing(&self, now: DateTime<Utc>) -> usize {
		{
			let mut pending = self.pending_redactions.lock();
			while pending.try_join_next().is_some() {}
		}

		let horizon = now + chrono_duration(self.settings.interval);
		let upcoming = match self.disappearing.get_upcoming(horizon).await {
			Ok(rows) => rows,
			Err(e) => {
				warn!(error = %e, "failed to load disappearing messages");
				return 0;
			}
		};

		let mut redacted = 0;
		for msg in upcoming {
			let due_in = msg
				.expire_at
				.map(|at| at.signed_duration_since(now))
				.and_then(|d| d.to_std().ok())
				.unwrap_or_default();
			if due_in.is_zero() {
				if redact_expired(self.local.as_ref(), &self.disappearing, &msg).await {
					redacted += 1;
				}
			} else {
				let local = Arc::clone(&self.local);
				let disappearing = self.disappearing.clone();
				self.pending_redactions.lock().spawn(async move {
					tokio::time::sleep(due_in).await;
					redact_expired(local.as_ref(), &disappearing, &msg).await;
				});
			}
		}
		redacted
	}

	/// Warn connected users whose phone has been silent too long, once per stale period.
	pub async fn warn_users_about_disconnection(&self, now: DateTime<Utc>) -> usize {
		let grace = self.settings.phone_offline_warning;
		let hours = grace.as_secs() / 3600;

		let mut sends = JoinSet::new();
		for user in self.registry.loaded_users() {
			if !user.is_connected() || user.phone_recently_seen(grace, now).await {
				continue;
			}
			if !user.claim_phone_warning() {
				continue;
			}
			let local = Arc::clone(&self.local);
			sends.spawn(async move {
				let room = user.management_room().await;
				let text = format!(
					"Your phone hasn't been seen in over {hours} hours. The bridge is currently connected, \
					but will get disconnected if you don't open the app soon."
				);
				match local.send_notice(user.mxid(), room.as_ref(), &text).await {
					Ok(()) => true,
					Err(e) => {
						warn!(user = %user.mxid(), error = %e, "failed to send phone offline warning");
						user.release_phone_warning();
						false
					}
				}
			});
		}

		let mut warned = 0;
		while let Some(res) = sends.join_next().await {
			if matches!(res, Ok(true)) {
				warned += 1;
			}
		}
		if warned > 0 {
			metrics::counter!("tandem_server_phone_warnings_total").increment(warned as u64);
			info!(warned, "sent phone offline warnings");
		}
		warned
	}

	/// Ping phones that went quiet, at most once per cooldown.
	pub async fn ping_stale_phones(&self, now: DateTime<Utc>) -> usize {
		let ping_after = chrono_duration(self.settings.phone_ping_interval);
		let cooldown = chrono_duration(PHONE_PING_COOLDOWN);

		let mut pinged = 0;
		for user in self.registry.loaded_users() {
			if !user.is_connected() {
				continue;
			}
			let row = user.snapshot().await;
			let Some(seen) = row.phone_last_seen else {
				continue;
			};
			if now.signed_duration_since(seen) <= ping_after {
				continue;
			}
			if row
				.phone_last_pinged
				.is_some_and(|at| now.signed_duration_since(at) <= cooldown)
			{
				continue;
			}
			let Some(session) = user.remote_session() else {
				continue;
			};

			if let Err(e) = session.ping_phone().await {
				debug!(user = %user.mxid(), error = %e, "phone ping failed");
				continue;
			}
			if let Err(e) = user.update(|row| row.phone_last_pinged = Some(now)).await {
				warn!(user = %user.mxid(), error = %e, "failed to persist phone_last_pinged");
			}
			pinged += 1;
		}
		pinged
	}
}

async fn redact_expired(local: &dyn LocalNetwork, disappearing: &DisappearingQuery, msg: &DisappearingMessage) -> bool {
	if let Err(e) = local.redact(&msg.room_id, &msg.event_id).await {
		warn!(room = %msg.room_id, event = %msg.event_id, error = %e, "failed to redact disappearing message");
		return false;
	}
	if let Err(e) = disappearing.delete(&msg.room_id, &msg.event_id).await {
		warn!(room = %msg.room_id, event = %msg.event_id, error = %e, "failed to delete disappearing message");
	}
	metrics::counter!("tandem_server_disappearing_redactions_total").increment(1);
	debug!(room = %msg.room_id, event = %msg.event_id, "redacted disappearing message");
	true
}

/// Compare the compiled protocol version against upstream. Never fails.
pub async fn check_protocol_version(checker: &dyn UpdateChecker, current: ProtocolVersion) -> Option<VersionStatus> {
	let info = match checker.check_update(current).await {
		Ok(info) => info,
		Err(e) => {
			warn!(error = %e, "failed to check for protocol updates");
			return None;
		}
	};

	let status = VersionStatus::classify(current, &info);
	let latest = info.version;
	match status {
		VersionStatus::Current => debug!(%current, "protocol version is current"),
		VersionStatus::Ahead => info!(%current, %latest, "protocol version is newer than upstream"),
		VersionStatus::Outdated => info!(%current, %latest, "protocol version is outdated"),
		VersionStatus::SoftOutdated => warn!(%current, %latest, "protocol version is below the soft limit; update soon"),
		VersionStatus::HardOutdated => error!(%current, %latest, "protocol version is below the hard limit"),
		VersionStatus::Broken => error!(%current, %latest, "protocol version is marked broken upstream"),
	}
	Some(status)
}
