#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_domain::{LocalRoomId, LocalUserId, RemoteId};
use tandem_platform::RemoteSession;
use tokio::sync::Mutex;
use tracing::warn;

use crate::bridge::session::{SessionSlot, SessionState};
use crate::db::{UserQuery, UserRow};

/// Live bridged account.
pub struct User {
	mxid: LocalUserId,
	row: Mutex<UserRow>,
	pub(crate) session: parking_lot::Mutex<SessionSlot>,
	phone_warned: AtomicBool,
	db: UserQuery,
}

impl std::fmt::Debug for User {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("User")
			.field("mxid", &self.mxid)
			.field("state", &self.session_state())
			.finish_non_exhaustive()
	}
}

impl User {
	pub(crate) fn new(row: UserRow, db: UserQuery) -> Self {
		let state = if row.remote_id.is_some() {
			SessionState::Disconnected
		} else {
			SessionState::Unconfigured
		};
		Self {
			mxid: row.mxid.clone(),
			row: Mutex::new(row),
			session: parking_lot::Mutex::new(SessionSlot::new(state)),
			phone_warned: AtomicBool::new(false),
			db,
		}
	}

	pub fn mxid(&self) -> &LocalUserId {
		&self.mxid
	}

	pub async fn remote_id(&self) -> Option<RemoteId> {
		self.row.lock().await.remote_id.clone()
	}

	pub async fn management_room(&self) -> Option<LocalRoomId> {
		self.row.lock().await.management_room.clone()
	}

	pub async fn snapshot(&self) -> UserRow {
		self.row.lock().await.clone()
	}

	pub fn session_state(&self) -> SessionState {
		self.session.lock().state
	}

	pub fn is_connected(&self) -> bool {
		self.session_state() == SessionState::Connected
	}

	/// The live transport, if any.
	pub(crate) fn remote_session(&self) -> Option<Arc<dyn RemoteSession>> {
		self.session.lock().session.clone()
	}

	/// Apply `f` to a copy of the row and persist it; memory changes only on success.
	pub async fn update<F>(&self, f: F) -> anyhow::Result<()>
	where
		F: FnOnce(&mut UserRow),
	{
		let mut row = self.row.lock().await;
		let mut next = row.clone();
		f(&mut next);
		self.db.update(&next).await?;
		*row = next;
		Ok(())
	}

	/// A phone that has never been seen counts as recently seen.
	pub async fn phone_recently_seen(&self, grace: Duration, now: DateTime<Utc>) -> bool {
		let Some(seen) = self.row.lock().await.phone_last_seen else {
			return true;
		};
		let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
		now.signed_duration_since(seen) <= grace
	}

	/// Record that the primary device answered and re-arm the offline warning.
	pub async fn mark_phone_seen(&self, at: DateTime<Utc>) {
		self.phone_warned.store(false, Ordering::Relaxed);
		let mut row = self.row.lock().await;
		if row.phone_last_seen.is_some_and(|prev| prev >= at) {
			return;
		}
		row.phone_last_seen = Some(at);
		if let Err(e) = self.db.update(&row).await {
			warn!(user = %self.mxid, error = %e, "failed to persist phone_last_seen");
		}
	}

	/// Returns true exactly once per stale period.
	pub(crate) fn claim_phone_warning(&self) -> bool {
		!self.phone_warned.swap(true, Ordering::Relaxed)
	}

	/// Undo a claim whose warning never reached the user.
	pub(crate) fn release_phone_warning(&self) {
		self.phone_warned.store(false, Ordering::Relaxed);
	}
}
