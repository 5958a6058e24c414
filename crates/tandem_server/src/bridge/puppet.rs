#![forbid(unsafe_code)]

use tandem_domain::{LocalUserId, RemoteId};
use tandem_platform::CustomPuppetLogin;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::{PuppetQuery, PuppetRow};

/// Live projection of one remote contact.
#[derive(Debug)]
pub struct Puppet {
	remote_id: RemoteId,
	row: Mutex<PuppetRow>,
	db: PuppetQuery,
}

impl Puppet {
	pub(crate) fn new(row: PuppetRow, db: PuppetQuery) -> Self {
		Self {
			remote_id: row.remote_id.clone(),
			row: Mutex::new(row),
			db,
		}
	}

	pub fn remote_id(&self) -> &RemoteId {
		&self.remote_id
	}

	pub async fn snapshot(&self) -> PuppetRow {
		self.row.lock().await.clone()
	}

	pub async fn enable_presence(&self) -> bool {
		self.row.lock().await.enable_presence
	}

	pub async fn custom_mxid(&self) -> Option<LocalUserId> {
		self.row.lock().await.custom_mxid.clone()
	}

	/// Credentials for double puppeting, if this puppet has a usable login.
	pub async fn custom_login(&self) -> Option<CustomPuppetLogin> {
		let row = self.row.lock().await;
		let local_id = row.custom_mxid.clone()?;
		if row.access_token.is_empty() {
			return None;
		}
		Some(CustomPuppetLogin {
			remote_id: self.remote_id.clone(),
			local_id,
			access_token: row.access_token.clone(),
			next_batch: row.next_batch.clone(),
		})
	}

	/// Record activity at `ts` (Unix seconds).
	///
	/// Older or equal timestamps are ignored. A failed write is logged and the
	/// in-memory value still advances.
	pub async fn update_activity_ts(&self, ts: i64) {
		let mut row = self.row.lock().await;
		if row.last_activity_ts.is_some_and(|last| last >= ts) {
			return;
		}

		debug!(puppet = %self.remote_id, ts, "updating puppet activity");
		if let Err(e) = self.db.update_activity_ts(&self.remote_id, ts).await {
			metrics::counter!("tandem_server_activity_write_failures_total").increment(1);
			warn!(puppet = %self.remote_id, error = %e, "failed to persist puppet activity");
		}

		if row.first_activity_ts.is_none() {
			row.first_activity_ts = Some(ts);
		}
		row.last_activity_ts = Some(ts);
	}

	/// Apply `f` to a copy of the row and persist it; memory changes only on success.
	pub async fn update<F>(&self, f: F) -> anyhow::Result<()>
	where
		F: FnOnce(&mut PuppetRow),
	{
		let mut row = self.row.lock().await;
		let mut next = row.clone();
		f(&mut next);
		self.db.update(&next).await?;
		*row = next;
		Ok(())
	}
}
