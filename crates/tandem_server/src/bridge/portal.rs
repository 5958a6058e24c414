#![forbid(unsafe_code)]

use tandem_domain::{LocalRoomId, PortalKey};
use tokio::sync::Mutex;

use crate::db::{PortalQuery, PortalRow};

/// Live bridged conversation.
#[derive(Debug)]
pub struct Portal {
	key: PortalKey,
	row: Mutex<PortalRow>,
	db: PortalQuery,
}

impl Portal {
	pub(crate) fn new(row: PortalRow, db: PortalQuery) -> Self {
		Self {
			key: row.key.clone(),
			row: Mutex::new(row),
			db,
		}
	}

	pub fn key(&self) -> &PortalKey {
		&self.key
	}

	pub async fn mxid(&self) -> Option<LocalRoomId> {
		self.row.lock().await.mxid.clone()
	}

	pub async fn snapshot(&self) -> PortalRow {
		self.row.lock().await.clone()
	}

	pub async fn update<F>(&self, f: F) -> anyhow::Result<()>
	where
		F: FnOnce(&mut PortalRow),
	{
		let mut row = self.row.lock().await;
		let mut next = row.clone();
		f(&mut next);
		self.db.update(&next).await?;
		*row = next;
		Ok(())
	}
}
