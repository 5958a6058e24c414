#![forbid(unsafe_code)]

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tandem_domain::{LocalRoomId, LocalUserId, PortalKey, RemoteId};
use tracing::warn;

use super::{Database, with_pool};
use crate::util::time::{from_unix, to_unix};

macro_rules! select_portal {
	($tail:literal) => {
		concat!(
			"SELECT jid, receiver, mxid, name, name_set, topic, topic_set, avatar, avatar_url, avatar_set, ",
			"encrypted, last_sync, expiration_time, relay_user_id FROM portal ",
			$tail
		)
	};
}

/// Persisted bridged conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalRow {
	pub key: PortalKey,
	/// `None` until the local room exists.
	pub mxid: Option<LocalRoomId>,

	pub name: String,
	pub name_set: bool,
	pub topic: String,
	pub topic_set: bool,
	pub avatar: String,
	pub avatar_url: String,
	pub avatar_set: bool,

	pub encrypted: bool,
	pub last_sync: Option<DateTime<Utc>>,
	/// Disappearing-message timer in seconds, zero when off.
	pub expiration_time: u32,
	pub relay_user_id: Option<LocalUserId>,
}

impl PortalRow {
	pub fn new(key: PortalKey) -> Self {
		Self {
			key,
			mxid: None,
			name: String::new(),
			name_set: false,
			topic: String::new(),
			topic_set: false,
			avatar: String::new(),
			avatar_url: String::new(),
			avatar_set: false,
			encrypted: false,
			last_sync: None,
			expiration_time: 0,
			relay_user_id: None,
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
struct PortalRecord {
	jid: String,
	receiver: String,
	mxid: Option<String>,
	name: String,
	name_set: bool,
	topic: String,
	topic_set: bool,
	avatar: String,
	avatar_url: String,
	avatar_set: bool,
	encrypted: bool,
	last_sync: Option<i64>,
	expiration_time: i64,
	relay_user_id: Option<String>,
}

impl PortalRecord {
	fn into_row(self) -> Option<PortalRow> {
		let (chat, receiver) = match (RemoteId::parse(&self.jid), RemoteId::parse(&self.receiver)) {
			(Ok(chat), Ok(receiver)) => (chat, receiver),
			(Err(e), _) | (_, Err(e)) => {
				warn!(jid = %self.jid, receiver = %self.receiver, error = %e, "skipping portal row with malformed key");
				return None;
			}
		};

		Some(PortalRow {
			key: PortalKey::new(chat, receiver),
			mxid: self.mxid.filter(|m| !m.is_empty()).and_then(|m| LocalRoomId::new(m).ok()),
			name: self.name,
			name_set: self.name_set,
			topic: self.topic,
			topic_set: self.topic_set,
			avatar: self.avatar,
			avatar_url: self.avatar_url,
			avatar_set: self.avatar_set,
			encrypted: self.encrypted,
			last_sync: from_unix(self.last_sync),
			expiration_time: self.expiration_time.clamp(0, u32::MAX as i64) as u32,
			relay_user_id: self
				.relay_user_id
				.filter(|r| !r.is_empty())
				.and_then(|r| LocalUserId::new(r).ok()),
		})
	}
}

/// Portal table queries.
#[derive(Clone, Debug)]
pub struct PortalQuery {
	db: Database,
}

impl PortalQuery {
	pub(super) fn new(db: Database) -> Self {
		Self { db }
	}

	pub async fn get_all(&self) -> anyhow::Result<Vec<PortalRow>> {
		let rows: Vec<PortalRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_portal!(""))
				.fetch_all(pool)
				.await
				.context("select all portals")?
		});
		Ok(rows.into_iter().filter_map(PortalRecord::into_row).collect())
	}

	pub async fn get_by_key(&self, key: &PortalKey) -> anyhow::Result<Option<PortalRow>> {
		let row: Option<PortalRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_portal!("WHERE jid = $1 AND receiver = $2"))
				.bind(key.chat.to_string())
				.bind(key.receiver.to_string())
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select portal {key}"))?
		});
		Ok(row.and_then(PortalRecord::into_row))
	}

	pub async fn get_by_mxid(&self, mxid: &LocalRoomId) -> anyhow::Result<Option<PortalRow>> {
		let row: Option<PortalRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_portal!("WHERE mxid = $1"))
				.bind(mxid.as_str())
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select portal by room {mxid}"))?
		});
		Ok(row.and_then(PortalRecord::into_row))
	}

	pub async fn insert(&self, row: &PortalRow) -> anyhow::Result<()> {
		with_pool!(self.db, pool => {
			sqlx::query(
				"INSERT INTO portal (jid, receiver, mxid, name, name_set, topic, topic_set, avatar, avatar_url, \
				avatar_set, encrypted, last_sync, expiration_time, relay_user_id) \
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
			)
			.bind(row.key.chat.to_string())
			.bind(row.key.receiver.to_string())
			.bind(row.mxid.as_ref().map(LocalRoomId::as_str))
			.bind(&row.name)
			.bind(row.name_set)
			.bind(&row.topic)
			.bind(row.topic_set)
			.bind(&row.avatar)
			.bind(&row.avatar_url)
			.bind(row.avatar_set)
			.bind(row.encrypted)
			.bind(to_unix(row.last_sync))
			.bind(row.expiration_time as i64)
			.bind(row.relay_user_id.as_ref().map(LocalUserId::as_str))
			.execute(pool)
			.await
			.with_context(|| format!("insert portal {}", row.key))?;
		});
		Ok(())
	}

	pub async fn update(&self, row: &PortalRow) -> anyhow::Result<()> {
		with_pool!(self.db, pool => {
			sqlx::query(
				"UPDATE portal SET mxid = $3, name = $4, name_set = $5, topic = $6, topic_set = $7, avatar = $8, \
				avatar_url = $9, avatar_set = $10, encrypted = $11, last_sync = $12, expiration_time = $13, \
				relay_user_id = $14 WHERE jid = $1 AND receiver = $2",
			)
			.bind(row.key.chat.to_string())
			.bind(row.key.receiver.to_string())
			.bind(row.mxid.as_ref().map(LocalRoomId::as_str))
			.bind(&row.name)
			.bind(row.name_set)
			.bind(&row.topic)
			.bind(row.topic_set)
			.bind(&row.avatar)
			.bind(&row.avatar_url)
			.bind(row.avatar_set)
			.bind(row.encrypted)
			.bind(to_unix(row.last_sync))
			.bind(row.expiration_time as i64)
			.bind(row.relay_user_id.as_ref().map(LocalUserId::as_str))
			.execute(pool)
			.await
			.with_context(|| format!("update portal {}", row.key))?;
		});
		Ok(())
	}
}
