#![forbid(unsafe_code)]

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tandem_domain::{LocalRoomId, LocalUserId, RemoteId};
use tracing::warn;

use super::{Database, with_pool};
use crate::util::time::{from_unix, to_unix};

macro_rules! select_user {
	($tail:literal) => {
		concat!(
			"SELECT mxid, username, device, management_room, space_room, phone_last_seen, phone_last_pinged, timezone ",
			"FROM \"user\" ",
			$tail
		)
	};
}

/// Persisted bridged account.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
	pub mxid: LocalUserId,
	/// `None` until the first successful login.
	pub remote_id: Option<RemoteId>,
	pub management_room: Option<LocalRoomId>,
	pub space_room: Option<LocalRoomId>,
	pub phone_last_seen: Option<DateTime<Utc>>,
	pub phone_last_pinged: Option<DateTime<Utc>>,
	pub timezone: String,
}

impl UserRow {
	pub fn new(mxid: LocalUserId) -> Self {
		Self {
			mxid,
			remote_id: None,
			management_room: None,
			space_room: None,
			phone_last_seen: None,
			phone_last_pinged: None,
			timezone: String::new(),
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
struct UserRecord {
	mxid: String,
	username: Option<String>,
	device: Option<i16>,
	management_room: Option<String>,
	space_room: Option<String>,
	phone_last_seen: Option<i64>,
	phone_last_pinged: Option<i64>,
	timezone: String,
}

impl UserRecord {
	fn into_row(self) -> Option<UserRow> {
		let mxid = match LocalUserId::new(self.mxid.as_str()) {
			Ok(id) => id,
			Err(e) => {
				warn!(mxid = %self.mxid, error = %e, "skipping user row with malformed mxid");
				return None;
			}
		};

		let remote_id = self.username.filter(|u| !u.is_empty()).map(|u| RemoteId {
			device: self.device.unwrap_or(0).max(0) as u16,
			..RemoteId::user(u)
		});

		let room = |raw: Option<String>| raw.filter(|r| !r.is_empty()).and_then(|r| LocalRoomId::new(r).ok());

		Some(UserRow {
			mxid,
			remote_id,
			management_room: room(self.management_room),
			space_room: room(self.space_room),
			phone_last_seen: from_unix(self.phone_last_seen),
			phone_last_pinged: from_unix(self.phone_last_pinged),
			timezone: self.timezone,
		})
	}
}

/// `"user"` table queries.
#[derive(Clone, Debug)]
pub struct UserQuery {
	db: Database,
}

impl UserQuery {
	pub(super) fn new(db: Database) -> Self {
		Self { db }
	}

	pub async fn get_all(&self) -> anyhow::Result<Vec<UserRow>> {
		let rows: Vec<UserRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_user!(""))
				.fetch_all(pool)
				.await
				.context("select all users")?
		});
		Ok(rows.into_iter().filter_map(UserRecord::into_row).collect())
	}

	pub async fn get_by_mxid(&self, mxid: &LocalUserId) -> anyhow::Result<Option<UserRow>> {
		let row: Option<UserRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_user!("WHERE mxid = $1"))
				.bind(mxid.as_str())
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select user {mxid}"))?
		});
		Ok(row.and_then(UserRecord::into_row))
	}

	pub async fn get_by_remote(&self, remote_id: &RemoteId) -> anyhow::Result<Option<UserRow>> {
		let row: Option<UserRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_user!("WHERE username = $1"))
				.bind(&remote_id.user)
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select user by remote id {remote_id}"))?
		});
		Ok(row.and_then(UserRecord::into_row))
	}

	pub async fn insert(&self, row: &UserRow) -> anyhow::Result<()> {
		with_pool!(self.db, pool => {
			sqlx::query(
				"INSERT INTO \"user\" (mxid, username, device, management_room, space_room, phone_last_seen, \
				phone_last_pinged, timezone) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
			)
			.bind(row.mxid.as_str())
			.bind(row.remote_id.as_ref().map(|r| r.user.as_str()))
			.bind(row.remote_id.as_ref().map(|r| r.device as i16))
			.bind(row.management_room.as_ref().map(LocalRoomId::as_str))
			.bind(row.space_room.as_ref().map(LocalRoomId::as_str))
			.bind(to_unix(row.phone_last_seen))
			.bind(to_unix(row.phone_last_pinged))
			.bind(&row.timezone)
			.execute(pool)
			.await
			.with_context(|| format!("insert user {}", row.mxid))?;
		});
		Ok(())
	}

	pub async fn update(&self, row: &UserRow) -> anyhow::Result<()> {
		with_pool!(self.db, pool => {
			sqlx::query(
				"UPDATE \"user\" SET username = $2, device = $3, management_room = $4, space_room = $5, \
				phone_last_seen = $6, phone_last_pinged = $7, timezone = $8 WHERE mxid = $1",
			)
			.bind(row.mxid.as_str())
			.bind(row.remote_id.as_ref().map(|r| r.user.as_str()))
			.bind(row.remote_id.as_ref().map(|r| r.device as i16))
			.bind(row.management_room.as_ref().map(LocalRoomId::as_str))
			.bind(row.space_room.as_ref().map(LocalRoomId::as_str))
			.bind(to_unix(row.phone_last_seen))
			.bind(to_unix(row.phone_last_pinged))
			.bind(&row.timezone)
			.execute(pool)
			.await
			.with_context(|| format!("update user {}", row.mxid))?;
		});
		Ok(())
	}
}
