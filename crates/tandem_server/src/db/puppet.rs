#![forbid(unsafe_code)]

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tandem_domain::{LocalUserId, RemoteId};
use tandem_platform::SecretString;
use tracing::warn;

use super::{Database, with_pool};
use crate::util::time::{from_unix, to_unix};

macro_rules! select_puppet {
	($tail:literal) => {
		concat!(
			"SELECT username, avatar, avatar_url, avatar_set, displayname, name_quality, name_set, ",
			"contact_info_set, last_sync, custom_mxid, access_token, next_batch, enable_presence, ",
			"enable_receipts, first_activity_ts, last_activity_ts FROM puppet ",
			$tail
		)
	};
}

/// Persisted projection of one remote contact.
#[derive(Debug, Clone, PartialEq)]
pub struct PuppetRow {
	pub remote_id: RemoteId,

	pub avatar: String,
	pub avatar_url: String,
	pub avatar_set: bool,

	pub displayname: String,
	/// Higher means a more trustworthy name source.
	pub name_quality: i16,
	pub name_set: bool,
	pub contact_info_set: bool,
	pub last_sync: Option<DateTime<Utc>>,

	pub custom_mxid: Option<LocalUserId>,
	pub access_token: SecretString,
	pub next_batch: String,

	pub enable_presence: bool,
	pub enable_receipts: bool,

	pub first_activity_ts: Option<i64>,
	pub last_activity_ts: Option<i64>,
}

impl PuppetRow {
	pub fn new(remote_id: RemoteId) -> Self {
		Self {
			remote_id: remote_id.to_non_ad(),
			avatar: String::new(),
			avatar_url: String::new(),
			avatar_set: false,
			displayname: String::new(),
			name_quality: 0,
			name_set: false,
			contact_info_set: false,
			last_sync: None,
			custom_mxid: None,
			access_token: SecretString::default(),
			next_batch: String::new(),
			enable_presence: true,
			enable_receipts: true,
			first_activity_ts: None,
			last_activity_ts: None,
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
struct PuppetRecord {
	username: String,
	avatar: String,
	avatar_url: String,
	avatar_set: bool,
	displayname: String,
	name_quality: i16,
	name_set: bool,
	contact_info_set: bool,
	last_sync: Option<i64>,
	custom_mxid: String,
	access_token: String,
	next_batch: String,
	enable_presence: bool,
	enable_receipts: bool,
	first_activity_ts: Option<i64>,
	last_activity_ts: Option<i64>,
}

impl From<PuppetRecord> for PuppetRow {
	fn from(r: PuppetRecord) -> Self {
		let custom_mxid = if r.custom_mxid.is_empty() {
			None
		} else {
			match LocalUserId::new(r.custom_mxid.as_str()) {
				Ok(id) => Some(id),
				Err(e) => {
					warn!(puppet = %r.username, error = %e, "ignoring malformed custom_mxid");
					None
				}
			}
		};

		Self {
			remote_id: RemoteId::user(r.username),
			avatar: r.avatar,
			avatar_url: r.avatar_url,
			avatar_set: r.avatar_set,
			displayname: r.displayname,
			name_quality: r.name_quality,
			name_set: r.name_set,
			contact_info_set: r.contact_info_set,
			last_sync: from_unix(r.last_sync),
			custom_mxid,
			access_token: SecretString::new(r.access_token),
			next_batch: r.next_batch,
			enable_presence: r.enable_presence,
			enable_receipts: r.enable_receipts,
			first_activity_ts: r.first_activity_ts,
			last_activity_ts: r.last_activity_ts,
		}
	}
}

/// Puppet table queries.
#[derive(Clone, Debug)]
pub struct PuppetQuery {
	db: Database,
}

impl PuppetQuery {
	pub(super) fn new(db: Database) -> Self {
		Self { db }
	}

	pub async fn get_all(&self) -> anyhow::Result<Vec<PuppetRow>> {
		let rows: Vec<PuppetRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_puppet!(""))
				.fetch_all(pool)
				.await
				.context("select all puppets")?
		});
		Ok(rows.into_iter().map(PuppetRow::from).collect())
	}

	pub async fn get(&self, remote_id: &RemoteId) -> anyhow::Result<Option<PuppetRow>> {
		if !remote_id.is_standard_user() {
			return Ok(None);
		}
		let row: Option<PuppetRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_puppet!("WHERE username = $1"))
				.bind(&remote_id.user)
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select puppet {remote_id}"))?
		});
		Ok(row.map(PuppetRow::from))
	}

	pub async fn get_by_custom_mxid(&self, mxid: &LocalUserId) -> anyhow::Result<Option<PuppetRow>> {
		let row: Option<PuppetRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_puppet!("WHERE custom_mxid = $1"))
				.bind(mxid.as_str())
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select puppet by custom mxid {mxid}"))?
		});
		Ok(row.map(PuppetRow::from))
	}

	pub async fn get_all_with_custom_mxid(&self) -> anyhow::Result<Vec<PuppetRow>> {
		let rows: Vec<PuppetRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(select_puppet!("WHERE custom_mxid <> ''"))
				.fetch_all(pool)
				.await
				.context("select custom puppets")?
		});
		Ok(rows.into_iter().map(PuppetRow::from).collect())
	}

	/// Insert a new puppet. Ids outside the standard-user namespace are skipped.
	pub async fn insert(&self, row: &PuppetRow) -> anyhow::Result<()> {
		if !row.remote_id.is_standard_user() {
			warn!(remote = %row.remote_id, "refusing to insert puppet for non-user id");
			return Ok(());
		}

		with_pool!(self.db, pool => {
			sqlx::query(
				"INSERT INTO puppet (username, avatar, avatar_url, avatar_set, displayname, name_quality, name_set, \
				contact_info_set, last_sync, custom_mxid, access_token, next_batch, enable_presence, enable_receipts, \
				first_activity_ts, last_activity_ts) \
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
			)
			.bind(&row.remote_id.user)
			.bind(&row.avatar)
			.bind(&row.avatar_url)
			.bind(row.avatar_set)
			.bind(&row.displayname)
			.bind(row.name_quality)
			.bind(row.name_set)
			.bind(row.contact_info_set)
			.bind(to_unix(row.last_sync))
			.bind(row.custom_mxid.as_ref().map(LocalUserId::as_str).unwrap_or_default())
			.bind(row.access_token.expose())
			.bind(&row.next_batch)
			.bind(row.enable_presence)
			.bind(row.enable_receipts)
			.bind(row.first_activity_ts)
			.bind(row.last_activity_ts)
			.execute(pool)
			.await
			.with_context(|| format!("insert puppet {}", row.remote_id))?;
		});
		Ok(())
	}

	/// Replace every mutable column of an existing puppet.
	pub async fn update(&self, row: &PuppetRow) -> anyhow::Result<()> {
		with_pool!(self.db, pool => {
			sqlx::query(
				"UPDATE puppet SET avatar = $2, avatar_url = $3, avatar_set = $4, displayname = $5, name_quality = $6, \
				name_set = $7, contact_info_set = $8, last_sync = $9, custom_mxid = $10, access_token = $11, \
				next_batch = $12, enable_presence = $13, enable_receipts = $14 \
				WHERE username = $1",
			)
			.bind(&row.remote_id.user)
			.bind(&row.avatar)
			.bind(&row.avatar_url)
			.bind(row.avatar_set)
			.bind(&row.displayname)
			.bind(row.name_quality)
			.bind(row.name_set)
			.bind(row.contact_info_set)
			.bind(to_unix(row.last_sync))
			.bind(row.custom_mxid.as_ref().map(LocalUserId::as_str).unwrap_or_default())
			.bind(row.access_token.expose())
			.bind(&row.next_batch)
			.bind(row.enable_presence)
			.bind(row.enable_receipts)
			.execute(pool)
			.await
			.with_context(|| format!("update puppet {}", row.remote_id))?;
		});
		Ok(())
	}

	/// Record activity at `ts`: first activity is set once, last activity only moves forward.
	///
	/// The two columns are written independently; both writes are attempted
	/// even if the first fails.
	pub async fn update_activity_ts(&self, remote_id: &RemoteId, ts: i64) -> anyhow::Result<()> {
		let (first, last) = with_pool!(self.db, pool => {
			let first = sqlx::query(
				"UPDATE puppet SET first_activity_ts = $1 WHERE username = $2 AND first_activity_ts IS NULL",
			)
			.bind(ts)
			.bind(&remote_id.user)
			.execute(pool)
			.await
			.map(|_| ())
			.with_context(|| format!("set first activity of {remote_id}"));

			let last = sqlx::query(
				"UPDATE puppet SET last_activity_ts = $1 \
				WHERE username = $2 AND (last_activity_ts IS NULL OR last_activity_ts < $1)",
			)
			.bind(ts)
			.bind(&remote_id.user)
			.execute(pool)
			.await
			.map(|_| ())
			.with_context(|| format!("set last activity of {remote_id}"));

			(first, last)
		});
		first.and(last)
	}

	/// `(first, last)` activity pairs of every puppet that has been active.
	pub async fn activity_spans(&self) -> anyhow::Result<Vec<(i64, i64)>> {
		let rows: Vec<(Option<i64>, Option<i64>)> = with_pool!(self.db, pool => {
			sqlx::query_as("SELECT first_activity_ts, last_activity_ts FROM puppet WHERE first_activity_ts IS NOT NULL")
				.fetch_all(pool)
				.await
				.context("select puppet activity")?
		});
		Ok(rows
			.into_iter()
			.filter_map(|(first, last)| first.map(|f| (f, last.unwrap_or(f))))
			.collect())
	}

	pub async fn count(&self) -> anyhow::Result<i64> {
		let (n,): (i64,) = with_pool!(self.db, pool => {
			sqlx::query_as("SELECT COUNT(*) FROM puppet")
				.fetch_one(pool)
				.await
				.context("count puppets")?
		});
		Ok(n)
	}
}
