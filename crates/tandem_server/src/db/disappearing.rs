#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tandem_domain::LocalRoomId;
use tracing::warn;

use super::{Database, with_pool};
use crate::util::time::{from_unix, to_unix};

/// A bridged event scheduled for redaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisappearingMessage {
	pub room_id: LocalRoomId,
	pub event_id: String,
	pub expire_in: Duration,
	/// `None` until the timer starts (i.e. the message was read).
	pub expire_at: Option<DateTime<Utc>>,
}

impl DisappearingMessage {
	pub fn new(room_id: LocalRoomId, event_id: impl Into<String>, expire_in: Duration) -> Self {
		Self {
			room_id,
			event_id: event_id.into(),
			expire_in,
			expire_at: None,
		}
	}

	/// Start the timer relative to `now`.
	pub fn start_timer(&mut self, now: DateTime<Utc>) {
		let delta = chrono::Duration::from_std(self.expire_in).unwrap_or(chrono::Duration::zero());
		self.expire_at = Some(now + delta);
	}
}

#[derive(Debug, sqlx::FromRow)]
struct DisappearingRecord {
	room_id: String,
	event_id: String,
	expire_in_secs: i64,
	expire_at: Option<i64>,
}

impl DisappearingRecord {
	fn into_message(self) -> Option<DisappearingMessage> {
		let room_id = match LocalRoomId::new(self.room_id.as_str()) {
			Ok(id) => id,
			Err(e) => {
				warn!(room = %self.room_id, error = %e, "skipping disappearing message with malformed room");
				return None;
			}
		};
		Some(DisappearingMessage {
			room_id,
			event_id: self.event_id,
			expire_in: Duration::from_secs(self.expire_in_secs.max(0) as u64),
			expire_at: from_unix(self.expire_at),
		})
	}
}

/// Disappearing-message table queries.
#[derive(Clone, Debug)]
pub struct DisappearingQuery {
	db: Database,
}

impl DisappearingQuery {
	pub(super) fn new(db: Database) -> Self {
		Self { db }
	}

	/// Insert or reschedule a message.
	pub async fn insert(&self, msg: &DisappearingMessage) -> anyhow::Result<()> {
		with_pool!(self.db, pool => {
			sqlx::query(
				"INSERT INTO disappearing_message (room_id, event_id, expire_in_secs, expire_at) VALUES ($1, $2, $3, $4) \
				ON CONFLICT (room_id, event_id) DO UPDATE SET expire_in_secs = excluded.expire_in_secs, \
				expire_at = excluded.expire_at",
			)
			.bind(msg.room_id.as_str())
			.bind(&msg.event_id)
			.bind(msg.expire_in.as_secs() as i64)
			.bind(to_unix(msg.expire_at))
			.execute(pool)
			.await
			.with_context(|| format!("insert disappearing message {}", msg.event_id))?;
		});
		Ok(())
	}

	/// Messages whose timer runs out at or before `before`, soonest first.
	pub async fn get_upcoming(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<DisappearingMessage>> {
		let rows: Vec<DisappearingRecord> = with_pool!(self.db, pool => {
			sqlx::query_as(
				"SELECT room_id, event_id, expire_in_secs, expire_at FROM disappearing_message \
				WHERE expire_at IS NOT NULL AND expire_at <= $1 ORDER BY expire_at",
			)
			.bind(before.timestamp())
			.fetch_all(pool)
			.await
			.context("select upcoming disappearing messages")?
		});
		Ok(rows.into_iter().filter_map(DisappearingRecord::into_message).collect())
	}

	pub async fn delete(&self, room_id: &LocalRoomId, event_id: &str) -> anyhow::Result<()> {
		with_pool!(self.db, pool => {
			sqlx::query("DELETE FROM disappearing_message WHERE room_id = $1 AND event_id = $2")
				.bind(room_id.as_str())
				.bind(event_id)
				.execute(pool)
				.await
				.with_context(|| format!("delete disappearing message {event_id}"))?;
		});
		Ok(())
	}
}
