#![forbid(unsafe_code)]

use std::time::Duration;

use tandem_domain::RemoteId;

use super::activity::{ActivitySnapshot, PuppetActivity, count_active, is_active};
use super::test_support::memory_db;
use crate::config::LimitSettings;
use crate::db::{Database, PuppetRow};

const DAY: i64 = 24 * 60 * 60;
const NOW: i64 = 1_000 * DAY;

fn limits(max: u32, block: bool) -> LimitSettings {
	LimitSettings {
		max_puppet_limit: max,
		block_on_limit_reached: block,
		..LimitSettings::default()
	}
}

/// Two active puppets out of five, plus one never-active puppet.
async fn seeded_db() -> Database {
	let db = memory_db().await;
	let spans = [
		(NOW - 10 * DAY, NOW - DAY),
		(NOW - 2 * DAY, NOW - DAY),
		(NOW - 60 * DAY, NOW - 40 * DAY),
		(NOW - 40 * DAY, NOW),
		(NOW - 20 * DAY, NOW - 5 * DAY),
	];
	for (i, (first, last)) in spans.into_iter().enumerate() {
		let mut row = PuppetRow::new(RemoteId::user(format!("100{i}")));
		row.first_activity_ts = Some(first);
		row.last_activity_ts = Some(last);
		db.puppets().insert(&row).await.unwrap();
	}
	db.puppets()
		.insert(&PuppetRow::new(RemoteId::user("never")))
		.await
		.unwrap();
	db
}

#[test]
fn span_must_exceed_minimum_and_stay_under_window() {
	let l = LimitSettings::default();
	assert!(!is_active(NOW - 3 * DAY, NOW, NOW, &l));
	assert!(is_active(NOW - 3 * DAY - 1, NOW, NOW, &l));
	assert!(!is_active(NOW - 30 * DAY, NOW, NOW, &l));
	assert!(is_active(NOW - 30 * DAY + 1, NOW, NOW, &l));
}

#[test]
fn silent_puppets_drop_out() {
	let l = LimitSettings::default();
	let first = NOW - 40 * DAY;
	let last = NOW - 30 * DAY;
	assert!(is_active(first, last, NOW, &l));
	assert!(!is_active(first, last, NOW + 1, &l));
}

#[test]
fn count_active_over_pairs() {
	let l = LimitSettings {
		min_puppet_active: Duration::from_secs(0),
		..LimitSettings::default()
	};
	let spans = [(NOW - 10, NOW), (NOW, NOW), (NOW - 100, NOW - 50)];
	assert_eq!(count_active(&spans, NOW, &l), 2);
}

#[tokio::test]
async fn recompute_counts_synthetic_table_exactly() {
	let db = seeded_db().await;
	let activity = PuppetActivity::new(db.puppets(), limits(10, true));
	let snap = activity.recompute_at(NOW).await.unwrap();
	assert_eq!(
		snap,
		ActivitySnapshot {
			current_count: 2,
			max_count: 10,
			is_blocked: false,
		}
	);
	assert_eq!(activity.snapshot(), snap);
}

#[tokio::test]
async fn blocks_only_when_count_exceeds_limit() {
	let db = seeded_db().await;

	let at_limit = PuppetActivity::new(db.puppets(), limits(2, true));
	assert!(!at_limit.recompute_at(NOW).await.unwrap().is_blocked);

	let over = PuppetActivity::new(db.puppets(), limits(1, true));
	assert!(over.recompute_at(NOW).await.unwrap().is_blocked);
	assert!(over.is_blocked());

	let soft = PuppetActivity::new(db.puppets(), limits(1, false));
	assert!(!soft.recompute_at(NOW).await.unwrap().is_blocked);
}

#[tokio::test]
async fn read_error_keeps_previous_snapshot() {
	let db = seeded_db().await;
	let activity = PuppetActivity::new(db.puppets(), limits(1, true));
	let before = activity.recompute_at(NOW).await.unwrap();
	assert_eq!(before.current_count, 2);

	db.close().await;
	assert!(activity.recompute_at(NOW).await.is_err());
	assert_eq!(activity.snapshot(), before);
	assert!(activity.is_blocked());
}

#[tokio::test]
async fn puppet_activity_feeds_the_count() {
	let db = memory_db().await;
	db.puppets()
		.insert(&PuppetRow::new(RemoteId::user("1")))
		.await
		.unwrap();
	let registry = super::registry::Registry::new(db.clone());
	let puppet = registry
		.get_or_create_puppet(&RemoteId::user("1"))
		.await
		.unwrap()
		.unwrap();

	puppet.update_activity_ts(NOW - 5 * DAY).await;
	puppet.update_activity_ts(NOW - 6 * DAY).await;
	puppet.update_activity_ts(NOW).await;

	let activity = PuppetActivity::new(db.puppets(), limits(0, true));
	let snap = activity.recompute_at(NOW).await.unwrap();
	assert_eq!(snap.current_count, 1);
	assert!(snap.is_blocked);
}
