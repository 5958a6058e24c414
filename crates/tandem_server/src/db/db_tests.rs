#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::Utc;
use tandem_domain::{LocalRoomId, LocalUserId, PortalKey, RemoteId, Server};
use tandem_platform::SecretString;

use super::*;
use crate::util::time::from_unix;

async fn memory_db() -> Database {
	Database::connect("sqlite::memory:", 1).await.expect("connect in-memory sqlite")
}

fn full_puppet() -> PuppetRow {
	PuppetRow {
		remote_id: RemoteId::user("15550001111"),
		avatar: "av-1".to_string(),
		avatar_url: "mxc://local/abc".to_string(),
		avatar_set: true,
		displayname: "Ada".to_string(),
		name_quality: 3,
		name_set: true,
		contact_info_set: true,
		last_sync: from_unix(Some(1_700_000_000)),
		custom_mxid: Some(LocalUserId::new("@ada:local").unwrap()),
		access_token: SecretString::new("tok"),
		next_batch: "s42".to_string(),
		enable_presence: false,
		enable_receipts: true,
		first_activity_ts: Some(10),
		last_activity_ts: Some(20),
	}
}

#[tokio::test]
async fn puppet_insert_then_get_reproduces_every_field() {
	let db = memory_db().await;
	let row = full_puppet();
	db.puppets().insert(&row).await.unwrap();

	let loaded = db.puppets().get(&row.remote_id).await.unwrap().expect("row present");
	assert_eq!(loaded, row);

	let by_custom = db
		.puppets()
		.get_by_custom_mxid(&LocalUserId::new("@ada:local").unwrap())
		.await
		.unwrap();
	assert_eq!(by_custom.map(|p| p.remote_id), Some(row.remote_id.clone()));
	assert_eq!(db.puppets().get_all_with_custom_mxid().await.unwrap().len(), 1);
}

#[tokio::test]
async fn zero_last_sync_reads_back_as_never_synced() {
	let db = memory_db().await;
	let mut row = PuppetRow::new(RemoteId::user("1"));
	row.last_sync = from_unix(Some(0));
	db.puppets().insert(&row).await.unwrap();

	let loaded = db.puppets().get(&row.remote_id).await.unwrap().unwrap();
	assert_eq!(loaded.last_sync, None);
	assert!(loaded.enable_presence);
	assert!(loaded.enable_receipts);
	assert!(loaded.custom_mxid.is_none());
}

#[tokio::test]
async fn non_user_puppet_insert_is_a_noop() {
	let db = memory_db().await;
	let broadcast = PuppetRow::new(RemoteId::new("status", Server::Broadcast));

	db.puppets().insert(&broadcast).await.unwrap();

	assert_eq!(db.puppets().count().await.unwrap(), 0);
	assert!(db.puppets().get(&broadcast.remote_id).await.unwrap().is_none());
}

#[tokio::test]
async fn activity_writes_are_monotonic() {
	let db = memory_db().await;
	let id = RemoteId::user("2");
	db.puppets().insert(&PuppetRow::new(id.clone())).await.unwrap();

	for ts in [100, 50, 200] {
		db.puppets().update_activity_ts(&id, ts).await.unwrap();
	}

	let row = db.puppets().get(&id).await.unwrap().unwrap();
	assert_eq!(row.first_activity_ts, Some(100));
	assert_eq!(row.last_activity_ts, Some(200));
	assert_eq!(db.puppets().activity_spans().await.unwrap(), vec![(100, 200)]);
}

#[tokio::test]
async fn puppet_update_replaces_mutable_columns() {
	let db = memory_db().await;
	let mut row = PuppetRow::new(RemoteId::user("3"));
	db.puppets().insert(&row).await.unwrap();

	row.displayname = "Grace".to_string();
	row.name_quality = 2;
	row.enable_receipts = false;
	db.puppets().update(&row).await.unwrap();

	assert_eq!(db.puppets().get(&row.remote_id).await.unwrap().unwrap(), row);
}

#[tokio::test]
async fn user_round_trip_keeps_device_and_rooms() {
	let db = memory_db().await;
	let mut row = UserRow::new(LocalUserId::new("@alice:local").unwrap());
	db.users().insert(&row).await.unwrap();
	assert_eq!(db.users().get_by_mxid(&row.mxid).await.unwrap(), Some(row.clone()));

	row.remote_id = Some(RemoteId {
		device: 7,
		..RemoteId::user("15550002222")
	});
	row.management_room = Some(LocalRoomId::new("!mgmt:local").unwrap());
	row.phone_last_seen = from_unix(Some(1_700_000_100));
	row.timezone = "Europe/Lisbon".to_string();
	db.users().update(&row).await.unwrap();

	let by_remote = db
		.users()
		.get_by_remote(&RemoteId::user("15550002222"))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(by_remote, row);
	assert_eq!(db.users().get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn portal_round_trip_by_key_and_room() {
	let db = memory_db().await;
	let key = PortalKey::new(RemoteId::new("1234-5678", Server::Group), RemoteId::user("9"));
	let mut row = PortalRow::new(key.clone());
	db.portals().insert(&row).await.unwrap();

	row.mxid = Some(LocalRoomId::new("!room:local").unwrap());
	row.name = "Team".to_string();
	row.encrypted = true;
	row.expiration_time = 604_800;
	db.portals().update(&row).await.unwrap();

	assert_eq!(db.portals().get_by_key(&key).await.unwrap(), Some(row.clone()));
	assert_eq!(
		db.portals()
			.get_by_mxid(&LocalRoomId::new("!room:local").unwrap())
			.await
			.unwrap(),
		Some(row)
	);
}

#[tokio::test]
async fn disappearing_messages_only_return_started_timers() {
	let db = memory_db().await;
	let room = LocalRoomId::new("!room:local").unwrap();
	let now = Utc::now();

	let pending = DisappearingMessage::new(room.clone(), "$pending", Duration::from_secs(60));
	let mut due = DisappearingMessage::new(room.clone(), "$due", Duration::from_secs(30));
	due.start_timer(now);
	let mut later = DisappearingMessage::new(room.clone(), "$later", Duration::from_secs(3 * 60 * 60));
	later.start_timer(now);

	for msg in [&pending, &due, &later] {
		db.disappearing().insert(msg).await.unwrap();
	}

	let upcoming = db
		.disappearing()
		.get_upcoming(now + chrono::Duration::hours(1))
		.await
		.unwrap();
	assert_eq!(upcoming.iter().map(|m| m.event_id.as_str()).collect::<Vec<_>>(), vec!["$due"]);

	db.disappearing().delete(&room, "$due").await.unwrap();
	assert!(
		db.disappearing()
			.get_upcoming(now + chrono::Duration::hours(1))
			.await
			.unwrap()
			.is_empty()
	);
}
