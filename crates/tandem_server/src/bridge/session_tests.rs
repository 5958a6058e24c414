#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tandem_domain::{PortalKey, RemoteId};
use tandem_platform::{ReconnectPolicy, RemoteEvent, SecretString, StateEvent};

use super::activity::PuppetActivity;
use super::registry::Registry;
use super::session::{ConnectOutcome, SessionError, SessionManager, SessionState};
use super::test_support::{FakeConnector, RecordingSink, fast_policy, local_user, memory_db, unlimited, wait_until};
use super::user::User;
use crate::config::LimitSettings;
use crate::db::{Database, PuppetRow};
use crate::util::time::unix_now;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
	db: Database,
	registry: Arc<Registry>,
	connector: Arc<FakeConnector>,
	sink: Arc<RecordingSink>,
	activity: Arc<PuppetActivity>,
	sessions: Arc<SessionManager>,
}

impl Harness {
	async fn new(connector: FakeConnector) -> Self {
		Self::with(connector, unlimited(), fast_policy(3)).await
	}

	async fn with(connector: FakeConnector, limits: LimitSettings, policy: ReconnectPolicy) -> Self {
		let db = memory_db().await;
		let registry = Arc::new(Registry::new(db.clone()));
		let connector = Arc::new(connector);
		let sink = Arc::new(RecordingSink::new());
		let activity = Arc::new(PuppetActivity::new(db.puppets(), limits));
		let sessions = Arc::new(SessionManager::new(
			Arc::clone(&registry),
			connector.clone(),
			sink.clone(),
			Arc::clone(&activity),
			policy,
		));
		Self {
			db,
			registry,
			connector,
			sink,
			activity,
			sessions,
		}
	}

	async fn user(&self, name: &str, remote: Option<&str>) -> Arc<User> {
		let user = self.registry.get_or_create_user(&local_user(name)).await.unwrap();
		if let Some(remote) = remote {
			self.registry
				.set_user_remote(&user, Some(RemoteId::user(remote)))
				.await
				.unwrap();
		}
		user
	}

	async fn connected_user(&self, name: &str, remote: &str) -> Arc<User> {
		let user = self.user(name, Some(remote)).await;
		assert_eq!(
			self.sessions.connect(&user).await.unwrap(),
			ConnectOutcome::Connected
		);
		user
	}
}

#[tokio::test]
async fn start_all_isolates_a_failing_user() {
	let connector = FakeConnector::new();
	connector.fail_open_for("2");
	let h = Harness::new(connector).await;
	let a = h.user("a", Some("1")).await;
	let b = h.user("b", Some("2")).await;
	let c = h.user("c", Some("3")).await;
	let idle = h.user("idle", None).await;

	let report = h.sessions.start_all().await.unwrap();

	assert_eq!(report.attempted, 3);
	assert_eq!(report.connected, 2);
	assert_eq!(report.failures.len(), 1);
	assert_eq!(report.failures[0].id, b.mxid().to_string());
	assert!(!report.unconfigured);

	assert_eq!(a.session_state(), SessionState::Connected);
	assert_eq!(c.session_state(), SessionState::Connected);
	assert_eq!(b.session_state(), SessionState::Disconnected);
	assert_eq!(idle.session_state(), SessionState::Unconfigured);
	assert!(h.sink.states_for(Some(b.mxid())).contains(&StateEvent::UnknownError));
	assert!(h.sink.states_for(None).is_empty());
}

#[tokio::test]
async fn start_all_without_accounts_reports_unconfigured() {
	let h = Harness::new(FakeConnector::new()).await;
	h.user("lonely", None).await;

	let report = h.sessions.start_all().await.unwrap();
	assert!(report.unconfigured);
	assert_eq!(report.attempted, 0);
	assert_eq!(h.sink.states_for(None), vec![StateEvent::Unconfigured]);
	assert_eq!(h.connector.opens(), 0);
}

#[tokio::test]
async fn start_all_starts_custom_puppets_after_users() {
	let h = Harness::new(FakeConnector::new()).await;
	h.user("a", Some("1")).await;
	let mut row = PuppetRow::new(RemoteId::user("88"));
	row.custom_mxid = Some(local_user("eighty-eight"));
	row.access_token = SecretString::new("tok");
	h.db.puppets().insert(&row).await.unwrap();
	h.db.puppets()
		.insert(&PuppetRow::new(RemoteId::user("89")))
		.await
		.unwrap();

	let report = h.sessions.start_all().await.unwrap();
	assert_eq!(report.custom_puppets_started, 1);
	assert!(report.custom_puppet_failures.is_empty());
	assert_eq!(*h.sink.custom_puppets.lock(), vec![RemoteId::user("88")]);
}

#[tokio::test]
async fn custom_puppet_failures_are_reported_per_puppet() {
	let h = Harness::new(FakeConnector::new()).await;
	let mut row = PuppetRow::new(RemoteId::user("88"));
	row.custom_mxid = Some(local_user("eighty-eight"));
	row.access_token = SecretString::new("tok");
	h.db.puppets().insert(&row).await.unwrap();
	h.sink
		.fail_custom_puppets
		.store(true, std::sync::atomic::Ordering::SeqCst);

	let report = h.sessions.start_all().await.unwrap();
	assert_eq!(report.custom_puppets_started, 0);
	assert_eq!(report.custom_puppet_failures.len(), 1);
	assert_eq!(report.custom_puppet_failures[0].id, RemoteId::user("88").to_string());
}

#[tokio::test]
async fn connect_requires_a_remote_account() {
	let h = Harness::new(FakeConnector::new()).await;
	let user = h.user("nobody", None).await;
	let err = h.sessions.connect(&user).await.unwrap_err();
	assert!(matches!(err, SessionError::NotConfigured(_)));
	assert_eq!(user.session_state(), SessionState::Unconfigured);
}

#[tokio::test]
async fn concurrent_connect_is_a_no_op() {
	let h = Harness::new(FakeConnector::new().with_open_delay(Duration::from_millis(50))).await;
	let user = h.user("a", Some("1")).await;

	let (first, second) = tokio::join!(h.sessions.connect(&user), h.sessions.connect(&user));
	let mut outcomes = vec![first.unwrap(), second.unwrap()];
	outcomes.sort_by_key(|o| *o == ConnectOutcome::Connected);
	assert_eq!(outcomes, vec![ConnectOutcome::AlreadyActive, ConnectOutcome::Connected]);
	assert_eq!(h.connector.opens(), 1);

	assert_eq!(
		h.sessions.connect(&user).await.unwrap(),
		ConnectOutcome::AlreadyActive
	);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
	let h = Harness::new(FakeConnector::new()).await;
	let user = h.connected_user("a", "1").await;
	let session = h.connector.session("1").unwrap();
	assert!(user.is_connected());

	assert!(h.sessions.disconnect(&user).await);
	assert!(!h.sessions.disconnect(&user).await);
	assert_eq!(user.session_state(), SessionState::Disconnected);
	assert_eq!(session.disconnects(), 1);

	let idle = h.user("idle", None).await;
	assert!(!h.sessions.disconnect(&idle).await);
	assert_eq!(idle.session_state(), SessionState::Unconfigured);
}

#[tokio::test]
async fn disconnect_during_connect_cancels_it() {
	let h = Harness::new(FakeConnector::new().with_open_delay(Duration::from_millis(100))).await;
	let user = h.user("a", Some("1")).await;

	let sessions = Arc::clone(&h.sessions);
	let connecting = Arc::clone(&user);
	let task = tokio::spawn(async move { sessions.connect(&connecting).await });
	assert!(wait_until(WAIT, || user.session_state() == SessionState::Connecting).await);

	h.sessions.disconnect(&user).await;
	let err = task.await.unwrap().unwrap_err();
	assert!(matches!(err, SessionError::Cancelled));
	assert_eq!(user.session_state(), SessionState::Disconnected);
	assert!(!h.connector.session("1").unwrap().is_connected_now());
}

#[tokio::test]
async fn dropped_transport_reconnects() {
	let h = Harness::new(FakeConnector::new()).await;
	let user = h.connected_user("a", "1").await;
	let session = h.connector.session("1").unwrap();

	session.fail_next_connects(1);
	session
		.emit(RemoteEvent::Disconnected {
			error: "socket closed".to_string(),
		})
		.await;

	let mxid = user.mxid().clone();
	assert!(
		wait_until(WAIT, || {
			session.connects() == 3
				&& user.is_connected()
				&& h.sink.states_for(Some(&mxid)).last() == Some(&StateEvent::Connected)
		})
		.await
	);
	assert!(h.sink.states_for(Some(&mxid)).contains(&StateEvent::TransientDisconnect));
}

#[tokio::test]
async fn reconnect_gives_up_after_bounded_attempts() {
	let h = Harness::new(FakeConnector::new()).await;
	let user = h.connected_user("a", "1").await;
	let session = h.connector.session("1").unwrap();

	session.fail_next_connects(u32::MAX);
	session
		.emit(RemoteEvent::Disconnected {
			error: "socket closed".to_string(),
		})
		.await;

	let mxid = user.mxid().clone();
	assert!(
		wait_until(WAIT, || {
			user.session_state() == SessionState::Disconnected
				&& h.sink.states_for(Some(&mxid)).last() == Some(&StateEvent::UnknownError)
		})
		.await
	);
	// One initial connect plus three retries.
	assert_eq!(session.connects(), 4);
	assert!(user.remote_session().is_none());

	// A later explicit connect opens a fresh transport.
	assert_eq!(
		h.sessions.connect(&user).await.unwrap(),
		ConnectOutcome::Connected
	);
	assert_eq!(h.connector.opens(), 2);
}

#[tokio::test]
async fn login_is_refused_while_blocked() {
	let limits = LimitSettings {
		max_puppet_limit: 0,
		block_on_limit_reached: true,
		..LimitSettings::default()
	};
	let h = Harness::with(FakeConnector::new(), limits, fast_policy(1)).await;
	let now = unix_now();
	let mut row = PuppetRow::new(RemoteId::user("5"));
	row.first_activity_ts = Some(now - 10 * 24 * 60 * 60);
	row.last_activity_ts = Some(now);
	h.db.puppets().insert(&row).await.unwrap();
	assert!(h.activity.recompute().await.unwrap().is_blocked);

	let user = h.user("a", None).await;
	let err = h.sessions.login(&user, RemoteId::user("1")).await.unwrap_err();
	assert!(matches!(err, SessionError::CapacityReached));
	assert_eq!(user.remote_id().await, None);
	assert_eq!(h.connector.opens(), 0);
}

#[tokio::test]
async fn login_then_logout() {
	let h = Harness::new(FakeConnector::new()).await;
	let user = h.user("a", None).await;
	let remote = RemoteId::user("1");

	assert_eq!(
		h.sessions.login(&user, remote.clone()).await.unwrap(),
		ConnectOutcome::Connected
	);
	assert!(user.is_connected());
	let found = h.registry.get_user_by_remote(&remote).await.unwrap().unwrap();
	assert!(Arc::ptr_eq(&found, &user));

	h.sessions.logout(&user).await.unwrap();
	assert_eq!(user.session_state(), SessionState::Unconfigured);
	assert_eq!(user.remote_id().await, None);
	assert!(h.registry.get_user_by_remote(&remote).await.unwrap().is_none());
	assert_eq!(
		h.sink.states_for(Some(user.mxid())).last(),
		Some(&StateEvent::LoggedOut)
	);
	assert!(!h.connector.session("1").unwrap().is_connected_now());
}

#[tokio::test]
async fn remote_logout_forgets_the_account() {
	let h = Harness::new(FakeConnector::new()).await;
	let user = h.connected_user("a", "1").await;
	let session = h.connector.session("1").unwrap();

	session
		.emit(RemoteEvent::LoggedOut {
			reason: "device removed".to_string(),
		})
		.await;

	assert!(wait_until(WAIT, || user.session_state() == SessionState::Unconfigured).await);
	assert_eq!(user.remote_id().await, None);
	assert!(!session.is_connected_now());
	assert_eq!(
		h.db.users().get_by_mxid(user.mxid()).await.unwrap().unwrap().remote_id,
		None
	);
}

#[tokio::test]
async fn messages_touch_portal_and_puppet_activity() {
	let h = Harness::new(FakeConnector::new()).await;
	h.connected_user("a", "1").await;
	let session = h.connector.session("1").unwrap();

	session
		.emit(RemoteEvent::Message {
			chat: RemoteId::user("55"),
			sender: RemoteId::user("55"),
			timestamp: 1_234,
		})
		.await;

	let mut stored = None;
	for _ in 0..200 {
		stored = h.db.puppets().get(&RemoteId::user("55")).await.unwrap();
		if stored.as_ref().is_some_and(|p| p.last_activity_ts == Some(1_234)) {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	let stored = stored.expect("puppet created");
	assert_eq!(stored.first_activity_ts, Some(1_234));
	assert_eq!(stored.last_activity_ts, Some(1_234));

	let key = PortalKey::new(RemoteId::user("55"), RemoteId::user("1"));
	assert!(h.db.portals().get_by_key(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn presence_is_forwarded_only_when_enabled() {
	let h = Harness::new(FakeConnector::new()).await;
	h.connected_user("a", "1").await;
	let session = h.connector.session("1").unwrap();

	let quiet = h
		.registry
		.get_or_create_puppet(&RemoteId::user("7"))
		.await
		.unwrap()
		.unwrap();
	quiet.update(|row| row.enable_presence = false).await.unwrap();

	for sender in ["7", "8"] {
		session
			.emit(RemoteEvent::Presence {
				sender: RemoteId::user(sender),
				available: true,
				last_seen: None,
			})
			.await;
	}

	assert!(wait_until(WAIT, || !h.sink.presence.lock().is_empty()).await);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(*h.sink.presence.lock(), vec![(RemoteId::user("8"), true)]);
}

#[tokio::test]
async fn phone_seen_updates_the_user() {
	let h = Harness::new(FakeConnector::new()).await;
	let user = h.connected_user("a", "1").await;
	let session = h.connector.session("1").unwrap();

	session.emit(RemoteEvent::PhoneSeen { at: SystemTime::now() }).await;

	let mut seen = None;
	for _ in 0..200 {
		seen = user.snapshot().await.phone_last_seen;
		if seen.is_some() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(seen.is_some());
	let stored = h.db.users().get_by_mxid(user.mxid()).await.unwrap().unwrap();
	assert_eq!(
		stored.phone_last_seen.map(|t| t.timestamp()),
		seen.map(|t| t.timestamp())
	);
}

#[tokio::test]
async fn shutdown_stops_sessions_and_refuses_new_ones() {
	let h = Harness::new(FakeConnector::new()).await;
	let a = h.connected_user("a", "1").await;
	let b = h.user("b", Some("2")).await;

	h.sessions.stop_accepting();
	assert!(matches!(
		h.sessions.connect(&b).await.unwrap_err(),
		SessionError::ShuttingDown
	));

	h.sessions.disconnect_all().await;
	assert_eq!(a.session_state(), SessionState::Stopped);
	assert_eq!(b.session_state(), SessionState::Stopped);
	assert!(!h.connector.session("1").unwrap().is_connected_now());
}
