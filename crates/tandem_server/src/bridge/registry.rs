#![forbid(unsafe_code)]

//! In-memory identity maps for users, puppets and portals.
//!
//! Each map sits behind its own short-lived lock. The lock only guards the
//! lookup of a per-key [`OnceCell`]; loading from the database (or creating
//! and inserting a default row) happens inside that cell's initializer with
//! no map lock held, so concurrent callers for one key share a single
//! initialization while unrelated keys never wait on each other's I/O.
//! Secondary indexes are updated under the same lock as their primary map.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::Mutex;
use tandem_domain::{LocalRoomId, LocalUserId, PortalKey, RemoteId};
use tandem_platform::SecretString;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::bridge::portal::Portal;
use crate::bridge::puppet::Puppet;
use crate::bridge::user::User;
use crate::db::{Database, PortalRow, PuppetRow, UserRow};

type Slot<T> = Arc<OnceCell<Arc<T>>>;

#[derive(Default)]
struct UserMaps {
	by_mxid: HashMap<LocalUserId, Slot<User>>,
	by_remote: HashMap<RemoteId, Arc<User>>,
}

#[derive(Default)]
struct PuppetMaps {
	by_remote: HashMap<RemoteId, Slot<Puppet>>,
	by_custom: HashMap<LocalUserId, Arc<Puppet>>,
}

#[derive(Default)]
struct PortalMaps {
	by_key: HashMap<PortalKey, Slot<Portal>>,
	by_room: HashMap<LocalRoomId, Arc<Portal>>,
}

/// Registry of live bridge entities.
pub struct Registry {
	db: Database,
	users: Mutex<UserMaps>,
	puppets: Mutex<PuppetMaps>,
	portals: Mutex<PortalMaps>,
}

fn live<T>(slots: &HashMap<impl Sized, Slot<T>>) -> Vec<Arc<T>> {
	slots.values().filter_map(|s| s.get().cloned()).collect()
}

impl Registry {
	pub fn new(db: Database) -> Self {
		Self {
			db,
			users: Mutex::new(UserMaps::default()),
			puppets: Mutex::new(PuppetMaps::default()),
			portals: Mutex::new(PortalMaps::default()),
		}
	}

	// ---- users ----

	fn user_slot(&self, mxid: &LocalUserId) -> Slot<User> {
		self.users.lock().by_mxid.entry(mxid.clone()).or_default().clone()
	}

	fn build_user(&self, row: UserRow) -> Arc<User> {
		let remote = row.remote_id.as_ref().map(RemoteId::to_non_ad);
		let user = Arc::new(User::new(row, self.db.users()));
		if let Some(remote) = remote {
			self.users.lock().by_remote.insert(remote, Arc::clone(&user));
		}
		user
	}

	pub async fn get_or_create_user(&self, mxid: &LocalUserId) -> anyhow::Result<Arc<User>> {
		let slot = self.user_slot(mxid);
		let user = slot
			.get_or_try_init(|| async {
				let q = self.db.users();
				let row = match q.get_by_mxid(mxid).await? {
					Some(row) => row,
					None => {
						let row = UserRow::new(mxid.clone());
						q.insert(&row).await?;
						debug!(user = %mxid, "created user");
						row
					}
				};
				anyhow::Ok(self.build_user(row))
			})
			.await?;
		Ok(Arc::clone(user))
	}

	/// Already-loaded user, without touching the database.
	pub fn get_user(&self, mxid: &LocalUserId) -> Option<Arc<User>> {
		self.users.lock().by_mxid.get(mxid).and_then(|s| s.get().cloned())
	}

	pub async fn get_user_by_remote(&self, remote: &RemoteId) -> anyhow::Result<Option<Arc<User>>> {
		let key = remote.to_non_ad();
		let cached = self.users.lock().by_remote.get(&key).cloned();
		if let Some(user) = cached {
			return Ok(Some(user));
		}
		match self.db.users().get_by_remote(&key).await? {
			Some(row) => Ok(Some(self.adopt_user(row).await)),
			None => Ok(None),
		}
	}

	async fn adopt_user(&self, row: UserRow) -> Arc<User> {
		let slot = self.user_slot(&row.mxid);
		Arc::clone(slot.get_or_init(|| async move { self.build_user(row) }).await)
	}

	/// Load every persisted user into the registry.
	pub async fn get_all_users(&self) -> anyhow::Result<Vec<Arc<User>>> {
		let rows = self.db.users().get_all().await.context("load users")?;
		let mut users = Vec::with_capacity(rows.len());
		for row in rows {
			users.push(self.adopt_user(row).await);
		}
		Ok(users)
	}

	/// Every user currently held in memory.
	pub fn loaded_users(&self) -> Vec<Arc<User>> {
		live(&self.users.lock().by_mxid)
	}

	/// Persist a new (or cleared) remote account and move the index entry.
	pub async fn set_user_remote(&self, user: &Arc<User>, remote: Option<RemoteId>) -> anyhow::Result<()> {
		let old = user.remote_id().await;
		let next = remote.clone();
		user.update(move |row| row.remote_id = next).await?;

		let mut maps = self.users.lock();
		if let Some(old) = old {
			let key = old.to_non_ad();
			if maps.by_remote.get(&key).is_some_and(|u| Arc::ptr_eq(u, user)) {
				maps.by_remote.remove(&key);
			}
		}
		if let Some(remote) = remote
			&& let Some(prev) = maps.by_remote.insert(remote.to_non_ad(), Arc::clone(user))
			&& !Arc::ptr_eq(&prev, user)
		{
			warn!(remote = %remote, previous = %prev.mxid(), user = %user.mxid(), "remote account moved to another user");
		}
		Ok(())
	}

	// ---- puppets ----

	fn puppet_slot(&self, remote: &RemoteId) -> Slot<Puppet> {
		self.puppets.lock().by_remote.entry(remote.clone()).or_default().clone()
	}

	fn build_puppet(&self, row: PuppetRow) -> Arc<Puppet> {
		let custom = row.custom_mxid.clone();
		let puppet = Arc::new(Puppet::new(row, self.db.puppets()));
		if let Some(custom) = custom {
			self.puppets.lock().by_custom.insert(custom, Arc::clone(&puppet));
		}
		puppet
	}

	/// Live puppet for a contact. Ids outside the standard-user namespace have none.
	pub async fn get_or_create_puppet(&self, remote: &RemoteId) -> anyhow::Result<Option<Arc<Puppet>>> {
		let id = remote.to_non_ad();
		if !id.is_standard_user() {
			return Ok(None);
		}

		let slot = self.puppet_slot(&id);
		let puppet = slot
			.get_or_try_init(|| async {
				let q = self.db.puppets();
				let row = match q.get(&id).await? {
					Some(row) => row,
					None => {
						let row = PuppetRow::new(id.clone());
						q.insert(&row).await?;
						debug!(puppet = %id, "created puppet");
						row
					}
				};
				anyhow::Ok(self.build_puppet(row))
			})
			.await?;
		Ok(Some(Arc::clone(puppet)))
	}

	async fn adopt_puppet(&self, row: PuppetRow) -> Arc<Puppet> {
		let slot = self.puppet_slot(&row.remote_id);
		Arc::clone(slot.get_or_init(|| async move { self.build_puppet(row) }).await)
	}

	pub async fn get_puppet_by_custom_mxid(&self, mxid: &LocalUserId) -> anyhow::Result<Option<Arc<Puppet>>> {
		let cached = self.puppets.lock().by_custom.get(mxid).cloned();
		if let Some(puppet) = cached {
			return Ok(Some(puppet));
		}
		match self.db.puppets().get_by_custom_mxid(mxid).await? {
			Some(row) => Ok(Some(self.adopt_puppet(row).await)),
			None => Ok(None),
		}
	}

	/// Load every persisted puppet into the registry.
	pub async fn get_all_puppets(&self) -> anyhow::Result<Vec<Arc<Puppet>>> {
		let rows = self.db.puppets().get_all().await.context("load puppets")?;
		let mut puppets = Vec::with_capacity(rows.len());
		for row in rows {
			puppets.push(self.adopt_puppet(row).await);
		}
		Ok(puppets)
	}

	pub async fn get_all_puppets_with_custom_mxid(&self) -> anyhow::Result<Vec<Arc<Puppet>>> {
		let rows = self
			.db
			.puppets()
			.get_all_with_custom_mxid()
			.await
			.context("load custom puppets")?;
		let mut puppets = Vec::with_capacity(rows.len());
		for row in rows {
			puppets.push(self.adopt_puppet(row).await);
		}
		Ok(puppets)
	}

	/// Link (or unlink, with `None`) a local account to a puppet.
	pub async fn set_puppet_custom_mxid(
		&self,
		puppet: &Arc<Puppet>,
		link: Option<(LocalUserId, SecretString)>,
	) -> anyhow::Result<()> {
		let old = puppet.custom_mxid().await;
		let next = link.as_ref().map(|(mxid, _)| mxid.clone());
		puppet
			.update(move |row| {
				let (mxid, token) = match link {
					Some((mxid, token)) => (Some(mxid), token),
					None => (None, SecretString::default()),
				};
				row.custom_mxid = mxid;
				row.access_token = token;
				row.next_batch.clear();
			})
			.await?;

		let mut maps = self.puppets.lock();
		if let Some(old) = old
			&& maps.by_custom.get(&old).is_some_and(|p| Arc::ptr_eq(p, puppet))
		{
			maps.by_custom.remove(&old);
		}
		if let Some(next) = next {
			maps.by_custom.insert(next, Arc::clone(puppet));
		}
		Ok(())
	}

	// ---- portals ----

	fn portal_slot(&self, key: &PortalKey) -> Slot<Portal> {
		self.portals.lock().by_key.entry(key.clone()).or_default().clone()
	}

	fn build_portal(&self, row: PortalRow) -> Arc<Portal> {
		let room = row.mxid.clone();
		let portal = Arc::new(Portal::new(row, self.db.portals()));
		if let Some(room) = room {
			self.portals.lock().by_room.insert(room, Arc::clone(&portal));
		}
		portal
	}

	pub async fn get_or_create_portal(&self, key: &PortalKey) -> anyhow::Result<Arc<Portal>> {
		let slot = self.portal_slot(key);
		let portal = slot
			.get_or_try_init(|| async {
				let q = self.db.portals();
				let row = match q.get_by_key(key).await? {
					Some(row) => row,
					None => {
						let row = PortalRow::new(key.clone());
						q.insert(&row).await?;
						debug!(portal = %key, "created portal");
						row
					}
				};
				anyhow::Ok(self.build_portal(row))
			})
			.await?;
		Ok(Arc::clone(portal))
	}

	pub async fn get_portal_by_room(&self, room: &LocalRoomId) -> anyhow::Result<Option<Arc<Portal>>> {
		let cached = self.portals.lock().by_room.get(room).cloned();
		if let Some(portal) = cached {
			return Ok(Some(portal));
		}
		let Some(row) = self.db.portals().get_by_mxid(room).await? else {
			return Ok(None);
		};
		let slot = self.portal_slot(&row.key);
		Ok(Some(Arc::clone(slot.get_or_init(|| async move { self.build_portal(row) }).await)))
	}

	/// Record the local room created for a portal.
	pub async fn set_portal_room(&self, portal: &Arc<Portal>, room: LocalRoomId) -> anyhow::Result<()> {
		let old = portal.mxid().await;
		let next = room.clone();
		portal.update(move |row| row.mxid = Some(next)).await?;

		let mut maps = self.portals.lock();
		if let Some(old) = old
			&& maps.by_room.get(&old).is_some_and(|p| Arc::ptr_eq(p, portal))
		{
			maps.by_room.remove(&old);
		}
		maps.by_room.insert(room, Arc::clone(portal));
		Ok(())
	}

	/// Drop every in-memory entity.
	pub fn clear(&self) {
		{
			let mut users = self.users.lock();
			users.by_mxid.clear();
			users.by_remote.clear();
		}
		{
			let mut puppets = self.puppets.lock();
			puppets.by_remote.clear();
			puppets.by_custom.clear();
		}
		let mut portals = self.portals.lock();
		portals.by_key.clear();
		portals.by_room.clear();
	}
}
