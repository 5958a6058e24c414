#![forbid(unsafe_code)]

//! Relational persistence for users, puppets, portals and scheduled deletions.
//!
//! Every query is written once with `$N` placeholders, which both SQLite and
//! PostgreSQL accept, and dispatched per backend through [`with_pool!`].

pub mod disappearing;
pub mod portal;
pub mod puppet;
pub mod user;

use anyhow::{Context as _, anyhow};
use sqlx::pool::PoolOptions;
use tracing::info;

pub use disappearing::{DisappearingMessage, DisappearingQuery};
pub use portal::{PortalQuery, PortalRow};
pub use puppet::{PuppetQuery, PuppetRow};
pub use user::{UserQuery, UserRow};

/// Shared handle over the bridge database.
#[derive(Clone, Debug)]
pub struct Database {
	backend: Backend,
}

#[derive(Clone, Debug)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Run `$body` against whichever pool backs `$db`.
macro_rules! with_pool {
	($db:expr, $pool:ident => $body:expr) => {
		match &$db.backend {
			$crate::db::Backend::Sqlite($pool) => $body,
			$crate::db::Backend::Postgres($pool) => $body,
		}
	};
}
pub(crate) use with_pool;

impl Database {
	/// Connect and bring the schema up to date.
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Every connection to `:memory:` is its own database.
			let max = if database_url.contains(":memory:") { 1 } else { max_connections };
			let pool = PoolOptions::<sqlx::Sqlite>::new()
				.max_connections(max)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			info!(max_connections = max, "database ready (sqlite)");

			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PoolOptions::<sqlx::Postgres>::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			info!(max_connections, "database ready (postgres)");

			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database url (use sqlite: or postgres:)"))
		}
	}

	pub fn puppets(&self) -> PuppetQuery {
		PuppetQuery::new(self.clone())
	}

	pub fn users(&self) -> UserQuery {
		UserQuery::new(self.clone())
	}

	pub fn portals(&self) -> PortalQuery {
		PortalQuery::new(self.clone())
	}

	pub fn disappearing(&self) -> DisappearingQuery {
		DisappearingQuery::new(self.clone())
	}

	pub async fn close(&self) {
		with_pool!(self, pool => pool.close().await)
	}
}

#[cfg(test)]
mod db_tests;
