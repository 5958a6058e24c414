#![forbid(unsafe_code)]

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::LimitSettings;
use crate::db::PuppetQuery;
use crate::util::time::unix_now;

/// Active-puppet count and the admission decision derived from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivitySnapshot {
	pub current_count: u32,
	pub max_count: u32,
	pub is_blocked: bool,
}

/// Whether a puppet with the given activity span counts as active at `now`.
///
/// Spans shorter than the minimum are noise; spans at or beyond the
/// inactivity window are excluded as well.
pub fn is_active(first: i64, last: i64, now: i64, limits: &LimitSettings) -> bool {
	let min_active = limits.min_puppet_active.as_secs() as i64;
	let max_window = limits.puppet_inactivity.as_secs() as i64;

	let span = last - first;
	let inactive = now - last > max_window;
	!inactive && min_active < span && span < max_window
}

pub fn count_active(spans: &[(i64, i64)], now: i64, limits: &LimitSettings) -> u32 {
	spans
		.iter()
		.filter(|(first, last)| is_active(*first, *last, now, limits))
		.count() as u32
}

/// Rolling active-puppet counter backing admission control.
pub struct PuppetActivity {
	db: PuppetQuery,
	limits: LimitSettings,
	snapshot: RwLock<ActivitySnapshot>,
}

impl PuppetActivity {
	pub fn new(db: PuppetQuery, limits: LimitSettings) -> Self {
		Self {
			db,
			limits,
			snapshot: RwLock::new(ActivitySnapshot {
				max_count: limits.max_puppet_limit,
				..ActivitySnapshot::default()
			}),
		}
	}

	pub fn snapshot(&self) -> ActivitySnapshot {
		*self.snapshot.read()
	}

	pub fn is_blocked(&self) -> bool {
		self.snapshot.read().is_blocked
	}

	pub async fn recompute(&self) -> anyhow::Result<ActivitySnapshot> {
		self.recompute_at(unix_now()).await
	}

	/// Recount from the puppet table. On a read error the previous snapshot stays.
	pub async fn recompute_at(&self, now: i64) -> anyhow::Result<ActivitySnapshot> {
		let spans = match self.db.activity_spans().await {
			Ok(spans) => spans,
			Err(e) => {
				warn!(error = %e, "activity recount failed; keeping previous snapshot");
				return Err(e);
			}
		};

		let current_count = count_active(&spans, now, &self.limits);
		let next = ActivitySnapshot {
			current_count,
			max_count: self.limits.max_puppet_limit,
			is_blocked: self.limits.block_on_limit_reached && current_count > self.limits.max_puppet_limit,
		};

		let prev = std::mem::replace(&mut *self.snapshot.write(), next);

		metrics::gauge!("tandem_server_active_puppets").set(current_count as f64);
		metrics::gauge!("tandem_server_puppet_limit_blocked").set(if next.is_blocked { 1.0 } else { 0.0 });

		if prev.is_blocked != next.is_blocked {
			info!(
				active = current_count,
				limit = next.max_count,
				blocked = next.is_blocked,
				"puppet admission state changed"
			);
		}
		Ok(next)
	}
}
