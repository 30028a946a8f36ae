use diesel::{Queryable, Selectable};
use kiln_common_model::branch::{BranchStatus, TrackingMode};

use crate::db::schema;

pub type BranchRef = i64;

/// State of a branch.
///
/// Stored as a small integer column. Unknown values are decoded as suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SqlBranchStatus {
	/// State for branches waiting for synchronization.
	///
	/// On entering this state, the caller must enqueue
	/// a branch synchronization job to transform the branch
	/// into next state.
	Pending = 0,
	/// State for branches being synchronized.
	///
	/// Entered when a worker claims the sync job of this branch.
	Syncing = 1,
	/// State for branches with an up-to-date package set.
	///
	/// On entering this state, the caller ensures all packages of this
	/// branch are refreshed, and no branch-level errors are found.
	Active = 2,
	/// State for branches with branch-level errors.
	///
	/// When a sync fails, a branch transforms into this state.
	/// Packages from the last successful sync are kept untouched.
	Error = 3,
	/// State for branches paused by maintainers.
	///
	/// Only on a maintainer's command, a branch enters this state.
	/// And, only on maintainer's command, a suspended branch resumes into pending state.
	Suspended = 4,
}

impl SqlBranchStatus {
	/// States from which a sync may be requested.
	///
	/// `Pending` and `Syncing` are excluded: a sync is already outstanding.
	pub const REQUEST_SYNC_FROM: [SqlBranchStatus; 2] = [Self::Active, Self::Error];

	/// States from which a claimed sync job may start syncing.
	pub const BEGIN_SYNC_FROM: [SqlBranchStatus; 3] = [Self::Pending, Self::Active, Self::Error];

	pub fn into_common(&self, message: Option<String>) -> BranchStatus {
		match self {
			SqlBranchStatus::Pending => BranchStatus::Pending,
			SqlBranchStatus::Syncing => BranchStatus::Syncing,
			SqlBranchStatus::Active => BranchStatus::Active,
			SqlBranchStatus::Error => BranchStatus::Error {
				reason: message.unwrap_or_default(),
			},
			SqlBranchStatus::Suspended => BranchStatus::Suspended {
				reason: message.unwrap_or_default(),
			},
		}
	}
}

impl From<u8> for SqlBranchStatus {
	fn from(value: u8) -> Self {
		Self::from(value as i16)
	}
}

impl From<i16> for SqlBranchStatus {
	fn from(value: i16) -> Self {
		match value {
			0 => Self::Pending,
			1 => Self::Syncing,
			2 => Self::Active,
			3 => Self::Error,
			_ => Self::Suspended,
		}
	}
}

impl From<SqlBranchStatus> for i16 {
	fn from(value: SqlBranchStatus) -> Self {
		value as i16
	}
}

/// Database representation of [TrackingMode].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SqlTrackingMode {
	/// [TrackingMode::Auto]
	Auto = 0,
	/// [TrackingMode::Unmanaged]
	Unmanaged = 1,
}

impl From<u8> for SqlTrackingMode {
	fn from(value: u8) -> Self {
		Self::from(value as i16)
	}
}

impl From<i16> for SqlTrackingMode {
	fn from(value: i16) -> Self {
		match value {
			0 => Self::Auto,
			_ => Self::Unmanaged,
		}
	}
}

impl From<TrackingMode> for SqlTrackingMode {
	fn from(value: TrackingMode) -> Self {
		match value {
			TrackingMode::Auto => Self::Auto,
			TrackingMode::Unmanaged => Self::Unmanaged,
		}
	}
}

impl From<SqlTrackingMode> for TrackingMode {
	fn from(value: SqlTrackingMode) -> Self {
		match value {
			SqlTrackingMode::Auto => Self::Auto,
			SqlTrackingMode::Unmanaged => Self::Unmanaged,
		}
	}
}

/// A full row of the branch table.
#[derive(Debug, PartialEq, Eq, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::branch)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqlBranch {
	pub id: BranchRef,
	pub name: String,
	pub base: Option<BranchRef>,
	pub status: i16,
	pub status_msg: Option<String>,
	pub priority: i16,
	pub tracking: i16,
	pub commit_oid: Option<Vec<u8>>,
	pub total_srcpkgs: i32,
}

impl SqlBranch {
	pub fn status(&self) -> SqlBranchStatus {
		SqlBranchStatus::from(self.status)
	}

	pub fn tracking(&self) -> SqlTrackingMode {
		SqlTrackingMode::from(self.tracking)
	}

	/// Priority for jobs produced on behalf of this branch.
	pub fn job_priority(&self) -> u16 {
		self.priority.max(0) as u16
	}
}
