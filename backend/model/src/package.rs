use diesel::{Queryable, Selectable};
use kiln_common_model::package::{PackageStatus, TargetStatus};
use uuid::Uuid;

use crate::{
	branch::BranchRef,
	db::{
		schema,
		utils::{XJsonVal, XUuidVal},
	},
};

pub type PackageRef = Uuid;
pub type PackageTargetRef = Uuid;

/// State of a package.
///
/// Stored as a small integer column. Unknown values are decoded as error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SqlPackageStatus {
	/// State for packages whose definition was just recorded.
	Discovered = 0,
	/// State for packages with pending targets and no build jobs yet.
	///
	/// Build jobs are enqueued once the branch becomes active.
	Queued = 1,
	/// State for packages with build jobs enqueued for every pending target.
	Dispatched = 2,
	/// Aggregate: some target is pending, claimed or building.
	Building = 3,
	/// Aggregate: every target is built.
	Built = 4,
	/// State for packages with source-package-level errors,
	/// or with failed targets and nothing left to build.
	///
	/// No build jobs can be dispatched in this state.
	Error = 5,
	/// State for packages retired by a later branch sync.
	///
	/// Rows in this state are kept for history only.
	/// A reintroduced package gets a new identity.
	Superseded = 6,
}

impl From<u8> for SqlPackageStatus {
	fn from(value: u8) -> Self {
		Self::from(value as i16)
	}
}

impl From<i16> for SqlPackageStatus {
	fn from(value: i16) -> Self {
		match value {
			0 => Self::Discovered,
			1 => Self::Queued,
			2 => Self::Dispatched,
			3 => Self::Building,
			4 => Self::Built,
			6 => Self::Superseded,
			_ => Self::Error,
		}
	}
}

impl From<SqlPackageStatus> for i16 {
	fn from(value: SqlPackageStatus) -> Self {
		value as i16
	}
}

impl SqlPackageStatus {
	pub fn into_common(&self, message: Option<String>) -> PackageStatus {
		match self {
			Self::Discovered => PackageStatus::Discovered,
			Self::Queued => PackageStatus::Queued,
			Self::Dispatched => PackageStatus::Dispatched,
			Self::Building => PackageStatus::Building,
			Self::Built => PackageStatus::Built,
			Self::Error => PackageStatus::Error {
				reason: message.unwrap_or_default(),
			},
			Self::Superseded => PackageStatus::Superseded,
		}
	}
}

/// State of a (package, target).
///
/// Stored as a small integer column. Unknown values are decoded as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SqlPackageTargetStatus {
	/// Waiting for a build job to be claimed.
	#[default]
	Pending = 0,
	/// A worker claimed the build job.
	Claimed = 1,
	/// The build is running.
	Building = 2,
	Built = 3,
	/// The build failed and no retry is left.
	///
	/// Only an explicit retry or a new branch sync leaves this state.
	Failed = 4,
	/// Retired by a later branch sync.
	Superseded = 5,
}

impl From<u8> for SqlPackageTargetStatus {
	fn from(value: u8) -> Self {
		Self::from(value as i16)
	}
}

impl From<i16> for SqlPackageTargetStatus {
	fn from(value: i16) -> Self {
		match value {
			0 => Self::Pending,
			1 => Self::Claimed,
			2 => Self::Building,
			3 => Self::Built,
			5 => Self::Superseded,
			_ => Self::Failed,
		}
	}
}

impl From<SqlPackageTargetStatus> for i16 {
	fn from(value: SqlPackageTargetStatus) -> Self {
		value as i16
	}
}

impl SqlPackageTargetStatus {
	/// States holding a build in flight.
	pub const IN_FLIGHT: [SqlPackageTargetStatus; 2] = [Self::Claimed, Self::Building];

	/// Whether a build for this target is still expected.
	pub fn is_unfinished(&self) -> bool {
		matches!(self, Self::Pending | Self::Claimed | Self::Building)
	}

	pub fn into_common(&self, message: Option<String>) -> TargetStatus {
		match self {
			Self::Pending => TargetStatus::Pending,
			Self::Claimed => TargetStatus::Claimed,
			Self::Building => TargetStatus::Building,
			Self::Built => TargetStatus::Built,
			Self::Failed => TargetStatus::Failed {
				reason: message.unwrap_or_default(),
			},
			Self::Superseded => TargetStatus::Superseded,
		}
	}
}

/// Computes the status of a package from the statuses of its targets.
///
/// Superseded targets are ignored. Returns `None` when no live target
/// exists, in which case the package status is not derived from targets.
pub fn aggregate_status<I>(targets: I) -> Option<SqlPackageStatus>
where
	I: IntoIterator<Item = SqlPackageTargetStatus>,
{
	let mut live = false;
	let mut failed = false;
	for status in targets {
		match status {
			SqlPackageTargetStatus::Superseded => continue,
			status if status.is_unfinished() => return Some(SqlPackageStatus::Building),
			SqlPackageTargetStatus::Failed => failed = true,
			_ => {}
		}
		live = true;
	}
	match (live, failed) {
		(false, _) => None,
		(true, true) => Some(SqlPackageStatus::Error),
		(true, false) => Some(SqlPackageStatus::Built),
	}
}

/// A full row of the package table.
#[derive(Debug, PartialEq, Eq, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::pkg)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqlPackage {
	pub id: XUuidVal,
	pub branch: BranchRef,
	pub name: String,
	pub section: String,
	pub status: i16,
	pub status_msg: Option<String>,
	pub data: XJsonVal,
}

impl SqlPackage {
	pub fn status(&self) -> SqlPackageStatus {
		SqlPackageStatus::from(self.status)
	}
}

/// A full row of the package target table.
#[derive(Debug, PartialEq, Eq, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::pkg_target)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqlPackageTarget {
	pub id: XUuidVal,
	pub branch: BranchRef,
	pub package: XUuidVal,
	pub target: XUuidVal,
	pub status: i16,
	pub status_msg: Option<String>,
	pub data: XJsonVal,
}

impl SqlPackageTarget {
	pub fn status(&self) -> SqlPackageTargetStatus {
		SqlPackageTargetStatus::from(self.status)
	}
}

#[cfg(test)]
mod test {
	use super::{SqlPackageStatus as P, SqlPackageTargetStatus as T, *};

	#[test]
	fn test_aggregate_status() {
		assert_eq!(aggregate_status([T::Built, T::Built]), Some(P::Built));
		assert_eq!(aggregate_status([T::Built, T::Failed]), Some(P::Error));
		assert_eq!(aggregate_status([T::Pending, T::Built]), Some(P::Building));
		assert_eq!(aggregate_status([T::Failed, T::Building]), Some(P::Building));
		assert_eq!(aggregate_status([T::Claimed]), Some(P::Building));
	}

	#[test]
	fn test_aggregate_ignores_superseded() {
		assert_eq!(aggregate_status([T::Superseded, T::Built]), Some(P::Built));
		assert_eq!(aggregate_status([T::Superseded, T::Failed]), Some(P::Error));
		assert_eq!(aggregate_status([T::Superseded]), None);
		assert_eq!(aggregate_status([]), None);
	}

	#[test]
	fn test_status_decoding() {
		assert_eq!(P::from(i16::from(P::Superseded)), P::Superseded);
		assert_eq!(P::from(99i16), P::Error);
		assert_eq!(T::from(i16::from(T::Superseded)), T::Superseded);
		assert_eq!(T::from(99i16), T::Failed);
	}
}
