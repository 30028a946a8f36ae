use serde::{Deserialize, Serialize};

/// State of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BranchStatus {
	/// State for branches waiting for a synchronization job.
	///
	/// In this state, a sync job is outstanding for the branch.
	Pending,
	/// State for branches being synchronized by a worker.
	Syncing,
	/// State for branches whose package set is up-to-date.
	///
	/// Only in this state, the branch is picked up by scheduled re-syncs.
	Active,
	/// State for branches with branch-level errors.
	///
	/// The last-known-good package set is kept untouched.
	/// This usually requires manual restart by users.
	Error { reason: String },
	/// State for branches paused by maintainers.
	///
	/// Only on a maintainer's command, a branch enters this state.
	/// And, only on maintainer's command, a suspended branch resumes into pending state.
	Suspended { reason: String },
}

/// Tracking rules indicating how should we track packages in a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
	/// Re-synchronize the branch periodically.
	#[default]
	Auto,
	/// Only synchronize on explicit requests.
	Unmanaged,
}

/// Reporting view of a tracked branch.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
	pub id: i64,
	pub name: String,
	/// Name of the base branch.
	pub base: Option<String>,
	pub status: BranchStatus,
	pub priority: u16,
	pub tracking_mode: TrackingMode,
	/// Hex-encoded last synchronized commit.
	pub commit: Option<String>,
	pub packages: u32,
}
