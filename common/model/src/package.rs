use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackageStatus {
	/// The package definition has been recorded by a branch sync.
	Discovered,
	/// Build targets are created and wait for the branch to be active.
	Queued,
	/// Build jobs are enqueued for all pending targets.
	Dispatched,
	/// At least one target is pending or being built.
	Building,
	/// All targets are built.
	Built,
	/// A catalog-level error, or a failed target with nothing left to build.
	Error { reason: String },
	/// Retired by a later sync. Kept for history.
	Superseded,
}

/// State of a (package, target).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetStatus {
	Pending,
	Claimed,
	Building,
	Built,
	Failed { reason: String },
	Superseded,
}

/// Reporting view of a package.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
	pub id: Uuid,
	pub branch: i64,
	pub name: String,
	pub section: String,
	pub status: PackageStatus,
	pub data: serde_json::Value,
}

/// Reporting view of a (package, target).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PackageTargetInfo {
	pub id: Uuid,
	pub package: Uuid,
	/// Name of the target, if it is still configured.
	pub target: Option<String>,
	pub status: TargetStatus,
	pub data: serde_json::Value,
}
