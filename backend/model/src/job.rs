use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{branch::BranchRef, package::PackageTargetRef};

/// Discriminator of a job, stored in the `kind` column.
///
/// Each kind has its own payload schema, see [JobCommand].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
	SyncBranch,
	BuildTarget,
}

impl JobKind {
	pub const ALL: [JobKind; 2] = [JobKind::SyncBranch, JobKind::BuildTarget];

	pub fn as_str(&self) -> &'static str {
		match self {
			JobKind::SyncBranch => "sync-branch",
			JobKind::BuildTarget => "build-target",
		}
	}
}

impl Display for JobKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for JobKind {
	type Err = JobPayloadError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|kind| kind.as_str() == s)
			.ok_or_else(|| JobPayloadError::UnknownKind(s.to_owned()))
	}
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "c", rename_all = "kebab-case")]
pub enum JobCommand {
	/// Synchronize the package set of a branch.
	SyncBranch(BranchRef),
	/// Build a package for a target.
	BuildTarget(PackageTargetRef),
}

impl JobCommand {
	pub fn kind(&self) -> JobKind {
		match self {
			JobCommand::SyncBranch(_) => JobKind::SyncBranch,
			JobCommand::BuildTarget(_) => JobKind::BuildTarget,
		}
	}

	/// Splits the command into its kind and payload columns.
	pub fn serialize(&self) -> Result<(JobKind, serde_json::Value), JobPayloadError> {
		let value = serde_json::to_value(self)?;
		let payload = match value {
			serde_json::Value::Object(mut map) => map.remove("c"),
			_ => None,
		};
		Ok((self.kind(), payload.unwrap_or_default()))
	}

	/// Rebuilds a command from its kind and payload columns.
	pub fn deserialize(kind: &str, value: serde_json::Value) -> Result<Self, JobPayloadError> {
		let kind = JobKind::from_str(kind)?;
		let value = serde_json::json!({ "t": kind.as_str(), "c": value });
		Ok(serde_json::from_value(value)?)
	}
}

#[derive(Debug, Error)]
pub enum JobPayloadError {
	#[error("unknown job kind: {0}")]
	UnknownKind(String),
	#[error("malformed job payload: {0}")]
	Malformed(#[from] serde_json::Error),
}

pub type JobRef = Uuid;

/// A claimed job.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Job {
	pub id: JobRef,
	pub command: JobCommand,
	pub priority: i16,
	/// Count of previously failed attempts.
	pub attempts: u16,
	/// Claim timestamp as stored, identifying this claim of the job.
	///
	/// A reaped and reclaimed job gets a new one.
	pub claimed_at: time::PrimitiveDateTime,
}
