//! Seams to the external work behind jobs.
//!
//! Syncing a branch and building a package are done by tools outside of
//! this workspace. Runners call them through these traits, holding no
//! database connection meanwhile.

use std::fmt::Debug;

use futures::future::BoxFuture;
use kiln_backend_model::branch::BranchRef;
use kiln_backend_service::{
	package::{BranchSnapshot, CommitOid},
	package_target::BuildRequest,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A branch to read package definitions from.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncRequest {
	pub id: BranchRef,
	pub name: String,
	/// Commit of the last successful sync.
	pub commit: Option<CommitOid>,
}

/// Result of a successful build.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct BuildOutcome {
	/// Build metadata stored on the target, such as artifact names.
	#[serde(default)]
	pub data: serde_json::Value,
}

/// Reads the package set of a branch.
pub trait BranchSyncer: Send + Sync + Debug {
	fn sync<'a>(&'a self, request: &'a SyncRequest) -> BoxFuture<'a, Result<BranchSnapshot, ExecError>>;
}

/// Builds a package for a target.
pub trait TargetBuilder: Send + Sync + Debug {
	fn build<'a>(&'a self, request: &'a BuildRequest) -> BoxFuture<'a, Result<BuildOutcome, ExecError>>;
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ExecError {
	/// A failure worth another attempt, such as a lost builder.
	#[error("{0}")]
	Transient(String),
	#[error("{0}")]
	Permanent(String),
}

impl ExecError {
	pub fn is_transient(&self) -> bool {
		matches!(self, ExecError::Transient(_))
	}
}
