//! Kiln backend services.
//!
//! The services here own every row of the shared store. Workers and
//! front ends only talk to the store through them.

use std::sync::Arc;

use branch::{BranchError, BranchService};
use config::BackendConfig;
use database::{DatabaseError, DatabaseService};
use job_queue::{JobQueue, JobQueueError};
use kiln_backend_model::job::JobPayloadError;
use package::PackageService;
use package_target::{PackageTargetError, PackageTargetService};
use target::{TargetError, TargetService};
use thiserror::Error;

pub mod branch;
pub mod config;
pub mod database;
pub mod job_queue;
pub mod package;
pub mod package_target;
pub mod target;

/// Service container for Kiln backends.
///
/// All services are wrapped with [`Arc`].
#[derive(Debug, Clone)]
pub struct BackendServices {
	pub config: Arc<BackendConfig>,
	pub target: Arc<TargetService>,
	pub database: Arc<DatabaseService>,
	pub job_queue: Arc<JobQueue>,
	pub branch: Arc<BranchService>,
	pub package: Arc<PackageService>,
	pub package_target: Arc<PackageTargetService>,
}

impl BackendServices {
	#[tracing::instrument(skip(config))]
	pub async fn new(config: BackendConfig) -> Result<Self> {
		let config = Arc::new(config);
		let target = Arc::new(TargetService::new(&config.target)?);
		let database = Arc::new(DatabaseService::new(&config.database).await?);
		let job_queue = Arc::new(JobQueue::new(database.clone(), config.job_queue.clone()));
		let branch = Arc::new(BranchService::new(database.clone(), job_queue.clone()));
		let package = Arc::new(PackageService::new(
			database.clone(),
			job_queue.clone(),
			target.clone(),
		));
		let package_target = Arc::new(PackageTargetService::new(
			database.clone(),
			job_queue.clone(),
			package.clone(),
			target.clone(),
		));

		Ok(Self {
			config,
			target,
			database,
			job_queue,
			branch,
			package,
			package_target,
		})
	}
}

/// Outcome of a status update guarded by the expected previous status.
///
/// A conflict means another writer already moved the row. It is not an
/// error: callers re-read the row if they need to know where it went.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
	Applied,
	Conflict,
}

impl Transition {
	pub(crate) fn from_rows(rows: usize) -> Self {
		if rows == 0 {
			Self::Conflict
		} else {
			Self::Applied
		}
	}

	pub fn is_applied(&self) -> bool {
		matches!(self, Self::Applied)
	}
}

/// Clamps an API priority into the stored column range.
pub(crate) fn clamp_priority(priority: u16) -> i16 {
	priority.min(i16::MAX as u16) as i16
}

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),
	#[error(transparent)]
	DatabaseError(#[from] DatabaseError),
	#[error(transparent)]
	JobQueueError(#[from] JobQueueError),
	#[error(transparent)]
	JobPayloadError(#[from] JobPayloadError),
	#[error(transparent)]
	BranchError(#[from] BranchError),
	#[error(transparent)]
	PackageTargetError(#[from] PackageTargetError),
	#[error(transparent)]
	TargetError(#[from] TargetError),
}

impl BackendError {
	/// Whether the failed operation may succeed when retried later.
	///
	/// Everything else is a validation error and must not be retried.
	pub fn is_transient(&self) -> bool {
		match self {
			BackendError::DatabaseError(err) => err.is_transient(),
			_ => false,
		}
	}
}

/// A specialized [`Result`] for backend errors.
pub type Result<T, E = BackendError> = std::result::Result<T, E>;

impl From<diesel::result::Error> for BackendError {
	fn from(value: diesel::result::Error) -> Self {
		Self::DatabaseError(DatabaseError::QueryError(value))
	}
}

/// In-memory service environments for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
	use crate::{
		database::{DatabaseConfig, SQLITE_MEMORY_URL},
		job_queue::JobQueueConfig,
		target::TargetConfig,
		*,
	};

	/// Services over a fresh in-memory SQLite database.
	///
	/// Two targets are configured: `arch1`, and `arch2` built as `testarch2`.
	pub async fn test_env() -> BackendServices {
		test_env_with(JobQueueConfig::default()).await
	}

	pub async fn test_env_with(job_queue: JobQueueConfig) -> BackendServices {
		let database = DatabaseConfig {
			url: SQLITE_MEMORY_URL.to_string(),
			max_connections: 1,
		};
		test_env_on(database, job_queue).await
	}

	/// Services over the given database, with the test targets.
	pub async fn test_env_on(database: DatabaseConfig, job_queue: JobQueueConfig) -> BackendServices {
		let config = BackendConfig {
			database,
			job_queue,
			target: vec![
				TargetConfig {
					name: "arch1".into(),
					arch: None,
				},
				TargetConfig {
					name: "arch2".into(),
					arch: Some("testarch2".into()),
				},
			],
		};
		BackendServices::new(config)
			.await
			.expect("failed to set up test services")
	}

	#[tokio::test]
	async fn test_init_services() {
		let env = test_env().await;
		assert_eq!(env.target.all().len(), 2);
		assert!(
			env.job_queue
				.poll_claim(&kiln_backend_model::job::JobKind::ALL)
				.await
				.unwrap()
				.is_none()
		);
	}
}
