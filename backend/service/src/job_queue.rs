use std::sync::Arc;

use diesel::{delete, insert_into, prelude::*, update};
use kiln_backend_model::{
	db::{
		BoxedSqlConn,
		schema::{branch, job_queue::dsl, pkg_target},
		utils::{XJsonVal, XUuidVal, now_utc},
	},
	job::{Job, JobCommand, JobKind, JobRef},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::PrimitiveDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Result, clamp_priority, database::DatabaseService};

/// Priority of jobs enqueued without an explicit one.
pub const DEFAULT_PRIORITY: u16 = 100;

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct JobQueueConfig {
	/// Failed attempts after which a retried job is dead-lettered.
	pub max_attempts: u16,
	/// Priority taken from a job each time it is retried.
	pub retry_penalty: u16,
	/// Age after which a claim is considered orphaned.
	pub stale_after_secs: u64,
}

impl Default for JobQueueConfig {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			retry_penalty: 10,
			stale_after_secs: 30 * 60,
		}
	}
}

impl JobQueueConfig {
	pub fn stale_after(&self) -> time::Duration {
		time::Duration::seconds(self.stale_after_secs.min(i64::MAX as u64) as i64)
	}
}

/// What [JobQueue::fail] did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
	/// The claim is cleared and the job can be polled again.
	Requeued,
	/// The job is deleted as requested.
	Dropped,
	/// The job is deleted since it exhausted its attempts.
	DeadLettered,
	/// The job no longer exists.
	Gone,
}

/// Persistent job queue, shared by all workers.
///
/// Workers coordinate through the `started_at` column only: a job is
/// claimed by the single update that moves it from null to a timestamp.
#[derive(Debug)]
pub struct JobQueue {
	db: Arc<DatabaseService>,
	config: JobQueueConfig,
}

impl JobQueue {
	pub fn new(db: Arc<DatabaseService>, config: JobQueueConfig) -> Self {
		Self { db, config }
	}

	pub fn config(&self) -> &JobQueueConfig {
		&self.config
	}

	pub async fn enqueue(&self, conn: &mut BoxedSqlConn, job: JobCommand) -> Result<JobRef> {
		self.enqueue_with_priority(conn, job, DEFAULT_PRIORITY)
			.await
	}

	/// Inserts an unclaimed job.
	///
	/// The entity referenced by the payload must exist. Producers pass
	/// their own connection, so that the job is only visible once their
	/// transaction commits.
	pub async fn enqueue_with_priority(
		&self,
		conn: &mut BoxedSqlConn,
		job: JobCommand,
		priority: u16,
	) -> Result<JobRef> {
		check_reference(conn, &job).await?;

		let id = Uuid::now_v7();
		let (kind, job_data) = job.serialize()?;

		let id = conn
			.get_result::<_, XUuidVal>(
				insert_into(dsl::job_queue)
					.values((
						dsl::id.eq(XUuidVal(id)),
						dsl::kind.eq(kind.as_str()),
						dsl::data.eq(XJsonVal(job_data)),
						dsl::priority.eq(clamp_priority(priority)),
					))
					.returning(dsl::id),
			)
			.await?;
		let id = id.0;
		info!(%kind, %id, priority, "enqueued job");

		Ok(id)
	}

	/// Claims the best unclaimed job of the given kinds.
	///
	/// Jobs are ordered by priority, then by ID. Since IDs are UUID v7,
	/// the latter is the insertion order.
	pub async fn poll_claim(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
		if kinds.is_empty() {
			return Ok(None);
		}
		let kinds = kinds.iter().map(JobKind::as_str).collect::<Vec<_>>();
		let mut conn = self.db.get().await?;

		loop {
			let result = conn
				.get_result::<_, (XUuidVal, String, XJsonVal, i16, i16)>(
					dsl::job_queue
						.limit(1)
						.filter(dsl::started_at.is_null())
						.filter(dsl::kind.eq_any(kinds.clone()))
						.order((dsl::priority.desc(), dsl::id.asc()))
						.select((
							dsl::id,
							dsl::kind,
							dsl::data,
							dsl::priority,
							dsl::attempts,
						)),
				)
				.await
				.optional()?;
			let Some((id, kind, data, priority, attempts)) = result else {
				return Ok(None);
			};

			// read back as stored, since backends truncate timestamps differently
			let claimed_at = conn
				.get_result::<_, Option<PrimitiveDateTime>>(
					update(dsl::job_queue)
						.filter(dsl::id.eq(id).and(dsl::started_at.is_null()))
						.set(dsl::started_at.eq(now_utc()))
						.returning(dsl::started_at),
				)
				.await
				.optional()?
				.flatten();
			let Some(claimed_at) = claimed_at else {
				debug!(%id, "job claimed by another worker, polling again");
				continue;
			};

			let command = match JobCommand::deserialize(&kind, data.0) {
				Ok(command) => command,
				Err(err) => {
					warn!(%id, %kind, %err, "dead-lettering job with malformed payload");
					conn.execute(delete(dsl::job_queue).filter(dsl::id.eq(id)))
						.await?;
					continue;
				}
			};
			info!(%id, %kind, "claimed job");
			return Ok(Some(Job {
				id: id.0,
				command,
				priority,
				attempts: attempts.max(0) as u16,
				claimed_at,
			}));
		}
	}

	/// Deletes a finished job.
	///
	/// Completing a job that no longer exists is a no-op.
	pub async fn complete(&self, conn: &mut BoxedSqlConn, id: JobRef) -> Result<()> {
		let cols = conn
			.execute(delete(dsl::job_queue).filter(dsl::id.eq(XUuidVal(id))))
			.await?;
		if cols == 0 {
			warn!(%id, "completed job had already been removed");
		} else {
			info!(%id, "completed job");
		}
		Ok(())
	}

	/// Gives up the claim of a job.
	///
	/// With `retry`, the job becomes pollable again with a lowered priority,
	/// unless it has reached the configured maximum of attempts.
	///
	/// Only the current claim of the job can be given up. If the claim was
	/// reaped meanwhile, the job is left alone and `Gone` is returned.
	pub async fn fail(&self, conn: &mut BoxedSqlConn, job: &Job, retry: bool) -> Result<FailOutcome> {
		let max_attempts = self.config.max_attempts;
		let penalty = clamp_priority(self.config.retry_penalty);
		let id = job.id;
		let claimed_at = job.claimed_at;

		conn.transaction::<_, crate::BackendError, _>(async |conn| {
			let claimed = dsl::id
				.eq(XUuidVal(id))
				.and(dsl::started_at.eq(claimed_at));
			let row = conn
				.get_result::<_, (i16, i16)>(
					dsl::job_queue
						.filter(claimed)
						.select((dsl::priority, dsl::attempts)),
				)
				.await
				.optional()?;
			let Some((priority, attempts)) = row else {
				debug!(%id, "failed job had already been removed or reclaimed");
				return Ok(FailOutcome::Gone);
			};

			let attempts = (attempts.max(0) as u16).saturating_add(1);
			if retry && attempts < max_attempts {
				conn.execute(
					update(dsl::job_queue)
						.filter(claimed)
						.set((
							dsl::started_at.eq(None::<PrimitiveDateTime>),
							dsl::attempts.eq(attempts.min(i16::MAX as u16) as i16),
							dsl::priority.eq(priority.saturating_sub(penalty).max(0)),
						)),
				)
				.await?;
				info!(%id, attempts, "requeued failed job");
				return Ok(FailOutcome::Requeued);
			}

			conn.execute(delete(dsl::job_queue).filter(claimed))
				.await?;
			if retry {
				warn!(%id, attempts, "dead-lettered job after too many attempts");
				Ok(FailOutcome::DeadLettered)
			} else {
				info!(%id, "dropped failed job");
				Ok(FailOutcome::Dropped)
			}
		})
		.await
	}

	/// Clears claims older than `max_age`.
	///
	/// This is the only way to recover jobs of crashed workers.
	pub async fn reap_stale_claims(&self, max_age: time::Duration) -> Result<usize> {
		let mut conn = self.db.get().await?;
		let cutoff = now_utc() - max_age;
		let cols = conn
			.execute(
				update(dsl::job_queue)
					.filter(dsl::started_at.lt(cutoff))
					.set(dsl::started_at.eq(None::<PrimitiveDateTime>)),
			)
			.await?;
		if cols != 0 {
			warn!(count = cols, "reaped stale job claims");
		}
		Ok(cols)
	}

	/// Counts unclaimed jobs of the given kinds, up to `limit`.
	pub async fn count_pending(&self, kinds: &[JobKind], limit: usize) -> Result<usize> {
		let kinds = kinds.iter().map(JobKind::as_str).collect::<Vec<_>>();
		let mut conn = self.db.get().await?;
		let ids = conn
			.load::<_, XUuidVal>(
				dsl::job_queue
					.filter(dsl::started_at.is_null())
					.filter(dsl::kind.eq_any(kinds))
					.select(dsl::id)
					.limit(limit.min(i64::MAX as usize) as i64),
			)
			.await?;
		Ok(ids.len())
	}
}

/// Checks that the entity referenced by a job exists.
///
/// The queue has no foreign keys, so this is the only guard against
/// jobs pointing to nothing.
async fn check_reference(conn: &mut BoxedSqlConn, job: &JobCommand) -> Result<()> {
	let found = match job {
		JobCommand::SyncBranch(id) => {
			conn.get_result::<_, i64>(branch::table.filter(branch::id.eq(*id)).count())
				.await?
		}
		JobCommand::BuildTarget(id) => {
			conn.get_result::<_, i64>(
				pkg_target::table
					.filter(pkg_target::id.eq(XUuidVal(*id)))
					.count(),
			)
			.await?
		}
	};
	if found == 0 {
		return Err(JobQueueError::DanglingReference(job.clone()).into());
	}
	Ok(())
}

#[derive(Debug, Error)]
pub enum JobQueueError {
	#[error("job {0:?} refers to a missing entity")]
	DanglingReference(JobCommand),
}
