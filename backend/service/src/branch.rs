use std::{collections::HashMap, sync::Arc};

use diesel::{
	ExpressionMethods, OptionalExtension, QueryDsl, delete, insert_into,
	prelude::AsChangeset,
	update,
};
use kiln_backend_model::{
	branch::{BranchRef, SqlBranch, SqlBranchStatus, SqlTrackingMode},
	db::{
		BoxedSqlConn,
		schema::{self, branch::dsl, pkg},
	},
	job::JobCommand,
};
use kiln_common_model::branch::{BranchInfo, TrackingMode};
use kstring::KString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
	Result, Transition, clamp_priority, database::DatabaseService, job_queue::JobQueue,
};

/// Longest accepted branch name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug)]
pub struct BranchService {
	db: Arc<DatabaseService>,
	job_queue: Arc<JobQueue>,
}

impl BranchService {
	pub fn new(db: Arc<DatabaseService>, job_queue: Arc<JobQueue>) -> Self {
		Self { db, job_queue }
	}

	/// Tracks a new branch.
	///
	/// The branch starts as pending, with its first sync job enqueued.
	pub async fn track(&self, name: &str, info: &BranchConfigInfo) -> Result<BranchRef> {
		validate_name(name)?;
		let mut conn = self.db.get().await?;
		let branch = name.to_owned();

		let id = conn
			.transaction::<_, crate::BackendError, _>(async |conn| {
				if find_id(conn, &branch).await?.is_some() {
					return Err(BranchError::AlreadyTracked(KString::from_ref(&branch)).into());
				}
				let base = match info.base.as_deref() {
					Some(base) if !base.is_empty() => Some(find_id_or_err(conn, base).await?),
					_ => None,
				};
				let priority = info.priority.unwrap_or(100);

				let id = conn
					.get_result::<_, i64>(
						insert_into(dsl::branch)
							.values((
								dsl::name.eq(&branch),
								dsl::status.eq(i16::from(SqlBranchStatus::Pending)),
								dsl::base.eq(base),
								dsl::priority.eq(clamp_priority(priority)),
								dsl::tracking.eq(SqlTrackingMode::from(
									info.tracking_mode.unwrap_or_default(),
								) as i16),
							))
							.returning(dsl::id),
					)
					.await?;
				self.job_queue
					.enqueue_with_priority(conn, JobCommand::SyncBranch(id), priority)
					.await?;

				Ok(id)
			})
			.await?;
		info!(branch, id, "tracked branch");

		Ok(id)
	}

	pub async fn find_id<S: AsRef<str>>(&self, name: S) -> Result<Option<BranchRef>> {
		let mut conn = self.db.get().await?;
		find_id(&mut conn, name.as_ref()).await
	}

	pub async fn find_id_or_err<S: AsRef<str>>(&self, name: S) -> Result<BranchRef> {
		let mut conn = self.db.get().await?;
		find_id_or_err(&mut conn, name.as_ref()).await
	}

	pub async fn get(&self, id: BranchRef) -> Result<Option<BranchInfo>> {
		let mut conn = self.db.get().await?;
		let Some(branch) = get_row(&mut conn, id).await? else {
			return Ok(None);
		};
		let base = match branch.base {
			Some(base) => conn
				.get_result::<_, String>(dsl::branch.filter(dsl::id.eq(base)).select(dsl::name))
				.await
				.optional()?,
			None => None,
		};
		Ok(Some(into_info(branch, base)))
	}

	/// Lists all branches, in the order their syncs are scheduled.
	pub async fn list(&self) -> Result<Vec<BranchInfo>> {
		let mut conn = self.db.get().await?;
		let rows: Vec<SqlBranch> = conn
			.load_select(dsl::branch.order((dsl::priority.desc(), dsl::id.asc())))
			.await?;
		let names = rows
			.iter()
			.map(|row| (row.id, row.name.clone()))
			.collect::<HashMap<_, _>>();
		Ok(rows
			.into_iter()
			.map(|row| {
				let base = row.base.and_then(|base| names.get(&base).cloned());
				into_info(row, base)
			})
			.collect())
	}

	/// Untracks a branch.
	///
	/// Only branches that never carried packages can be removed. Others
	/// should be suspended instead.
	pub async fn untrack(&self, id: BranchRef) -> Result<()> {
		let mut conn = self.db.get().await?;

		conn.transaction::<(), crate::BackendError, _>(async |conn| {
			let packages = conn
				.get_result::<_, i64>(pkg::table.filter(pkg::branch.eq(id)).count())
				.await?;
			if packages != 0 {
				return Err(BranchError::BranchInUse(id).into());
			}
			conn.execute(
				update(dsl::branch)
					.filter(dsl::base.eq(id))
					.set(dsl::base.eq(None::<BranchRef>)),
			)
			.await?;
			non_zero_or_not_found(
				conn.execute(delete(dsl::branch).filter(dsl::id.eq(id)))
					.await?,
				id,
			)?;

			Ok(())
		})
		.await?;
		info!(id, "untracked branch");

		Ok(())
	}

	pub async fn update_config(&self, id: BranchRef, info: &BranchConfigInfo) -> Result<()> {
		let mut conn = self.db.get().await?;
		let base = match &info.base {
			Some(base) if base.is_empty() => Some(None),
			Some(base) => {
				let base = find_id_or_err(&mut conn, base).await?;
				if base == id {
					return Err(BranchError::SelfBase(id).into());
				}
				Some(Some(base))
			}
			None => None,
		};

		let config = SqlBranchConfig {
			base,
			priority: info.priority.map(clamp_priority),
			tracking: info
				.tracking_mode
				.map(|mode| SqlTrackingMode::from(mode) as i16),
		};
		if config.is_empty() {
			// diesel rejects empty change sets
			if get_row(&mut conn, id).await?.is_none() {
				return Err(BranchError::BranchNotFound(id).into());
			}
			return Ok(());
		}

		non_zero_or_not_found(
			conn.execute(update(dsl::branch.filter(dsl::id.eq(id))).set(config))
				.await?,
			id,
		)?;
		info!(id, "updated branch config");
		Ok(())
	}

	/// Pauses a branch.
	///
	/// A sync in flight is not interrupted, but its result is discarded.
	pub async fn suspend(&self, id: BranchRef, reason: &str) -> Result<Transition> {
		let mut conn = self.db.get().await?;
		let transition = Transition::from_rows(
			conn.execute(
				update(dsl::branch)
					.filter(dsl::id.eq(id))
					.filter(dsl::status.ne(i16::from(SqlBranchStatus::Suspended)))
					.set((
						dsl::status.eq(i16::from(SqlBranchStatus::Suspended)),
						dsl::status_msg.eq(reason),
					)),
			)
			.await?,
		);
		self.check_conflict(&mut conn, id, transition, "suspend")
			.await?;
		if transition.is_applied() {
			info!(id, reason, "suspended branch");
		}
		Ok(transition)
	}

	/// Resumes a suspended branch by syncing it again.
	pub async fn resume(&self, id: BranchRef) -> Result<Transition> {
		let mut conn = self.db.get().await?;
		let transition = conn
			.transaction::<_, crate::BackendError, _>(async |conn| {
				let transition = move_status(
					conn,
					id,
					&[SqlBranchStatus::Suspended],
					SqlBranchStatus::Pending,
				)
				.await?;
				if transition.is_applied() {
					self.enqueue_sync(conn, id).await?;
				}
				Ok(transition)
			})
			.await?;
		self.check_conflict(&mut conn, id, transition, "resume")
			.await?;
		if transition.is_applied() {
			info!(id, "resumed branch");
		}
		Ok(transition)
	}

	/// Requests a sync of an active or failed branch.
	///
	/// Returns `false` if a sync is already outstanding, or if the branch
	/// is suspended. At most one sync job exists per branch.
	pub async fn request_sync(&self, id: BranchRef) -> Result<bool> {
		let mut conn = self.db.get().await?;
		let transition = conn
			.transaction::<_, crate::BackendError, _>(async |conn| {
				let transition = move_status(
					conn,
					id,
					&SqlBranchStatus::REQUEST_SYNC_FROM,
					SqlBranchStatus::Pending,
				)
				.await?;
				if transition.is_applied() {
					self.enqueue_sync(conn, id).await?;
				}
				Ok(transition)
			})
			.await?;
		self.check_conflict(&mut conn, id, transition, "request sync")
			.await?;
		Ok(transition.is_applied())
	}

	/// Requests a sync of every active branch tracked automatically.
	///
	/// Returns the number of requested syncs.
	pub async fn schedule_syncs(&self) -> Result<usize> {
		let mut conn = self.db.get().await?;
		let ids = conn
			.load::<_, BranchRef>(
				dsl::branch
					.filter(dsl::status.eq(i16::from(SqlBranchStatus::Active)))
					.filter(dsl::tracking.eq(SqlTrackingMode::Auto as i16))
					.order((dsl::priority.desc(), dsl::id.asc()))
					.select(dsl::id),
			)
			.await?;
		drop(conn);

		let mut requested = 0;
		for id in ids {
			match self.request_sync(id).await {
				Ok(true) => requested += 1,
				Ok(false) => {}
				// untracked meanwhile
				Err(crate::BackendError::BranchError(BranchError::BranchNotFound(_))) => {}
				Err(err) => return Err(err),
			}
		}
		if requested != 0 {
			info!(requested, "scheduled branch syncs");
		}
		Ok(requested)
	}

	/// Moves a branch into syncing, as its sync job is claimed.
	///
	/// A branch already syncing is returned as well, since reaped jobs may
	/// be executed again. Returns `None` if the job should be dropped.
	pub async fn begin_sync(
		&self,
		conn: &mut BoxedSqlConn,
		id: BranchRef,
	) -> Result<Option<SqlBranch>> {
		let transition = move_status(
			conn,
			id,
			&SqlBranchStatus::BEGIN_SYNC_FROM,
			SqlBranchStatus::Syncing,
		)
		.await?;
		let Some(branch) = get_row(conn, id).await? else {
			warn!(id, "sync requested for a missing branch");
			return Ok(None);
		};
		match branch.status() {
			SqlBranchStatus::Syncing => {
				if !transition.is_applied() {
					debug!(id, "branch is already syncing, executing again");
				}
				info!(id, branch = branch.name, "syncing branch");
				Ok(Some(branch))
			}
			status => {
				info!(id, ?status, "branch cannot be synced, dropping job");
				Ok(None)
			}
		}
	}

	/// Marks a sync successful.
	pub async fn finish_sync(
		&self,
		conn: &mut BoxedSqlConn,
		id: BranchRef,
		commit: Option<&[u8]>,
		total_srcpkgs: usize,
	) -> Result<Transition> {
		let transition = Transition::from_rows(
			conn.execute(
				update(dsl::branch)
					.filter(dsl::id.eq(id))
					.filter(dsl::status.eq(i16::from(SqlBranchStatus::Syncing)))
					.set((
						dsl::status.eq(i16::from(SqlBranchStatus::Active)),
						dsl::status_msg.eq(None::<String>),
						dsl::commit_oid.eq(commit),
						dsl::total_srcpkgs.eq(total_srcpkgs.min(i32::MAX as usize) as i32),
					)),
			)
			.await?,
		);
		self.check_conflict(conn, id, transition, "finish sync")
			.await?;
		if transition.is_applied() {
			info!(id, total_srcpkgs, "synchronized branch");
		}
		Ok(transition)
	}

	/// Puts a syncing branch back to pending, as its sync job is retried.
	///
	/// The failure is kept as status message until the next sync ends.
	pub async fn requeue_sync(
		&self,
		conn: &mut BoxedSqlConn,
		id: BranchRef,
		reason: &str,
	) -> Result<Transition> {
		let transition = Transition::from_rows(
			conn.execute(
				update(dsl::branch)
					.filter(dsl::id.eq(id))
					.filter(dsl::status.eq(i16::from(SqlBranchStatus::Syncing)))
					.set((
						dsl::status.eq(i16::from(SqlBranchStatus::Pending)),
						dsl::status_msg.eq(reason),
					)),
			)
			.await?,
		);
		self.check_conflict(conn, id, transition, "requeue sync")
			.await?;
		if transition.is_applied() {
			info!(id, reason, "branch sync will be retried");
		}
		Ok(transition)
	}

	/// Marks a sync failed.
	///
	/// Packages from the last successful sync are left untouched.
	pub async fn fail_sync(
		&self,
		conn: &mut BoxedSqlConn,
		id: BranchRef,
		reason: &str,
	) -> Result<Transition> {
		let transition = Transition::from_rows(
			conn.execute(
				update(dsl::branch)
					.filter(dsl::id.eq(id))
					.filter(dsl::status.eq(i16::from(SqlBranchStatus::Syncing)))
					.set((
						dsl::status.eq(i16::from(SqlBranchStatus::Error)),
						dsl::status_msg.eq(reason),
					)),
			)
			.await?,
		);
		self.check_conflict(conn, id, transition, "fail sync")
			.await?;
		if transition.is_applied() {
			warn!(id, reason, "branch sync failed");
		}
		Ok(transition)
	}

	async fn enqueue_sync(&self, conn: &mut BoxedSqlConn, id: BranchRef) -> Result<()> {
		let priority = conn
			.get_result::<_, i16>(dsl::branch.filter(dsl::id.eq(id)).select(dsl::priority))
			.await?;
		self.job_queue
			.enqueue_with_priority(conn, JobCommand::SyncBranch(id), priority.max(0) as u16)
			.await?;
		Ok(())
	}

	/// Tells a lost race from a missing branch.
	async fn check_conflict(
		&self,
		conn: &mut BoxedSqlConn,
		id: BranchRef,
		transition: Transition,
		action: &str,
	) -> Result<()> {
		if transition.is_applied() {
			return Ok(());
		}
		match get_row(conn, id).await? {
			Some(branch) => {
				debug!(id, action, status = ?branch.status(), "branch transition skipped");
				Ok(())
			}
			None => Err(BranchError::BranchNotFound(id).into()),
		}
	}
}

async fn find_id(conn: &mut BoxedSqlConn, name: &str) -> Result<Option<BranchRef>> {
	Ok(conn
		.get_result(dsl::branch.filter(dsl::name.eq(name)).select(dsl::id))
		.await
		.optional()?)
}

async fn find_id_or_err(conn: &mut BoxedSqlConn, name: &str) -> Result<BranchRef> {
	Ok(find_id(conn, name)
		.await?
		.ok_or_else(|| BranchError::BranchNameNotFound(KString::from_ref(name)))?)
}

async fn get_row(conn: &mut BoxedSqlConn, id: BranchRef) -> Result<Option<SqlBranch>> {
	Ok(conn
		.load_one_select(dsl::branch.limit(1).filter(dsl::id.eq(id)))
		.await
		.optional()?)
}

/// Moves a branch between states, keeping its status message.
///
/// Messages are only replaced by failures, and cleared by a finished sync.
async fn move_status(
	conn: &mut BoxedSqlConn,
	id: BranchRef,
	from: &[SqlBranchStatus],
	to: SqlBranchStatus,
) -> Result<Transition> {
	let from = from.iter().map(|status| i16::from(*status)).collect::<Vec<_>>();
	Ok(Transition::from_rows(
		conn.execute(
			update(dsl::branch)
				.filter(dsl::id.eq(id))
				.filter(dsl::status.eq_any(from))
				.set(dsl::status.eq(i16::from(to))),
		)
		.await?,
	))
}

fn into_info(row: SqlBranch, base: Option<String>) -> BranchInfo {
	BranchInfo {
		id: row.id,
		status: row.status().into_common(row.status_msg.clone()),
		priority: row.job_priority(),
		tracking_mode: row.tracking().into(),
		commit: row.commit_oid.as_deref().map(hex::encode),
		packages: row.total_srcpkgs.max(0) as u32,
		name: row.name,
		base,
	}
}

fn validate_name(name: &str) -> Result<(), BranchError> {
	let valid = !name.is_empty()
		&& name.len() <= MAX_NAME_LEN
		&& !name.starts_with('-')
		&& !name
			.chars()
			.any(|ch| ch.is_whitespace() || ch.is_control());
	if valid {
		Ok(())
	} else {
		Err(BranchError::InvalidName(KString::from_ref(name)))
	}
}

#[derive(Debug, Error)]
pub enum BranchError {
	#[error("branch {0} not found")]
	BranchNameNotFound(KString),
	#[error("branch {0} not found")]
	BranchNotFound(BranchRef),
	#[error("branch {0} is already tracked")]
	AlreadyTracked(KString),
	#[error("invalid branch name: {0:?}")]
	InvalidName(KString),
	#[error("branch {0} still has packages")]
	BranchInUse(BranchRef),
	#[error("branch {0} cannot be its own base")]
	SelfBase(BranchRef),
}

fn non_zero_or_not_found(val: usize, id: BranchRef) -> Result<(), BranchError> {
	if val == 0 {
		Err(BranchError::BranchNotFound(id))
	} else {
		Ok(())
	}
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct BranchConfigInfo {
	/// Name of the base branch of this branch.
	///
	/// Set this to empty string to remove base branch.
	pub base: Option<KString>,
	pub priority: Option<u16>,
	pub tracking_mode: Option<TrackingMode>,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = schema::branch)]
pub struct SqlBranchConfig {
	base: Option<Option<BranchRef>>,
	priority: Option<i16>,
	tracking: Option<i16>,
}

impl SqlBranchConfig {
	fn is_empty(&self) -> bool {
		self.base.is_none() && self.priority.is_none() && self.tracking.is_none()
	}
}

#[cfg(test)]
mod test {
	use diesel::QueryDsl;
	use kiln_backend_model::{
		branch::SqlBranchStatus,
		db::schema::branch::dsl,
		job::{JobCommand, JobKind},
	};
	use kiln_common_model::branch::{BranchStatus, TrackingMode};

	use super::*;
	use crate::testing::test_env;

	const SYNC: [JobKind; 1] = [JobKind::SyncBranch];

	#[tokio::test]
	async fn test_track() {
		let env = test_env().await;
		let id = env
			.branch
			.track("test", &Default::default())
			.await
			.unwrap();

		// assert object
		let mut db = env.database.get().await.unwrap();
		assert_eq!(
			db.get_result::<_, (String, i16)>(dsl::branch.select((dsl::name, dsl::status)))
				.await
				.unwrap(),
			("test".to_string(), 0)
		);
		drop(db);

		// assert sync job
		let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		assert_eq!(job.command, JobCommand::SyncBranch(id));
		assert_eq!(job.priority, 100);
	}

	#[tokio::test]
	async fn test_track_rejects_duplicates_and_bad_names() {
		let env = test_env().await;
		env.branch.track("main", &Default::default()).await.unwrap();
		assert!(matches!(
			env.branch.track("main", &Default::default()).await,
			Err(crate::BackendError::BranchError(BranchError::AlreadyTracked(_)))
		));
		for name in ["", "with space", "-flag"] {
			assert!(matches!(
				env.branch.track(name, &Default::default()).await,
				Err(crate::BackendError::BranchError(BranchError::InvalidName(_)))
			));
		}
		assert!(matches!(
			env.branch
				.track(
					"topic",
					&BranchConfigInfo {
						base: Some("missing".into()),
						..Default::default()
					}
				)
				.await,
			Err(crate::BackendError::BranchError(BranchError::BranchNameNotFound(_)))
		));
		assert_eq!(env.branch.list().await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_config_and_info() {
		let env = test_env().await;
		let main = env.branch.track("main", &Default::default()).await.unwrap();
		let topic = env
			.branch
			.track(
				"topic",
				&BranchConfigInfo {
					base: Some("main".into()),
					priority: Some(150),
					tracking_mode: Some(TrackingMode::Unmanaged),
				},
			)
			.await
			.unwrap();

		let info = env.branch.get(topic).await.unwrap().unwrap();
		assert_eq!(info.base.as_deref(), Some("main"));
		assert_eq!(info.priority, 150);
		assert_eq!(info.tracking_mode, TrackingMode::Unmanaged);
		assert_eq!(info.status, BranchStatus::Pending);

		let names = env
			.branch
			.list()
			.await
			.unwrap()
			.into_iter()
			.map(|info| info.name)
			.collect::<Vec<_>>();
		assert_eq!(names, ["topic", "main"]);

		env.branch
			.update_config(
				topic,
				&BranchConfigInfo {
					base: Some("".into()),
					priority: Some(50),
					..Default::default()
				},
			)
			.await
			.unwrap();
		let info = env.branch.get(topic).await.unwrap().unwrap();
		assert_eq!(info.base, None);
		assert_eq!(info.priority, 50);
		assert_eq!(info.tracking_mode, TrackingMode::Unmanaged);

		env.branch
			.update_config(main, &Default::default())
			.await
			.unwrap();
		assert!(matches!(
			env.branch.update_config(99, &Default::default()).await,
			Err(crate::BackendError::BranchError(BranchError::BranchNotFound(99)))
		));
		assert!(matches!(
			env.branch
				.update_config(
					main,
					&BranchConfigInfo {
						base: Some("main".into()),
						..Default::default()
					}
				)
				.await,
			Err(crate::BackendError::BranchError(BranchError::SelfBase(_)))
		));
	}

	#[tokio::test]
	async fn test_sync_lifecycle() {
		let env = test_env().await;
		let id = env.branch.track("main", &Default::default()).await.unwrap();

		// a sync is outstanding already
		assert!(!env.branch.request_sync(id).await.unwrap());

		let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		let mut db = env.database.get().await.unwrap();
		let branch = env.branch.begin_sync(&mut db, id).await.unwrap().unwrap();
		assert_eq!(branch.status(), SqlBranchStatus::Syncing);
		// executing the same job again proceeds
		assert!(env.branch.begin_sync(&mut db, id).await.unwrap().is_some());

		assert!(
			env.branch
				.finish_sync(&mut db, id, Some(&[0xab, 0xcd]), 12)
				.await
				.unwrap()
				.is_applied()
		);
		// a late duplicate is a conflict, not an error
		assert_eq!(
			env.branch
				.fail_sync(&mut db, id, "too late")
				.await
				.unwrap(),
			Transition::Conflict
		);
		env.job_queue.complete(&mut db, job.id).await.unwrap();
		drop(db);

		let info = env.branch.get(id).await.unwrap().unwrap();
		assert_eq!(info.status, BranchStatus::Active);
		assert_eq!(info.commit.as_deref(), Some("abcd"));
		assert_eq!(info.packages, 12);

		assert!(env.branch.request_sync(id).await.unwrap());
		assert!(!env.branch.request_sync(id).await.unwrap());
		let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		let mut db = env.database.get().await.unwrap();
		env.branch.begin_sync(&mut db, id).await.unwrap().unwrap();
		assert!(
			env.branch
				.fail_sync(&mut db, id, "recipe repository unreachable")
				.await
				.unwrap()
				.is_applied()
		);
		env.job_queue.complete(&mut db, job.id).await.unwrap();
		drop(db);

		let info = env.branch.get(id).await.unwrap().unwrap();
		assert_eq!(
			info.status,
			BranchStatus::Error {
				reason: "recipe repository unreachable".into()
			}
		);
		// last good sync is kept
		assert_eq!(info.commit.as_deref(), Some("abcd"));
		assert!(env.branch.request_sync(id).await.unwrap());
	}

	#[tokio::test]
	async fn test_failure_message_kept_until_sync_finishes() {
		let env = test_env().await;
		let id = env.branch.track("main", &Default::default()).await.unwrap();
		let message = |row: Option<SqlBranch>| row.unwrap().status_msg;

		let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		let mut db = env.database.get().await.unwrap();
		env.branch.begin_sync(&mut db, id).await.unwrap().unwrap();
		assert!(
			env.branch
				.requeue_sync(&mut db, id, "mirror timed out")
				.await
				.unwrap()
				.is_applied()
		);
		// the retried job starts syncing again
		env.branch.begin_sync(&mut db, id).await.unwrap().unwrap();
		assert_eq!(
			message(get_row(&mut db, id).await.unwrap()).as_deref(),
			Some("mirror timed out")
		);
		assert!(
			env.branch
				.fail_sync(&mut db, id, "repo unreachable")
				.await
				.unwrap()
				.is_applied()
		);
		env.job_queue.complete(&mut db, job.id).await.unwrap();
		drop(db);

		assert!(env.branch.request_sync(id).await.unwrap());
		let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		let mut db = env.database.get().await.unwrap();
		assert_eq!(
			message(get_row(&mut db, id).await.unwrap()).as_deref(),
			Some("repo unreachable")
		);
		env.branch.begin_sync(&mut db, id).await.unwrap().unwrap();
		assert_eq!(
			message(get_row(&mut db, id).await.unwrap()).as_deref(),
			Some("repo unreachable")
		);

		assert!(
			env.branch
				.finish_sync(&mut db, id, None, 0)
				.await
				.unwrap()
				.is_applied()
		);
		env.job_queue.complete(&mut db, job.id).await.unwrap();
		assert_eq!(message(get_row(&mut db, id).await.unwrap()), None);
	}

	#[tokio::test]
	async fn test_suspended_branch_drops_sync() {
		let env = test_env().await;
		let id = env.branch.track("main", &Default::default()).await.unwrap();
		assert!(
			env.branch
				.suspend(id, "maintenance")
				.await
				.unwrap()
				.is_applied()
		);
		assert_eq!(
			env.branch.suspend(id, "again").await.unwrap(),
			Transition::Conflict
		);
		assert!(!env.branch.request_sync(id).await.unwrap());

		let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		let mut db = env.database.get().await.unwrap();
		assert!(env.branch.begin_sync(&mut db, id).await.unwrap().is_none());
		env.job_queue.complete(&mut db, job.id).await.unwrap();
		drop(db);

		assert!(env.branch.resume(id).await.unwrap().is_applied());
		let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		assert_eq!(job.command, JobCommand::SyncBranch(id));
		assert_eq!(
			env.branch.get(id).await.unwrap().unwrap().status,
			BranchStatus::Pending
		);
	}

	#[tokio::test]
	async fn test_schedule_syncs() {
		let env = test_env().await;
		let low = env
			.branch
			.track(
				"low",
				&BranchConfigInfo {
					priority: Some(10),
					..Default::default()
				},
			)
			.await
			.unwrap();
		let high = env
			.branch
			.track(
				"high",
				&BranchConfigInfo {
					priority: Some(300),
					..Default::default()
				},
			)
			.await
			.unwrap();
		let manual = env
			.branch
			.track(
				"manual",
				&BranchConfigInfo {
					tracking_mode: Some(TrackingMode::Unmanaged),
					..Default::default()
				},
			)
			.await
			.unwrap();

		// bring every branch to active
		for _ in 0..3 {
			let job = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
			let JobCommand::SyncBranch(id) = job.command else {
				unreachable!()
			};
			let mut db = env.database.get().await.unwrap();
			env.branch.begin_sync(&mut db, id).await.unwrap().unwrap();
			let _ = env.branch.finish_sync(&mut db, id, None, 0).await.unwrap();
			env.job_queue.complete(&mut db, job.id).await.unwrap();
		}

		assert_eq!(env.branch.schedule_syncs().await.unwrap(), 2);
		assert_eq!(env.branch.schedule_syncs().await.unwrap(), 0);
		let first = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		let second = env.job_queue.poll_claim(&SYNC).await.unwrap().unwrap();
		assert_eq!(first.command, JobCommand::SyncBranch(high));
		assert_eq!(second.command, JobCommand::SyncBranch(low));
		assert!(env.job_queue.poll_claim(&SYNC).await.unwrap().is_none());
		assert_eq!(
			env.branch.get(manual).await.unwrap().unwrap().status,
			BranchStatus::Active
		);
	}

	#[tokio::test]
	async fn test_untrack() {
		let env = test_env().await;
		let main = env.branch.track("main", &Default::default()).await.unwrap();
		let topic = env
			.branch
			.track(
				"topic",
				&BranchConfigInfo {
					base: Some("main".into()),
					..Default::default()
				},
			)
			.await
			.unwrap();

		env.branch.untrack(main).await.unwrap();
		assert!(env.branch.find_id("main").await.unwrap().is_none());
		assert_eq!(env.branch.get(topic).await.unwrap().unwrap().base, None);
		assert!(matches!(
			env.branch.untrack(main).await,
			Err(crate::BackendError::BranchError(BranchError::BranchNotFound(_)))
		));
		assert_eq!(env.branch.find_id_or_err("topic").await.unwrap(), topic);
	}
}
