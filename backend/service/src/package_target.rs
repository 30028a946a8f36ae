use std::sync::Arc;

use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, update};
use kiln_backend_model::{
	branch::BranchRef,
	db::{
		BoxedSqlConn,
		schema::{branch, pkg, pkg_target::dsl},
		utils::{XJsonVal, XUuidVal},
	},
	job::{JobCommand, JobRef},
	package::{PackageRef, PackageTargetRef, SqlPackageTarget, SqlPackageTargetStatus},
};
use kstring::KString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
	Result, Transition, database::DatabaseService, job_queue::JobQueue, package::PackageService,
	target::TargetService,
};

/// Everything a builder needs to build a package for a target.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildRequest {
	pub id: PackageTargetRef,
	pub branch: BranchRef,
	pub package: PackageRef,
	pub name: String,
	pub section: String,
	pub target: KString,
	pub arch: KString,
	/// Package data from the branch snapshot.
	pub data: serde_json::Value,
}

/// Result of claiming a target for a build job.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Claim {
	/// The build should run.
	Claimed(BuildRequest),
	/// The target is not waiting for a build anymore.
	Stale(SqlPackageTargetStatus),
	/// The target does not exist.
	Gone,
}

#[derive(Debug)]
pub struct PackageTargetService {
	db: Arc<DatabaseService>,
	job_queue: Arc<JobQueue>,
	package: Arc<PackageService>,
	target: Arc<TargetService>,
}

impl PackageTargetService {
	pub fn new(
		db: Arc<DatabaseService>,
		job_queue: Arc<JobQueue>,
		package: Arc<PackageService>,
		target: Arc<TargetService>,
	) -> Self {
		Self {
			db,
			job_queue,
			package,
			target,
		}
	}

	/// Claims a target for its build job.
	///
	/// A target already claimed or building is claimed again, since reaped
	/// jobs may be executed twice.
	pub async fn claim(&self, conn: &mut BoxedSqlConn, id: PackageTargetRef) -> Result<Claim> {
		let Some(row) = get_row(conn, id).await? else {
			warn!(%id, "build requested for a missing target");
			return Ok(Claim::Gone);
		};
		let status = row.status();
		if !status.is_unfinished() {
			info!(%id, ?status, "target is not waiting for a build, dropping job");
			return Ok(Claim::Stale(status));
		}
		let target = self.target.get_or_err(&row.target)?;

		if status != SqlPackageTargetStatus::Pending {
			debug!(%id, ?status, "target build is in flight, executing again");
		} else if !self
			.move_status(
				conn,
				id,
				&[SqlPackageTargetStatus::Pending],
				SqlPackageTargetStatus::Claimed,
				None,
			)
			.await?
			.is_applied()
		{
			match get_row(conn, id).await?.map(|row| row.status()) {
				Some(status) if SqlPackageTargetStatus::IN_FLIGHT.contains(&status) => {}
				Some(status) => return Ok(Claim::Stale(status)),
				None => return Ok(Claim::Gone),
			}
		}

		let (name, section, data) = conn
			.get_result::<_, (String, String, XJsonVal)>(
				pkg::table
					.filter(pkg::id.eq(row.package))
					.select((pkg::name, pkg::section, pkg::data)),
			)
			.await?;

		info!(%id, package = name, target = %target.name, "claimed target build");
		Ok(Claim::Claimed(BuildRequest {
			id,
			branch: row.branch,
			package: *row.package,
			name,
			section,
			target: target.name.clone(),
			arch: target.arch.clone(),
			data: data.0,
		}))
	}

	/// Marks a claimed target as building.
	pub async fn start(&self, conn: &mut BoxedSqlConn, id: PackageTargetRef) -> Result<Transition> {
		self.move_status(
			conn,
			id,
			&[SqlPackageTargetStatus::Claimed],
			SqlPackageTargetStatus::Building,
			None,
		)
		.await
	}

	/// Records a successful build.
	pub async fn finish(
		&self,
		conn: &mut BoxedSqlConn,
		id: PackageTargetRef,
		data: serde_json::Value,
	) -> Result<Transition> {
		let transition = Transition::from_rows(
			conn.execute(
				update(dsl::pkg_target)
					.filter(dsl::id.eq(XUuidVal(id)))
					.filter(dsl::status.eq_any(in_flight()))
					.set((
						dsl::status.eq(i16::from(SqlPackageTargetStatus::Built)),
						dsl::status_msg.eq(None::<String>),
						dsl::data.eq(XJsonVal(data)),
					)),
			)
			.await?,
		);
		self.after_transition(conn, id, transition, "finish").await?;
		if transition.is_applied() {
			info!(%id, "target built");
		}
		Ok(transition)
	}

	/// Puts a target back to pending, as its build job is retried.
	pub async fn requeue(
		&self,
		conn: &mut BoxedSqlConn,
		id: PackageTargetRef,
		reason: &str,
	) -> Result<Transition> {
		let transition = self
			.move_status(
				conn,
				id,
				&SqlPackageTargetStatus::IN_FLIGHT,
				SqlPackageTargetStatus::Pending,
				Some(reason),
			)
			.await?;
		if transition.is_applied() {
			info!(%id, reason, "target build will be retried");
		}
		Ok(transition)
	}

	/// Records a failed build with no retry left.
	pub async fn fail(
		&self,
		conn: &mut BoxedSqlConn,
		id: PackageTargetRef,
		reason: &str,
	) -> Result<Transition> {
		let transition = self
			.move_status(
				conn,
				id,
				&SqlPackageTargetStatus::IN_FLIGHT,
				SqlPackageTargetStatus::Failed,
				Some(reason),
			)
			.await?;
		if transition.is_applied() {
			warn!(%id, reason, "target build failed");
		}
		Ok(transition)
	}

	/// Retries the build of a failed target.
	///
	/// This is the only way out of the failed state, apart from a branch
	/// sync superseding the target.
	pub async fn retry(&self, id: PackageTargetRef) -> Result<JobRef> {
		let mut conn = self.db.get().await?;
		let job = conn
			.transaction::<_, crate::BackendError, _>(async |conn| {
				let transition = Transition::from_rows(
					conn.execute(
						update(dsl::pkg_target)
							.filter(dsl::id.eq(XUuidVal(id)))
							.filter(
								dsl::status.eq(i16::from(SqlPackageTargetStatus::Failed)),
							)
							.set(dsl::status.eq(i16::from(SqlPackageTargetStatus::Pending))),
					)
					.await?,
				);
				let Some(row) = get_row(conn, id).await? else {
					return Err(PackageTargetError::NotFound(id).into());
				};
				if !transition.is_applied() {
					return Err(PackageTargetError::NotFailed(id, row.status()).into());
				}

				let priority = conn
					.get_result::<_, i16>(
						branch::table
							.filter(branch::id.eq(row.branch))
							.select(branch::priority),
					)
					.await?;
				let job = self
					.job_queue
					.enqueue_with_priority(conn, JobCommand::BuildTarget(id), priority.max(0) as u16)
					.await?;
				self.package.refresh_status(conn, *row.package).await?;
				Ok(job)
			})
			.await?;
		info!(%id, %job, "retrying failed target");
		Ok(job)
	}

	async fn move_status(
		&self,
		conn: &mut BoxedSqlConn,
		id: PackageTargetRef,
		from: &[SqlPackageTargetStatus],
		to: SqlPackageTargetStatus,
		message: Option<&str>,
	) -> Result<Transition> {
		let from = from.iter().map(|status| i16::from(*status)).collect::<Vec<_>>();
		let target = update(dsl::pkg_target)
			.filter(dsl::id.eq(XUuidVal(id)))
			.filter(dsl::status.eq_any(from));
		// without a new message, the last failure is kept until the target is built
		let rows = match message {
			Some(message) => {
				conn.execute(target.set((dsl::status.eq(i16::from(to)), dsl::status_msg.eq(message))))
					.await?
			}
			None => conn.execute(target.set(dsl::status.eq(i16::from(to)))).await?,
		};
		let transition = Transition::from_rows(rows);
		self.after_transition(conn, id, transition, "move").await?;
		Ok(transition)
	}

	/// Refreshes the package of an updated target, or logs a lost race.
	async fn after_transition(
		&self,
		conn: &mut BoxedSqlConn,
		id: PackageTargetRef,
		transition: Transition,
		action: &str,
	) -> Result<()> {
		let package = conn
			.get_result::<_, XUuidVal>(
				dsl::pkg_target
					.filter(dsl::id.eq(XUuidVal(id)))
					.select(dsl::package),
			)
			.await
			.optional()?;
		match (package, transition) {
			(Some(package), Transition::Applied) => {
				self.package.refresh_status(conn, *package).await?;
			}
			(Some(_), Transition::Conflict) => {
				debug!(%id, action, "target transition skipped");
			}
			(None, _) => {
				debug!(%id, action, "target does not exist");
			}
		}
		Ok(())
	}
}

fn in_flight() -> Vec<i16> {
	SqlPackageTargetStatus::IN_FLIGHT
		.iter()
		.map(|status| i16::from(*status))
		.collect()
}

async fn get_row(
	conn: &mut BoxedSqlConn,
	id: PackageTargetRef,
) -> Result<Option<SqlPackageTarget>> {
	Ok(conn
		.load_one_select(dsl::pkg_target.limit(1).filter(dsl::id.eq(XUuidVal(id))))
		.await
		.optional()?)
}

#[derive(Debug, Error)]
pub enum PackageTargetError {
	#[error("package target {0} not found")]
	NotFound(PackageTargetRef),
	#[error("package target {0} is {1:?}, not failed")]
	NotFailed(PackageTargetRef, SqlPackageTargetStatus),
}

#[cfg(test)]
mod test {
	use kiln_backend_model::job::{JobCommand, JobKind};
	use kiln_common_model::package::{PackageStatus, TargetStatus};
	use serde_json::json;

	use super::*;
	use crate::{
		BackendServices,
		package::test::{apply, definition},
		testing::test_env,
	};

	/// Tracks a branch with one package, and returns its target IDs.
	async fn setup(env: &BackendServices) -> (PackageRef, Vec<PackageTargetRef>) {
		let branch = env.branch.track("main", &Default::default()).await.unwrap();
		apply(env, branch, vec![definition("bash", "5.2")]).await;
		let package = env.package.find(branch, "bash").await.unwrap().unwrap();
		let targets = env
			.package
			.targets(package.id)
			.await
			.unwrap()
			.into_iter()
			.map(|target| target.id)
			.collect();
		(package.id, targets)
	}

	async fn package_status(env: &BackendServices, id: PackageRef) -> PackageStatus {
		env.package.get(id).await.unwrap().unwrap().status
	}

	#[tokio::test]
	async fn test_build_lifecycle() {
		let env = test_env().await;
		let (package, targets) = setup(&env).await;
		let mut db = env.database.get().await.unwrap();

		let Claim::Claimed(request) = env.package_target.claim(&mut db, targets[0]).await.unwrap()
		else {
			panic!("target should be claimable");
		};
		assert_eq!(request.name, "bash");
		assert_eq!(request.target.as_str(), "arch1");
		assert_eq!(request.data, json!({ "version": "5.2" }));
		assert!(env.package_target.start(&mut db, targets[0]).await.unwrap().is_applied());
		assert!(
			env.package_target
				.finish(&mut db, targets[0], json!({ "log": "ok" }))
				.await
				.unwrap()
				.is_applied()
		);
		drop(db);
		// arch2 is still pending
		assert_eq!(package_status(&env, package).await, PackageStatus::Building);

		let mut db = env.database.get().await.unwrap();
		let Claim::Claimed(request) = env.package_target.claim(&mut db, targets[1]).await.unwrap()
		else {
			panic!("target should be claimable");
		};
		assert_eq!(request.arch.as_str(), "testarch2");
		assert!(
			env.package_target
				.finish(&mut db, targets[1], json!({}))
				.await
				.unwrap()
				.is_applied()
		);
		drop(db);
		assert_eq!(package_status(&env, package).await, PackageStatus::Built);

		// a late duplicate job finds nothing to do
		let mut db = env.database.get().await.unwrap();
		assert_eq!(
			env.package_target.claim(&mut db, targets[0]).await.unwrap(),
			Claim::Stale(SqlPackageTargetStatus::Built)
		);
		assert_eq!(
			env.package_target
				.fail(&mut db, targets[0], "too late")
				.await
				.unwrap(),
			Transition::Conflict
		);
	}

	#[tokio::test]
	async fn test_claim_twice_proceeds() {
		let env = test_env().await;
		let (_, targets) = setup(&env).await;
		let mut db = env.database.get().await.unwrap();
		assert!(matches!(
			env.package_target.claim(&mut db, targets[0]).await.unwrap(),
			Claim::Claimed(_)
		));
		let _ = env.package_target.start(&mut db, targets[0]).await.unwrap();
		assert!(matches!(
			env.package_target.claim(&mut db, targets[0]).await.unwrap(),
			Claim::Claimed(_)
		));
		assert_eq!(
			env.package_target
				.claim(&mut db, uuid::Uuid::now_v7())
				.await
				.unwrap(),
			Claim::Gone
		);
	}

	#[tokio::test]
	async fn test_fail_and_retry() {
		let env = test_env().await;
		let (package, targets) = setup(&env).await;

		let mut db = env.database.get().await.unwrap();
		for target in &targets {
			let _ = env.package_target.claim(&mut db, *target).await.unwrap();
		}
		assert!(
			env.package_target
				.finish(&mut db, targets[0], json!({}))
				.await
				.unwrap()
				.is_applied()
		);
		// a retried job puts the target back to pending
		assert!(
			env.package_target
				.requeue(&mut db, targets[1], "builder lost")
				.await
				.unwrap()
				.is_applied()
		);
		let _ = env.package_target.claim(&mut db, targets[1]).await.unwrap();
		// the reason of the retry outlives the new claim
		assert_eq!(
			get_row(&mut db, targets[1])
				.await
				.unwrap()
				.unwrap()
				.status_msg
				.as_deref(),
			Some("builder lost")
		);
		assert!(
			env.package_target
				.fail(&mut db, targets[1], "compile error")
				.await
				.unwrap()
				.is_applied()
		);
		drop(db);
		assert_eq!(
			package_status(&env, package).await,
			PackageStatus::Error {
				reason: "1 target(s) failed".into()
			}
		);
		let infos = env.package.targets(package).await.unwrap();
		assert_eq!(
			infos[1].status,
			TargetStatus::Failed {
				reason: "compile error".into()
			}
		);

		assert!(matches!(
			env.package_target.retry(targets[0]).await,
			Err(crate::BackendError::PackageTargetError(
				PackageTargetError::NotFailed(_, SqlPackageTargetStatus::Built)
			))
		));
		env.package_target.retry(targets[1]).await.unwrap();
		assert_eq!(package_status(&env, package).await, PackageStatus::Building);

		let job = env
			.job_queue
			.poll_claim(&[JobKind::BuildTarget])
			.await
			.unwrap()
			.unwrap();
		assert_eq!(job.command, JobCommand::BuildTarget(targets[1]));
		let mut db = env.database.get().await.unwrap();
		let _ = env.package_target.claim(&mut db, targets[1]).await.unwrap();
		let _ = env
			.package_target
			.finish(&mut db, targets[1], json!({}))
			.await
			.unwrap();
		assert_eq!(
			get_row(&mut db, targets[1]).await.unwrap().unwrap().status_msg,
			None
		);
		drop(db);
		assert_eq!(package_status(&env, package).await, PackageStatus::Built);
	}

	#[tokio::test]
	async fn test_superseded_target_is_stale() {
		let env = test_env().await;
		let (_, targets) = setup(&env).await;
		let branch = env.branch.find_id_or_err("main").await.unwrap();
		apply(&env, branch, vec![definition("bash", "5.3")]).await;

		let mut db = env.database.get().await.unwrap();
		assert_eq!(
			env.package_target.claim(&mut db, targets[0]).await.unwrap(),
			Claim::Stale(SqlPackageTargetStatus::Superseded)
		);
		drop(db);
		assert!(matches!(
			env.package_target.retry(targets[0]).await,
			Err(crate::BackendError::PackageTargetError(
				PackageTargetError::NotFailed(..)
			))
		));
	}
}
