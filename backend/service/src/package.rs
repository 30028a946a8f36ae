use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, insert_into, update};
use kiln_backend_model::{
	branch::BranchRef,
	db::{
		BoxedSqlConn,
		schema::{branch, pkg::dsl, pkg_target},
		utils::{XJsonVal, XUuidVal},
	},
	job::JobCommand,
	package::{
		PackageRef, SqlPackage, SqlPackageStatus, SqlPackageTarget, SqlPackageTargetStatus,
		aggregate_status,
	},
	target::{TargetId, TargetInfo},
};
use kiln_common_model::package::{PackageInfo, PackageTargetInfo};
use kstring::KString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Result, database::DatabaseService, job_queue::JobQueue, target::TargetService};

/// Status message of packages no configured target can build.
pub const NO_ELIGIBLE_TARGET: &str = "no eligible target";

/// Package definitions observed by a branch sync.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BranchSnapshot {
	/// Commit the definitions were read from.
	#[serde(default)]
	pub commit: Option<CommitOid>,
	pub packages: Vec<PackageDefinition>,
}

impl BranchSnapshot {
	/// Count of distinct package names.
	pub fn package_count(&self) -> usize {
		self.packages
			.iter()
			.map(|def| def.name.as_str())
			.collect::<HashSet<_>>()
			.len()
	}
}

/// A commit object ID, hex-encoded in JSON.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitOid(#[serde(with = "hex")] pub Vec<u8>);

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageDefinition {
	pub name: String,
	#[serde(default)]
	pub section: String,
	/// Recipe, version and whatever else builders need.
	#[serde(default)]
	pub data: serde_json::Value,
	/// Names of targets this package must not be built for.
	#[serde(default)]
	pub exclude_targets: Vec<KString>,
	/// Error found while reading the definition.
	///
	/// Such packages are recorded, but never built.
	#[serde(default)]
	pub error: Option<String>,
}

/// Counts of package changes made by a snapshot.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct SnapshotSummary {
	pub added: usize,
	pub changed: usize,
	pub unchanged: usize,
	pub removed: usize,
}

impl SnapshotSummary {
	/// Count of live packages after the snapshot.
	pub fn total(&self) -> usize {
		self.added + self.changed + self.unchanged
	}
}

#[derive(Debug)]
pub struct PackageService {
	db: Arc<DatabaseService>,
	job_queue: Arc<JobQueue>,
	target: Arc<TargetService>,
}

impl PackageService {
	pub fn new(
		db: Arc<DatabaseService>,
		job_queue: Arc<JobQueue>,
		target: Arc<TargetService>,
	) -> Self {
		Self {
			db,
			job_queue,
			target,
		}
	}

	/// Replaces the package set of a branch with a snapshot.
	///
	/// Unchanged packages keep their identity and targets. Changed ones keep
	/// their identity, but their targets are superseded by fresh ones.
	/// Packages missing from the snapshot are superseded, so that a later
	/// reintroduction gets a new identity.
	pub async fn apply_snapshot(
		&self,
		conn: &mut BoxedSqlConn,
		branch: BranchRef,
		snapshot: &BranchSnapshot,
	) -> Result<SnapshotSummary> {
		let live: Vec<SqlPackage> = conn
			.load_select(
				dsl::pkg
					.filter(dsl::branch.eq(branch))
					.filter(dsl::status.ne(i16::from(SqlPackageStatus::Superseded))),
			)
			.await?;
		let mut live = live
			.into_iter()
			.map(|row| (row.name.clone(), row))
			.collect::<HashMap<_, _>>();

		let mut summary = SnapshotSummary::default();
		let mut seen = HashSet::new();
		for def in &snapshot.packages {
			if !seen.insert(def.name.as_str()) {
				warn!(branch, package = def.name, "ignoring duplicated package definition");
				continue;
			}
			let targets = self.eligible_targets(def);
			let error = def
				.error
				.clone()
				.or_else(|| targets.is_empty().then(|| NO_ELIGIBLE_TARGET.to_string()));

			let id = match live.remove(&def.name) {
				Some(existing) => {
					let current = live_targets(conn, *existing.id).await?;
					let unchanged = existing.section == def.section
						&& *existing.data == def.data
						&& match &error {
							Some(message) => {
								existing.status() == SqlPackageStatus::Error
									&& existing.status_msg.as_ref() == Some(message)
									&& current.is_empty()
							}
							None => current == targets.iter().map(|t| t.id).collect::<HashSet<_>>(),
						};
					if unchanged {
						summary.unchanged += 1;
						continue;
					}

					supersede_targets(conn, *existing.id).await?;
					conn.execute(
						update(dsl::pkg)
							.filter(dsl::id.eq(existing.id))
							.set((
								dsl::section.eq(&def.section),
								dsl::data.eq(XJsonVal(def.data.clone())),
								dsl::status.eq(i16::from(SqlPackageStatus::Discovered)),
								dsl::status_msg.eq(None::<String>),
							)),
					)
					.await?;
					debug!(branch, package = def.name, id = %existing.id, "package definition changed");
					summary.changed += 1;
					*existing.id
				}
				None => {
					let id = Uuid::now_v7();
					conn.execute(insert_into(dsl::pkg).values((
						dsl::id.eq(XUuidVal(id)),
						dsl::branch.eq(branch),
						dsl::name.eq(&def.name),
						dsl::section.eq(&def.section),
						dsl::status.eq(i16::from(SqlPackageStatus::Discovered)),
						dsl::data.eq(XJsonVal(def.data.clone())),
					)))
					.await?;
					debug!(branch, package = def.name, %id, "package discovered");
					summary.added += 1;
					id
				}
			};

			match error {
				Some(message) => {
					set_status(conn, id, SqlPackageStatus::Error, Some(&message)).await?;
				}
				None => {
					for target in &targets {
						insert_target(conn, branch, id, target.id).await?;
					}
					set_status(conn, id, SqlPackageStatus::Queued, None).await?;
				}
			}
		}

		for (name, stale) in live {
			supersede_targets(conn, *stale.id).await?;
			set_status(conn, *stale.id, SqlPackageStatus::Superseded, None).await?;
			debug!(branch, package = name, id = %stale.id, "package removed");
			summary.removed += 1;
		}

		info!(
			branch,
			added = summary.added,
			changed = summary.changed,
			unchanged = summary.unchanged,
			removed = summary.removed,
			"applied branch snapshot"
		);
		Ok(summary)
	}

	fn eligible_targets(&self, def: &PackageDefinition) -> Vec<Arc<TargetInfo>> {
		if def.error.is_some() {
			return vec![];
		}
		self.target
			.all()
			.into_iter()
			.filter(|target| !def.exclude_targets.contains(&target.name))
			.collect()
	}

	/// Enqueues build jobs of the queued packages of a branch.
	///
	/// Returns the number of enqueued jobs.
	pub async fn dispatch(&self, conn: &mut BoxedSqlConn, branch: BranchRef) -> Result<usize> {
		let priority = conn
			.get_result::<_, i16>(
				branch::table
					.filter(branch::id.eq(branch))
					.select(branch::priority),
			)
			.await?;
		let queued = conn
			.load::<_, XUuidVal>(
				dsl::pkg
					.filter(dsl::branch.eq(branch))
					.filter(dsl::status.eq(i16::from(SqlPackageStatus::Queued)))
					.order(dsl::id.asc())
					.select(dsl::id),
			)
			.await?;

		let mut jobs = 0;
		for package in queued {
			let targets = conn
				.load::<_, XUuidVal>(
					pkg_target::table
						.filter(pkg_target::package.eq(package))
						.filter(pkg_target::status.eq(i16::from(SqlPackageTargetStatus::Pending)))
						.order(pkg_target::id.asc())
						.select(pkg_target::id),
				)
				.await?;
			for target in targets {
				self.job_queue
					.enqueue_with_priority(
						conn,
						JobCommand::BuildTarget(target.0),
						priority.max(0) as u16,
					)
					.await?;
				jobs += 1;
			}
			conn.execute(
				update(dsl::pkg)
					.filter(dsl::id.eq(package))
					.filter(dsl::status.eq(i16::from(SqlPackageStatus::Queued)))
					.set(dsl::status.eq(i16::from(SqlPackageStatus::Dispatched))),
			)
			.await?;
		}
		if jobs != 0 {
			info!(branch, jobs, "dispatched build jobs");
		}
		Ok(jobs)
	}

	/// Recomputes the cached status of a package from its targets.
	///
	/// Packages without live targets keep their status.
	pub async fn refresh_status(
		&self,
		conn: &mut BoxedSqlConn,
		package: PackageRef,
	) -> Result<Option<SqlPackageStatus>> {
		let statuses = conn
			.load::<_, i16>(
				pkg_target::table
					.filter(pkg_target::package.eq(XUuidVal(package)))
					.select(pkg_target::status),
			)
			.await?
			.into_iter()
			.map(SqlPackageTargetStatus::from)
			.collect::<Vec<_>>();
		let Some(status) = aggregate_status(statuses.iter().copied()) else {
			return Ok(None);
		};
		let message = (status == SqlPackageStatus::Error).then(|| {
			let failed = statuses
				.iter()
				.filter(|status| **status == SqlPackageTargetStatus::Failed)
				.count();
			format!("{failed} target(s) failed")
		});

		conn.execute(
			update(dsl::pkg)
				.filter(dsl::id.eq(XUuidVal(package)))
				.filter(dsl::status.ne(i16::from(SqlPackageStatus::Superseded)))
				.set((
					dsl::status.eq(i16::from(status)),
					dsl::status_msg.eq(message),
				)),
		)
		.await?;
		Ok(Some(status))
	}

	pub async fn get(&self, id: PackageRef) -> Result<Option<PackageInfo>> {
		let mut conn = self.db.get().await?;
		let row: Option<SqlPackage> = conn
			.load_one_select(dsl::pkg.limit(1).filter(dsl::id.eq(XUuidVal(id))))
			.await
			.optional()?;
		Ok(row.map(into_info))
	}

	/// Finds the live package of a name.
	pub async fn find(&self, branch: BranchRef, name: &str) -> Result<Option<PackageInfo>> {
		let mut conn = self.db.get().await?;
		let row: Option<SqlPackage> = conn
			.load_one_select(
				dsl::pkg
					.limit(1)
					.filter(dsl::branch.eq(branch))
					.filter(dsl::name.eq(name))
					.filter(dsl::status.ne(i16::from(SqlPackageStatus::Superseded))),
			)
			.await
			.optional()?;
		Ok(row.map(into_info))
	}

	/// Lists the live packages of a branch, ordered by name.
	pub async fn list(&self, branch: BranchRef) -> Result<Vec<PackageInfo>> {
		let mut conn = self.db.get().await?;
		let rows: Vec<SqlPackage> = conn
			.load_select(
				dsl::pkg
					.filter(dsl::branch.eq(branch))
					.filter(dsl::status.ne(i16::from(SqlPackageStatus::Superseded)))
					.order(dsl::name.asc()),
			)
			.await?;
		Ok(rows.into_iter().map(into_info).collect())
	}

	/// Lists every package ever recorded under a name, oldest first.
	pub async fn history(&self, branch: BranchRef, name: &str) -> Result<Vec<PackageInfo>> {
		let mut conn = self.db.get().await?;
		let rows: Vec<SqlPackage> = conn
			.load_select(
				dsl::pkg
					.filter(dsl::branch.eq(branch))
					.filter(dsl::name.eq(name))
					.order(dsl::id.asc()),
			)
			.await?;
		Ok(rows.into_iter().map(into_info).collect())
	}

	/// Lists the targets of a package, superseded ones included.
	pub async fn targets(&self, package: PackageRef) -> Result<Vec<PackageTargetInfo>> {
		let mut conn = self.db.get().await?;
		let rows: Vec<SqlPackageTarget> = conn
			.load_select(
				pkg_target::table
					.filter(pkg_target::package.eq(XUuidVal(package)))
					.order(pkg_target::id.asc()),
			)
			.await?;
		Ok(rows
			.into_iter()
			.map(|row| PackageTargetInfo {
				id: *row.id,
				package: *row.package,
				target: self.target.get(&row.target).map(|t| t.name.to_string()),
				status: row.status().into_common(row.status_msg),
				data: row.data.0,
			})
			.collect())
	}
}

fn into_info(row: SqlPackage) -> PackageInfo {
	PackageInfo {
		id: *row.id,
		branch: row.branch,
		status: row.status().into_common(row.status_msg.clone()),
		name: row.name,
		section: row.section,
		data: row.data.0,
	}
}

async fn set_status(
	conn: &mut BoxedSqlConn,
	id: PackageRef,
	status: SqlPackageStatus,
	message: Option<&str>,
) -> Result<()> {
	conn.execute(
		update(dsl::pkg)
			.filter(dsl::id.eq(XUuidVal(id)))
			.set((dsl::status.eq(i16::from(status)), dsl::status_msg.eq(message))),
	)
	.await?;
	Ok(())
}

async fn live_targets(conn: &mut BoxedSqlConn, package: PackageRef) -> Result<HashSet<TargetId>> {
	Ok(conn
		.load::<_, XUuidVal>(
			pkg_target::table
				.filter(pkg_target::package.eq(XUuidVal(package)))
				.filter(pkg_target::status.ne(i16::from(SqlPackageTargetStatus::Superseded)))
				.select(pkg_target::target),
		)
		.await?
		.into_iter()
		.map(|target| target.0)
		.collect())
}

async fn supersede_targets(conn: &mut BoxedSqlConn, package: PackageRef) -> Result<usize> {
	let superseded = i16::from(SqlPackageTargetStatus::Superseded);
	Ok(conn
		.execute(
			update(pkg_target::table)
				.filter(pkg_target::package.eq(XUuidVal(package)))
				.filter(pkg_target::status.ne(superseded))
				.set(pkg_target::status.eq(superseded)),
		)
		.await?)
}

async fn insert_target(
	conn: &mut BoxedSqlConn,
	branch: BranchRef,
	package: PackageRef,
	target: TargetId,
) -> Result<()> {
	conn.execute(insert_into(pkg_target::table).values((
		pkg_target::id.eq(XUuidVal(Uuid::now_v7())),
		pkg_target::branch.eq(branch),
		pkg_target::package.eq(XUuidVal(package)),
		pkg_target::target.eq(XUuidVal(target)),
		pkg_target::status.eq(i16::from(SqlPackageTargetStatus::Pending)),
		pkg_target::data.eq(XJsonVal(serde_json::Value::Object(Default::default()))),
	)))
	.await?;
	Ok(())
}

#[cfg(test)]
pub(crate) mod test {
	use kiln_common_model::package::{PackageStatus, TargetStatus};
	use serde_json::json;

	use super::*;
	use crate::{BackendServices, testing::test_env};

	pub fn definition(name: &str, version: &str) -> PackageDefinition {
		PackageDefinition {
			name: name.to_string(),
			section: "utils".to_string(),
			data: json!({ "version": version }),
			exclude_targets: vec![],
			error: None,
		}
	}

	pub async fn apply(
		env: &BackendServices,
		branch: BranchRef,
		packages: Vec<PackageDefinition>,
	) -> SnapshotSummary {
		let mut db = env.database.get().await.unwrap();
		env.package
			.apply_snapshot(
				&mut db,
				branch,
				&BranchSnapshot {
					commit: None,
					packages,
				},
			)
			.await
			.unwrap()
	}

	fn live_statuses(targets: &[PackageTargetInfo]) -> Vec<(Option<String>, TargetStatus)> {
		targets
			.iter()
			.filter(|t| t.status != TargetStatus::Superseded)
			.map(|t| (t.target.clone(), t.status.clone()))
			.collect()
	}

	#[test]
	fn test_parse_snapshot() {
		let snapshot: BranchSnapshot = serde_json::from_value(json!({
			"commit": "00ff10",
			"packages": [
				{ "name": "bash", "section": "shells", "exclude-targets": ["arch2"] },
				{ "name": "broken", "error": "missing version" },
			],
		}))
		.unwrap();
		assert_eq!(snapshot.commit, Some(CommitOid(vec![0x00, 0xff, 0x10])));
		assert_eq!(
			snapshot.packages[0].exclude_targets,
			vec![KString::from_static("arch2")]
		);
		assert_eq!(snapshot.packages[0].data, serde_json::Value::Null);
		assert_eq!(snapshot.packages[1].error.as_deref(), Some("missing version"));
	}

	#[tokio::test]
	async fn test_apply_snapshot() {
		let env = test_env().await;
		let branch = env.branch.track("main", &Default::default()).await.unwrap();

		let mut excluded = definition("zsh", "5.9");
		excluded.exclude_targets = vec!["arch2".into()];
		let mut broken = definition("broken", "1");
		broken.error = Some("missing version".into());
		let summary = apply(&env, branch, vec![definition("bash", "5.2"), excluded, broken]).await;
		assert_eq!(summary.added, 3);
		assert_eq!(summary.total(), 3);

		let bash = env.package.find(branch, "bash").await.unwrap().unwrap();
		assert_eq!(bash.status, PackageStatus::Queued);
		assert_eq!(
			live_statuses(&env.package.targets(bash.id).await.unwrap()),
			[
				(Some("arch1".to_string()), TargetStatus::Pending),
				(Some("arch2".to_string()), TargetStatus::Pending),
			]
		);
		let zsh = env.package.find(branch, "zsh").await.unwrap().unwrap();
		assert_eq!(
			live_statuses(&env.package.targets(zsh.id).await.unwrap()),
			[(Some("arch1".to_string()), TargetStatus::Pending)]
		);
		let broken = env.package.find(branch, "broken").await.unwrap().unwrap();
		assert_eq!(
			broken.status,
			PackageStatus::Error {
				reason: "missing version".into()
			}
		);
		assert!(env.package.targets(broken.id).await.unwrap().is_empty());

		// nothing changed
		let mut excluded = definition("zsh", "5.9");
		excluded.exclude_targets = vec!["arch2".into()];
		let mut broken = definition("broken", "1");
		broken.error = Some("missing version".into());
		let summary = apply(&env, branch, vec![definition("bash", "5.2"), excluded, broken]).await;
		assert_eq!(summary.unchanged, 3);
		assert_eq!(env.package.targets(bash.id).await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn test_no_eligible_target() {
		let env = test_env().await;
		let branch = env.branch.track("main", &Default::default()).await.unwrap();
		let mut def = definition("firmware", "1");
		def.exclude_targets = vec!["arch1".into(), "arch2".into()];
		apply(&env, branch, vec![def]).await;

		let package = env.package.find(branch, "firmware").await.unwrap().unwrap();
		assert_eq!(
			package.status,
			PackageStatus::Error {
				reason: NO_ELIGIBLE_TARGET.into()
			}
		);
	}

	#[tokio::test]
	async fn test_changed_and_removed_packages() {
		let env = test_env().await;
		let branch = env.branch.track("main", &Default::default()).await.unwrap();
		apply(&env, branch, vec![definition("bash", "5.2"), definition("zsh", "5.9")]).await;
		let bash = env.package.find(branch, "bash").await.unwrap().unwrap();
		let zsh = env.package.find(branch, "zsh").await.unwrap().unwrap();

		// bash is upgraded, zsh is dropped
		let summary = apply(&env, branch, vec![definition("bash", "5.3")]).await;
		assert_eq!(
			summary,
			SnapshotSummary {
				added: 0,
				changed: 1,
				unchanged: 0,
				removed: 1,
			}
		);
		let upgraded = env.package.find(branch, "bash").await.unwrap().unwrap();
		assert_eq!(upgraded.id, bash.id);
		assert_eq!(upgraded.data, json!({ "version": "5.3" }));
		let targets = env.package.targets(bash.id).await.unwrap();
		assert_eq!(targets.len(), 4);
		assert_eq!(live_statuses(&targets).len(), 2);

		assert!(env.package.find(branch, "zsh").await.unwrap().is_none());
		let removed = env.package.get(zsh.id).await.unwrap().unwrap();
		assert_eq!(removed.status, PackageStatus::Superseded);
		assert!(live_statuses(&env.package.targets(zsh.id).await.unwrap()).is_empty());

		// reintroduced packages get a new identity
		apply(&env, branch, vec![definition("bash", "5.3"), definition("zsh", "5.9")]).await;
		let reintroduced = env.package.find(branch, "zsh").await.unwrap().unwrap();
		assert_ne!(reintroduced.id, zsh.id);
		let history = env.package.history(branch, "zsh").await.unwrap();
		assert_eq!(
			history.iter().map(|p| p.id).collect::<Vec<_>>(),
			[zsh.id, reintroduced.id]
		);
		assert_eq!(env.package.list(branch).await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn test_dispatch() {
		let env = test_env().await;
		let branch = env
			.branch
			.track(
				"main",
				&crate::branch::BranchConfigInfo {
					priority: Some(120),
					..Default::default()
				},
			)
			.await
			.unwrap();
		apply(&env, branch, vec![definition("bash", "5.2"), definition("zsh", "5.9")]).await;

		let mut db = env.database.get().await.unwrap();
		assert_eq!(env.package.dispatch(&mut db, branch).await.unwrap(), 4);
		assert_eq!(env.package.dispatch(&mut db, branch).await.unwrap(), 0);
		drop(db);

		let bash = env.package.find(branch, "bash").await.unwrap().unwrap();
		assert_eq!(bash.status, PackageStatus::Dispatched);
		assert_eq!(
			env.job_queue
				.count_pending(&[kiln_backend_model::job::JobKind::BuildTarget], 10)
				.await
				.unwrap(),
			4
		);
	}

	#[tokio::test]
	async fn test_refresh_status() {
		let env = test_env().await;
		let branch = env.branch.track("main", &Default::default()).await.unwrap();
		apply(&env, branch, vec![definition("bash", "5.2")]).await;
		let bash = env.package.find(branch, "bash").await.unwrap().unwrap();
		let targets = env.package.targets(bash.id).await.unwrap();

		let mut db = env.database.get().await.unwrap();
		for (target, status) in targets
			.iter()
			.zip([SqlPackageTargetStatus::Built, SqlPackageTargetStatus::Failed])
		{
			db.execute(
				update(pkg_target::table)
					.filter(pkg_target::id.eq(XUuidVal(target.id)))
					.set(pkg_target::status.eq(i16::from(status))),
			)
			.await
			.unwrap();
		}
		assert_eq!(
			env.package.refresh_status(&mut db, bash.id).await.unwrap(),
			Some(SqlPackageStatus::Error)
		);
		drop(db);
		assert_eq!(
			env.package.get(bash.id).await.unwrap().unwrap().status,
			PackageStatus::Error {
				reason: "1 target(s) failed".into()
			}
		);
	}
}
