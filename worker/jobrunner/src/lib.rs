use std::{sync::Arc, time::Duration};

use anyhow::Result;
use kiln_backend_model::{
	branch::BranchRef,
	db::BoxedSqlConn,
	job::{Job, JobCommand, JobKind},
	package::PackageTargetRef,
};
use kiln_backend_service::{
	BackendError, BackendServices,
	job_queue::FailOutcome,
	package::CommitOid,
	package_target::Claim,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub use backoff::Backoff;
pub use executor::{BranchSyncer, BuildOutcome, ExecError, SyncRequest, TargetBuilder};

pub mod backoff;
pub mod executor;

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RunnerConfig {
	/// Count of concurrent job runners.
	pub runners: usize,
	/// Job kinds executed by this worker.
	pub kinds: Vec<JobKind>,
	/// Longest sleep of an idle runner before polling again.
	pub poll_interval_secs: u64,
	pub watch_interval_secs: u64,
	pub reap_interval_secs: u64,
	/// Interval of scheduled re-syncs of active branches.
	pub sync_interval_secs: u64,
}

impl Default for RunnerConfig {
	fn default() -> Self {
		Self {
			runners: 4,
			kinds: JobKind::ALL.to_vec(),
			poll_interval_secs: 30,
			watch_interval_secs: 3 * 60,
			reap_interval_secs: 60,
			sync_interval_secs: 60 * 60,
		}
	}
}

impl RunnerConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_secs)
	}
}

#[derive(Debug)]
pub struct JobRunner {
	/// Notifier to resume idle runners immediately.
	notifier: Notify,
	/// Backend services
	backend: Arc<BackendServices>,
	config: RunnerConfig,
	syncer: Arc<dyn BranchSyncer>,
	builder: Arc<dyn TargetBuilder>,
}

impl JobRunner {
	pub fn new(
		backend: Arc<BackendServices>,
		config: RunnerConfig,
		syncer: Arc<dyn BranchSyncer>,
		builder: Arc<dyn TargetBuilder>,
	) -> Self {
		Self {
			notifier: Notify::const_new(),
			backend,
			config,
			syncer,
			builder,
		}
	}

	pub fn config(&self) -> &RunnerConfig {
		&self.config
	}

	#[tracing::instrument(level = "info", name = "jobrunner", skip(self))]
	pub async fn run(self: Arc<Self>, index: usize) {
		info!("job runner started");
		let mut backoff = Backoff::new();
		loop {
			match self.drain().await {
				Ok(executed) => {
					backoff.reset();
					if executed != 0 {
						debug!(executed, "job queue drained");
					}
					// a missed notification is caught by the next poll
					let _ = tokio::time::timeout(self.config.poll_interval(), self.notifier.notified())
						.await;
				}
				Err(error) if is_transient(&error) => {
					warn!(?error, "store unavailable, backing off");
					backoff.wait().await;
				}
				Err(error) => {
					error!(?error, "job runner error");
					tokio::time::sleep(self.config.poll_interval()).await;
				}
			}
		}
	}

	/// Executes jobs until none is left to claim.
	///
	/// Returns the number of executed jobs, failed ones included.
	pub(crate) async fn drain(&self) -> Result<usize> {
		let mut executed = 0;
		while let Some(job) = self
			.backend
			.job_queue
			.poll_claim(&self.config.kinds)
			.await?
		{
			let id = job.id;
			let result = self
				.exec(&job)
				.instrument(info_span!("execute job", job = %id, kind = %job.command.kind()))
				.await;
			if let Err(error) = result {
				error!(?error, job = %id, "job execution failed");
				self.release(&job, &format!("{error:#}")).await;
			}
			executed += 1;
		}
		Ok(executed)
	}

	#[tracing::instrument(level = "debug", name = "job_watcher", skip(self))]
	pub async fn run_watcher(self: Arc<Self>) {
		info!("job watcher started");
		let runners = self.config.runners.max(1);
		loop {
			let result = async {
				let count = self
					.backend
					.job_queue
					.count_pending(&self.config.kinds, runners)
					.await?;
				for _ in 0..count {
					self.notify_one();
				}

				Ok::<_, anyhow::Error>(())
			}
			.await;
			if let Err(error) = result {
				error!(?error, "job watcher error")
			}
			tokio::time::sleep(Duration::from_secs(self.config.watch_interval_secs)).await;
		}
	}

	/// Periodically frees jobs claimed by crashed workers.
	#[tracing::instrument(level = "debug", name = "job_reaper", skip(self))]
	pub async fn run_reaper(self: Arc<Self>) {
		info!("job reaper started");
		let max_age = self.backend.job_queue.config().stale_after();
		loop {
			tokio::time::sleep(Duration::from_secs(self.config.reap_interval_secs)).await;
			match self.backend.job_queue.reap_stale_claims(max_age).await {
				Ok(0) => {}
				Ok(_) => self.notify_all(),
				Err(error) => error!(?error, "job reaper error"),
			}
		}
	}

	/// Periodically requests syncs of active, auto-tracked branches.
	#[tracing::instrument(level = "debug", name = "sync_scheduler", skip(self))]
	pub async fn run_scheduler(self: Arc<Self>) {
		info!("sync scheduler started");
		loop {
			tokio::time::sleep(Duration::from_secs(self.config.sync_interval_secs)).await;
			match self.backend.branch.schedule_syncs().await {
				Ok(0) => {}
				Ok(_) => self.notify_all(),
				Err(error) => error!(?error, "sync scheduler error"),
			}
		}
	}

	pub fn notify_one(&self) {
		self.notifier.notify_one();
	}

	pub fn notify_all(&self) {
		self.notifier.notify_waiters();
	}

	/// Runs a job command.
	///
	/// The job is settled on success. On error, it is left claimed.
	async fn exec(&self, job: &Job) -> Result<()> {
		match job.command {
			JobCommand::SyncBranch(branch) => self.sync_branch(job, branch).await,
			JobCommand::BuildTarget(target) => self.build_target(job, target).await,
		}
	}

	async fn sync_branch(&self, job: &Job, id: BranchRef) -> Result<()> {
		let backend = &self.backend;
		let mut db = backend.database.get().await?;
		let Some(branch) = backend.branch.begin_sync(&mut db, id).await? else {
			backend.job_queue.complete(&mut db, job.id).await?;
			return Ok(());
		};
		drop(db);

		let request = SyncRequest {
			id,
			name: branch.name,
			commit: branch.commit_oid.map(CommitOid),
		};
		let result = self.syncer.sync(&request).await;

		let mut db = backend.database.get().await?;
		let dispatched = db
			.transaction::<_, BackendError, _>(async move |conn| match result {
				Ok(snapshot) => {
					let commit = snapshot.commit.as_ref().map(|oid| oid.0.as_slice());
					let transition = backend
						.branch
						.finish_sync(conn, id, commit, snapshot.package_count())
						.await?;
					let mut dispatched = 0;
					if transition.is_applied() {
						let summary = backend.package.apply_snapshot(conn, id, &snapshot).await?;
						debug!(?summary, "applied branch snapshot");
						dispatched = backend.package.dispatch(conn, id).await?;
					}
					backend.job_queue.complete(conn, job.id).await?;
					Ok(dispatched)
				}
				Err(err) => {
					self.fail_job(conn, job, err.is_transient(), &err.to_string())
						.await?;
					Ok(0)
				}
			})
			.await?;

		for _ in 0..dispatched.min(self.config.runners) {
			self.notify_one();
		}
		Ok(())
	}

	async fn build_target(&self, job: &Job, id: PackageTargetRef) -> Result<()> {
		let backend = &self.backend;
		let mut db = backend.database.get().await?;
		let claim = db
			.transaction::<_, BackendError, _>(async |conn| {
				let claim = backend.package_target.claim(conn, id).await?;
				if matches!(claim, Claim::Claimed(_)) {
					let _ = backend.package_target.start(conn, id).await?;
				} else {
					backend.job_queue.complete(conn, job.id).await?;
				}
				Ok(claim)
			})
			.await?;
		let Claim::Claimed(request) = claim else {
			return Ok(());
		};
		drop(db);

		let result = self.builder.build(&request).await;

		let mut db = backend.database.get().await?;
		db.transaction::<_, BackendError, _>(async move |conn| {
			match result {
				Ok(outcome) => {
					let _ = backend.package_target.finish(conn, id, outcome.data).await?;
					backend.job_queue.complete(conn, job.id).await?;
				}
				Err(err) => {
					self.fail_job(conn, job, err.is_transient(), &err.to_string())
						.await?;
				}
			}
			Ok(())
		})
		.await?;
		Ok(())
	}

	/// Fails a job, and moves its entity along in the same transaction.
	///
	/// A requeued job puts its entity back to pending. A job that will not
	/// run again leaves its entity failed, so that it is never stuck in
	/// flight without a job.
	async fn fail_job(
		&self,
		conn: &mut BoxedSqlConn,
		job: &Job,
		retry: bool,
		reason: &str,
	) -> kiln_backend_service::Result<FailOutcome> {
		let backend = &self.backend;
		let outcome = backend.job_queue.fail(conn, job, retry).await?;
		match (outcome, &job.command) {
			(FailOutcome::Gone, command) => {
				warn!(?command, "job was reclaimed or removed while running, leaving it as is");
			}
			(FailOutcome::Requeued, JobCommand::SyncBranch(id)) => {
				let _ = backend.branch.requeue_sync(conn, *id, reason).await?;
			}
			(FailOutcome::Requeued, JobCommand::BuildTarget(id)) => {
				let _ = backend.package_target.requeue(conn, *id, reason).await?;
			}
			(_, JobCommand::SyncBranch(id)) => {
				let _ = backend.branch.fail_sync(conn, *id, reason).await?;
			}
			(_, JobCommand::BuildTarget(id)) => {
				let _ = backend.package_target.fail(conn, *id, reason).await?;
			}
		}
		Ok(outcome)
	}

	/// Gives a job whose execution errored back to the queue.
	///
	/// Errors are only logged: the reaper frees the job eventually.
	async fn release(&self, job: &Job, reason: &str) {
		let result = async {
			let mut db = self.backend.database.get().await?;
			db.transaction::<_, BackendError, _>(async |conn| {
				self.fail_job(conn, job, true, reason).await
			})
			.await
		}
		.await;
		match result {
			Ok(outcome) => debug!(job = %job.id, ?outcome, "released job"),
			Err(error) => warn!(?error, job = %job.id, "failed to release job"),
		}
	}
}

fn is_transient(error: &anyhow::Error) -> bool {
	error
		.downcast_ref::<BackendError>()
		.is_some_and(BackendError::is_transient)
}
