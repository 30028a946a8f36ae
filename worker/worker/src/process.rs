//! Executors running external commands.
//!
//! The request is written to the command's stdin as JSON, and the result
//! is read from its stdout as JSON. A non-zero exit fails the job for good,
//! while commands that cannot be run or time out are retried.

use std::{io, process::Stdio, time::Duration};

use anyhow::bail;
use futures::{FutureExt, future::BoxFuture};
use kiln_backend_service::{package::BranchSnapshot, package_target::BuildRequest};
use kiln_worker_jobrunner::{BranchSyncer, BuildOutcome, ExecError, SyncRequest, TargetBuilder};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use crate::config::ExecutorConfig;

#[derive(Debug)]
pub struct ProcessExecutor {
	config: ExecutorConfig,
}

impl ProcessExecutor {
	pub fn new(config: ExecutorConfig) -> anyhow::Result<Self> {
		if config.sync_command.is_empty() {
			bail!("executor.sync-command must not be empty");
		}
		if config.build_command.is_empty() {
			bail!("executor.build-command must not be empty");
		}
		Ok(Self { config })
	}

	async fn run<T, R>(&self, command: &[String], request: &T) -> Result<R, ExecError>
	where
		T: Serialize + Sync,
		R: DeserializeOwned,
	{
		let Some((program, args)) = command.split_first() else {
			return Err(ExecError::Permanent("empty command".to_string()));
		};
		let input = serde_json::to_vec(request)
			.map_err(|err| ExecError::Permanent(format!("failed to encode request: {err}")))?;

		debug!(program, "spawning executor command");
		let mut child = Command::new(program)
			.args(args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|err| ExecError::Transient(format!("failed to spawn {program}: {err}")))?;
		let Some(mut stdin) = child.stdin.take() else {
			return Err(ExecError::Transient(format!("no stdin for {program}")));
		};

		// stdin is closed as the write ends; commands may exit without reading it
		let write = async move {
			match stdin.write_all(&input).await {
				Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
				result => result,
			}
		};
		let run = async { tokio::try_join!(write, child.wait_with_output()) };
		let output = match tokio::time::timeout(
			Duration::from_secs(self.config.timeout_secs),
			run,
		)
		.await
		{
			Ok(Ok(((), output))) => output,
			Ok(Err(err)) => {
				return Err(ExecError::Transient(format!("{program} failed: {err}")));
			}
			Err(_) => {
				return Err(ExecError::Transient(format!(
					"{program} timed out after {}s",
					self.config.timeout_secs
				)));
			}
		};

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			let last = stderr.lines().rev().find(|line| !line.trim().is_empty());
			return Err(ExecError::Permanent(match last {
				Some(line) => format!("{program} exited with {}: {}", output.status, line.trim()),
				None => format!("{program} exited with {}", output.status),
			}));
		}
		serde_json::from_slice(&output.stdout)
			.map_err(|err| ExecError::Permanent(format!("malformed output of {program}: {err}")))
	}
}

impl BranchSyncer for ProcessExecutor {
	fn sync<'a>(&'a self, request: &'a SyncRequest) -> BoxFuture<'a, Result<BranchSnapshot, ExecError>> {
		self.run(&self.config.sync_command, request).boxed()
	}
}

impl TargetBuilder for ProcessExecutor {
	fn build<'a>(&'a self, request: &'a BuildRequest) -> BoxFuture<'a, Result<BuildOutcome, ExecError>> {
		self.run(&self.config.build_command, request).boxed()
	}
}
