use kiln_backend_service::{
	config::BackendConfig, database::DatabaseConfig, job_queue::JobQueueConfig,
	target::TargetConfig,
};
use kiln_worker_jobrunner::RunnerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
	pub database: DatabaseConfig,
	#[serde(default)]
	pub job_queue: JobQueueConfig,
	pub target: Vec<TargetConfig>,
	#[serde(default)]
	pub runner: RunnerConfig,
	pub executor: ExecutorConfig,
}

impl TryFrom<WorkerConfig> for BackendConfig {
	type Error = anyhow::Error;

	fn try_from(config: WorkerConfig) -> Result<Self, Self::Error> {
		Ok(BackendConfig {
			database: config.database,
			job_queue: config.job_queue,
			target: config.target,
		})
	}
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutorConfig {
	/// Command reading a branch, as program followed by arguments.
	pub sync_command: Vec<String>,
	pub build_command: Vec<String>,
	/// Seconds after which a command is killed, failing transiently.
	#[serde(default = "default_timeout_secs")]
	pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
	6 * 60 * 60
}
