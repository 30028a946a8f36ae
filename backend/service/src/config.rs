use serde::{Deserialize, Serialize};

use crate::{database::DatabaseConfig, job_queue::JobQueueConfig, target::TargetConfig};

#[derive(Debug, PartialEq, Eq, Clone, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
	pub database: DatabaseConfig,
	#[serde(default)]
	pub job_queue: JobQueueConfig,
	pub target: Vec<TargetConfig>,
}
