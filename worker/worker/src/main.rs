use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use config::WorkerConfig;
use kiln_backend_service::BackendServices;
use kiln_worker_jobrunner::JobRunner;
use process::ProcessExecutor;
use tracing::info;

mod config;
mod process;

#[derive(clap::Parser)]
#[command(version, about = "Kiln build worker")]
struct Args {
	#[arg(short, long, env = "KILN_WORKER_CONFIG", default_value = "worker.toml")]
	config: PathBuf,
	/// Enable debug logging.
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	tracing::subscriber::set_global_default(
		tracing_subscriber::FmtSubscriber::builder()
			.with_max_level(if args.verbose {
				tracing::Level::DEBUG
			} else {
				tracing::Level::INFO
			})
			.finish(),
	)?;

	let config_path = &args.config;
	let config = toml::from_str::<WorkerConfig>(&fs::read_to_string(config_path)?)?;
	info!("loaded configuration from file: {:?}", config_path);

	let executor = Arc::new(ProcessExecutor::new(config.executor.clone())?);
	let runner_config = config.runner.clone();

	info!("initializing backend services ...");
	let backend = Arc::new(BackendServices::new(config.try_into()?).await?);
	info!("initializing runner service ...");
	let runner = Arc::new(JobRunner::new(
		backend,
		runner_config,
		executor.clone(),
		executor,
	));

	let runners = runner.config().runners.max(1);
	for i in 0..runners {
		tokio::spawn(runner.clone().run(i));
	}
	tokio::spawn(runner.clone().run_watcher());
	tokio::spawn(runner.clone().run_reaper());
	tokio::spawn(runner.clone().run_scheduler());

	tokio::signal::ctrl_c().await?;
	info!("interrupted, shutting down");
	Ok(())
}
