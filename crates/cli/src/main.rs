//! `vigil` command line driver.
//!
//! Loads `vigil.toml`, starts the analyzer and runs one command against it:
//! - `analyze`: one full or partial analysis, results printed as JSON.
//! - `solve`: one solution request, answered from the response cache when possible.
//! - `watch`: file changes from stdin, coalesced into notify and partial-analysis batches.
//!
//! Logs go to stderr (or a file under `VIGIL_LOG_DIR`); stdout carries only JSON.

mod cli;
mod commands;
mod config;

use std::path::PathBuf;

use clap::Parser;
use cli::{Cli, Command};
use config::VigilConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	setup_tracing(cli.verbose);

	let config = VigilConfig::load(&cli.config)?;
	tracing::debug!(config = %cli.config.display(), "config loaded");

	match cli.command {
		Command::Analyze { paths, reset_cache } => commands::analyze(&config, paths, reset_cache).await,
		Command::Solve { incidents, effort } => commands::solve(&config, &incidents, effort).await,
		Command::Watch { hot_rerun } => commands::watch(&config, hot_rerun).await,
	}
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_env("VIGIL_LOG").unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("vigil=debug,vigil_analyzer=debug,vigil_cache=debug,vigil_rpc=debug,vigil_worker=debug,info")
			} else {
				EnvFilter::new("vigil=info,vigil_analyzer=info,vigil_cache=info,warn")
			}
		})
	};

	if let Some(log_dir) = std::env::var("VIGIL_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("vigil.{}.log", std::process::id()));
		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_target(true);
			tracing_subscriber::registry().with(filter()).with(file_layer).init();
			tracing::info!(path = %log_path.display(), "tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter())
		.with_writer(std::io::stderr)
		.init();
}
