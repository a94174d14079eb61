//! Subcommand implementations.
//!
//! Every command starts its own analyzer and always stops it before returning, including on errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vigil_analyzer::{
	AnalysisOutcome, AnalysisRequest, AnalyzerClient, ChangeCoalescer, ChangeSink, CoalescerConfig, EffortLevel, FileChange,
	ProcessLauncher, ProgressEvent, ServerState, Solution, SolutionParams, SolutionRequest, methods,
};
use vigil_cache::{CacheSet, ChatMessage, ModelInput, Role};
use vigil_worker::{ExclusionGate, TaskClass};

use crate::config::VigilConfig;

/// Cache namespace for solver responses.
const SOLUTION_NAMESPACE: &str = "get_solution";

/// Starts an analyzer, giving up when `cancel` fires. A failed start is stopped before returning.
async fn start_analyzer(config: &VigilConfig, cancel: &CancellationToken) -> anyhow::Result<Arc<AnalyzerClient>> {
	let client = Arc::new(AnalyzerClient::new(
		config.analyzer.clone(),
		Arc::new(ProcessLauncher),
		ExclusionGate::new(),
	));
	client.configure().context("invalid [analyzer] configuration")?;
	if let Err(e) = client.start_with(cancel).await {
		client.stop().await;
		return Err(e).context("failed to start the analyzer");
	}
	Ok(client)
}

/// Returns a token cancelled on the first Ctrl-C. Call it before starting the analyzer.
fn cancel_on_ctrl_c() -> CancellationToken {
	let token = CancellationToken::new();
	let cancel = token.clone();
	vigil_worker::spawn(TaskClass::Background, async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::info!("interrupted");
			cancel.cancel();
		}
	});
	token
}

pub async fn analyze(config: &VigilConfig, paths: Vec<PathBuf>, reset_cache: bool) -> anyhow::Result<()> {
	let label_selector = config.analyzer.label_selector.clone();
	let request = if paths.is_empty() {
		AnalysisRequest::full(label_selector)
	} else {
		let root = &config.analyzer.workspace_root;
		AnalysisRequest::partial(label_selector, paths.iter().map(|path| absolute(root, path)))
	}
	.with_reset_cache(reset_cache);

	let cancel = cancel_on_ctrl_c();
	let client = start_analyzer(config, &cancel).await?;
	let outcome = client.run_analysis(request, cancel).await;
	client.stop().await;

	match outcome.context("analysis failed")? {
		AnalysisOutcome::Completed(report) => print_json(&report),
		AnalysisOutcome::Cancelled => {
			tracing::warn!("analysis cancelled; no results");
			Ok(())
		}
	}
}

pub async fn solve(config: &VigilConfig, incidents: &Path, effort: EffortLevel) -> anyhow::Result<()> {
	let text = std::fs::read_to_string(incidents).with_context(|| format!("failed to read {}", incidents.display()))?;
	let params: SolutionParams =
		serde_json::from_str(&text).with_context(|| format!("{} is not a solution request", incidents.display()))?;
	let request = SolutionRequest::new(params, effort, uuid::Uuid::new_v4().to_string());
	let input = solution_input(&request)?;
	let caches = CacheSet::from_config(&config.cache);
	let cancel = cancel_on_ctrl_c();

	let mut started = None;
	let solution = vigil_cache::get_or_compute(caches.cache.as_ref(), &input, SOLUTION_NAMESPACE, || {
		request_solution(config, request, &cancel, &mut started)
	})
	.await;
	if let Some(client) = started {
		client.stop().await;
	}
	let solution = solution?;

	let output = serde_json::to_value(&solution)?;
	if let Some(path) = caches.tracer.update(&input, SOLUTION_NAMESPACE, &output).await {
		tracing::debug!(path = %path.display(), "solution traced");
	}
	print_json(&solution)
}

async fn request_solution(
	config: &VigilConfig,
	request: SolutionRequest,
	cancel: &CancellationToken,
	started: &mut Option<Arc<AnalyzerClient>>,
) -> anyhow::Result<Solution> {
	let client = started.insert(start_analyzer(config, cancel).await?);
	let progress = vigil_worker::spawn(
		TaskClass::Background,
		log_progress(client.subscribe_progress(), request.chat_token.clone()),
	);
	let solution = tokio::select! {
		solution = client.request_solution(request) => solution.context("solution request failed"),
		_ = cancel.cancelled() => Err(anyhow::anyhow!("solution request interrupted")),
	};
	progress.abort();
	solution
}

/// Cache input for a solution request. The chat token is left out so identical requests share an
/// entry.
fn solution_input(request: &SolutionRequest) -> anyhow::Result<ModelInput> {
	let mut keyed = serde_json::to_value(request)?;
	if let Some(object) = keyed.as_object_mut() {
		object.remove("chat_token");
	}
	Ok(ModelInput::from(vec![
		ChatMessage::new(Role::System, methods::GET_SOLUTION),
		ChatMessage::new(Role::Human, serde_json::to_string_pretty(&keyed)?),
	]))
}

async fn log_progress(mut progress: broadcast::Receiver<ProgressEvent>, chat_token: String) {
	loop {
		match progress.recv().await {
			Ok(event) if event.belongs_to(&chat_token) => {
				tracing::info!(kind = %event.kind, value = %event.value, "solution.progress");
			}
			Ok(_) => {}
			Err(broadcast::error::RecvError::Lagged(skipped)) => tracing::debug!(skipped, "progress lagged"),
			Err(broadcast::error::RecvError::Closed) => break,
		}
	}
}

pub async fn watch(config: &VigilConfig, hot_rerun: bool) -> anyhow::Result<()> {
	let cancel = cancel_on_ctrl_c();
	let client = start_analyzer(config, &cancel).await?;
	let mut coalescer_config = CoalescerConfig::from_analyzer_config(&config.analyzer);
	coalescer_config.hot_rerun |= hot_rerun;
	let coalescer = match ChangeCoalescer::new(
		Arc::clone(&client) as Arc<dyn ChangeSink>,
		client.gate().clone(),
		coalescer_config,
	) {
		Ok(coalescer) => coalescer,
		Err(e) => {
			client.stop().await;
			return Err(e).context("invalid exclude patterns");
		}
	};

	let result = forward_changes(&client, &coalescer, &cancel).await;
	coalescer.dispose();
	client.stop().await;
	result?;

	match client.last_results() {
		Some(results) => print_json(&results),
		None => Ok(()),
	}
}

/// Feeds stdin into the coalescer until EOF, then waits for queued changes to flush.
async fn forward_changes(
	client: &AnalyzerClient,
	coalescer: &ChangeCoalescer,
	cancel: &CancellationToken,
) -> anyhow::Result<()> {
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	let mut state = client.subscribe_state();

	loop {
		tokio::select! {
			line = lines.next_line() => match line.context("failed to read stdin")? {
				Some(line) if line.trim().is_empty() => {}
				Some(line) => match serde_json::from_str::<FileChange>(&line) {
					Ok(change) => coalescer.notify_file_changes(change),
					Err(e) => tracing::warn!(error = %e, "ignoring malformed change"),
				},
				None => break,
			},
			changed = state.changed() => {
				if changed.is_err() || *state.borrow_and_update() == ServerState::Stopped {
					anyhow::bail!("analyzer stopped unexpectedly");
				}
			}
			_ = cancel.cancelled() => {
				tracing::info!("dropping queued changes");
				return Ok(());
			}
		}
	}

	tracing::debug!("stdin closed; draining queued changes");
	while !(coalescer.pending_notify().is_empty() && coalescer.pending_analyze().is_empty()) {
		if client.state() != ServerState::Running {
			anyhow::bail!("analyzer stopped with changes still queued");
		}
		tokio::select! {
			_ = tokio::time::sleep(Duration::from_millis(100)) => {}
			_ = cancel.cancelled() => return Ok(()),
		}
	}
	Ok(())
}

fn absolute(root: &Path, path: &Path) -> PathBuf {
	if path.is_relative() { root.join(path) } else { path.to_path_buf() }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
	let mut stdout = std::io::stdout().lock();
	serde_json::to_writer_pretty(&mut stdout, value)?;
	std::io::Write::write_all(&mut stdout, b"\n")?;
	Ok(())
}
