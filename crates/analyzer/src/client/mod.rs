//! Supervisor for one external analyzer process and its RPC connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vigil_rpc::{Connection, NotificationReceiver};
use vigil_worker::{ExclusionGate, Intent, IntentGuard, TaskClass};

use crate::analysis::{AnalysisOutcome, AnalysisReport, AnalysisRequest, AnalysisResponse, PartialSummary};
use crate::coalescer::{ChangeSink, FileChange};
use crate::config::AnalyzerConfig;
use crate::endpoint::LocalEndpoint;
use crate::launcher::{AnalyzerLauncher, LaunchSpec};
use crate::solution::{EffortLevel, ProgressEvent, Solution, SolutionParams, SolutionRequest};
use crate::state::ServerState;
use crate::{Error, Result};

mod monitor;

use monitor::MonitorHandle;

/// RPC method names spoken with the analyzer.
pub mod methods {
	/// Notification sent once the connection is up.
	pub const START: &str = "start";
	pub const ANALYZE: &str = "analysis_engine.Analyze";
	pub const STOP: &str = "analysis_engine.Stop";
	pub const NOTIFY_FILE_CHANGES: &str = "analysis_engine.NotifyFileChanges";
	pub const GET_SOLUTION: &str = "getCodeplanAgentSolution";
	/// Inbound progress notification.
	pub const PROGRESS: &str = "my_progress";
}

const PROGRESS_CAPACITY: usize = 256;

/// State shared with the monitor task.
struct Shared {
	state_tx: watch::Sender<ServerState>,
	progress_tx: broadcast::Sender<ProgressEvent>,
	shutdown_requested: AtomicBool,
	/// Bumped per launch; a monitor only touches shared state for its own session.
	session: AtomicU64,
	connection: RwLock<Option<Connection>>,
	pid: Mutex<Option<u32>>,
	analyzing: AtomicBool,
	last_results: Mutex<Option<AnalysisResponse>>,
}

impl Shared {
	fn set_state(&self, next: ServerState) {
		let previous = self.state_tx.send_replace(next);
		if previous != next {
			tracing::debug!(from = %previous, to = %next, "analyzer.state");
		}
	}

	/// Moves from `from` to `to` only if the state is still `from`.
	fn transition(&self, from: ServerState, to: ServerState) -> bool {
		let moved = self.state_tx.send_if_modified(|state| {
			if *state == from {
				*state = to;
				true
			} else {
				false
			}
		});
		if moved {
			tracing::debug!(%from, %to, "analyzer.state");
		}
		moved
	}
}

/// Live process of a started server.
struct Session {
	monitor: MonitorHandle,
	progress: JoinHandle<()>,
	/// Held so the socket file outlives the process.
	_endpoint: LocalEndpoint,
}

/// Owns the lifecycle of one analyzer process.
///
/// `start` and `stop` are serialized; analysis and solution requests run concurrently with each
/// other but require the server to be [`ServerState::Running`].
pub struct AnalyzerClient {
	config: RwLock<AnalyzerConfig>,
	launcher: Arc<dyn AnalyzerLauncher>,
	gate: ExclusionGate,
	shared: Arc<Shared>,
	lifecycle: tokio::sync::Mutex<Option<Session>>,
}

impl std::fmt::Debug for AnalyzerClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AnalyzerClient")
			.field("state", &self.state())
			.field("pid", &self.process_id())
			.finish_non_exhaustive()
	}
}

impl AnalyzerClient {
	pub fn new(config: AnalyzerConfig, launcher: Arc<dyn AnalyzerLauncher>, gate: ExclusionGate) -> Self {
		let (state_tx, _) = watch::channel(ServerState::Initial);
		let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);
		Self {
			config: RwLock::new(config),
			launcher,
			gate,
			shared: Arc::new(Shared {
				state_tx,
				progress_tx,
				shutdown_requested: AtomicBool::new(false),
				session: AtomicU64::new(0),
				connection: RwLock::new(None),
				pid: Mutex::new(None),
				analyzing: AtomicBool::new(false),
				last_results: Mutex::new(None),
			}),
			lifecycle: tokio::sync::Mutex::new(None),
		}
	}

	/// Validates the current config, moving to `ConfigurationReady` or `ConfigurationNeeded`.
	///
	/// Only allowed while no process exists.
	pub fn configure(&self) -> Result<()> {
		let state = self.state();
		if state.has_process() {
			return Err(Error::InvalidState {
				operation: "configure",
				state,
			});
		}
		match self.config.read().validate() {
			Ok(()) => {
				self.shared.set_state(ServerState::ConfigurationReady);
				Ok(())
			}
			Err(e) => {
				tracing::warn!(error = %e, "analyzer configuration incomplete");
				self.shared.set_state(ServerState::ConfigurationNeeded);
				Err(e.into())
			}
		}
	}

	/// Replaces the config and validates it.
	pub fn set_config(&self, config: AnalyzerConfig) -> Result<()> {
		let state = self.state();
		if state.has_process() {
			return Err(Error::InvalidState {
				operation: "reconfigure",
				state,
			});
		}
		*self.config.write() = config;
		self.configure()
	}

	pub fn config(&self) -> AnalyzerConfig {
		self.config.read().clone()
	}

	pub fn gate(&self) -> &ExclusionGate {
		&self.gate
	}

	pub fn state(&self) -> ServerState {
		*self.shared.state_tx.borrow()
	}

	/// Watches state transitions.
	pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
		self.shared.state_tx.subscribe()
	}

	/// Receives `my_progress` notifications from the analyzer.
	pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
		self.shared.progress_tx.subscribe()
	}

	/// Returns true while an `analysis_engine.Analyze` request is outstanding.
	pub fn is_analyzing(&self) -> bool {
		self.shared.analyzing.load(Ordering::Acquire)
	}

	pub fn process_id(&self) -> Option<u32> {
		*self.shared.pid.lock()
	}

	pub fn has_process(&self) -> bool {
		self.process_id().is_some()
	}

	/// Results of the last full analysis, with later partial runs merged in.
	pub fn last_results(&self) -> Option<AnalysisResponse> {
		self.shared.last_results.lock().clone()
	}

	/// Starts the analyzer and waits until it is [`ServerState::Running`].
	///
	/// Validation failures leave the state untouched. Any later failure ends in
	/// [`ServerState::StartFailed`] with no process left behind.
	pub async fn start(&self) -> Result<()> {
		self.start_with(&CancellationToken::new()).await
	}

	/// Like [`start`](Self::start), but gives up once `cancel` fires.
	///
	/// A cancelled start kills the half-launched process and fails with [`Error::StartCancelled`].
	pub async fn start_with(&self, cancel: &CancellationToken) -> Result<()> {
		let mut lifecycle = self.lifecycle.lock().await;
		let state = self.state();
		if !state.can_start() {
			return Err(Error::InvalidState { operation: "start", state });
		}
		let config = self.config();
		config.validate()?;
		// Leftovers of a process that already exited.
		drop(lifecycle.take());

		self.shared.shutdown_requested.store(false, Ordering::Release);
		self.shared.set_state(ServerState::Starting);
		match self.launch(&config, cancel).await {
			Ok(session) => {
				*lifecycle = Some(session);
				tracing::info!(pid = ?self.process_id(), "analyzer running");
				Ok(())
			}
			Err(e) => {
				tracing::error!(error = %e, "analyzer failed to start");
				self.shared.set_state(ServerState::StartFailed);
				Err(e)
			}
		}
	}

	async fn launch(&self, config: &AnalyzerConfig, cancel: &CancellationToken) -> Result<Session> {
		if cancel.is_cancelled() {
			return Err(Error::StartCancelled);
		}
		let mut endpoint = LocalEndpoint::bind()?;
		let address = endpoint.address();
		let spec = LaunchSpec {
			program: config.analyzer_path.clone(),
			args: config.derive_args(&address),
			env: config.env.clone(),
			cwd: Some(config.workspace_root.clone()),
			endpoint: address,
		};
		let command = spec.command_line();
		let process = self.launcher.launch(spec).await.map_err(|e| Error::Spawn {
			command,
			reason: e.to_string(),
		})?;

		let session = self.shared.session.fetch_add(1, Ordering::AcqRel) + 1;
		*self.shared.pid.lock() = process.pid;
		let (ready_tx, ready_rx) = oneshot::channel();
		let monitor = MonitorHandle::spawn(
			process.control,
			process.stderr,
			config.ready_marker.clone(),
			ready_tx,
			Arc::clone(&self.shared),
			session,
		);

		let ready_timeout = config.ready_timeout();
		let grace = config.stop_grace();
		let ready = tokio::select! {
			ready = ready_rx => ready.is_ok(),
			_ = tokio::time::sleep(ready_timeout) => {
				self.abort_launch(&monitor, grace).await;
				return Err(Error::ReadyTimeout(ready_timeout));
			}
			_ = cancel.cancelled() => {
				self.abort_launch(&monitor, grace).await;
				return Err(Error::StartCancelled);
			}
		};
		if !ready {
			let exit = monitor.exited().await;
			self.abort_launch(&monitor, grace).await;
			return Err(Error::EarlyExit(exit));
		}

		self.shared.set_state(ServerState::EstablishingConnection);
		let accepted = tokio::select! {
			accepted = endpoint.accept() => accepted.map_err(|e| Error::Handshake(e.to_string())),
			exit = monitor.exited() => Err(Error::EarlyExit(exit)),
			_ = tokio::time::sleep(ready_timeout) => {
				Err(Error::Handshake(format!("analyzer did not connect within {ready_timeout:?}")))
			}
			_ = cancel.cancelled() => Err(Error::StartCancelled),
		};
		let (reader, writer) = match accepted {
			Ok(halves) => halves,
			Err(e) => {
				self.abort_launch(&monitor, grace).await;
				return Err(e);
			}
		};

		let (connection, notifications) = Connection::spawn("analyzer", reader, writer);
		*self.shared.connection.write() = Some(connection.clone());
		self.shared.set_state(ServerState::ConnectionEstablished);

		if let Err(e) = connection.notify_flushed(methods::START, serde_json::json!({})).await {
			self.abort_launch(&monitor, grace).await;
			return Err(Error::Handshake(format!("`{}` notification failed: {e}", methods::START)));
		}
		let progress = vigil_worker::spawn(
			TaskClass::Transport,
			forward_progress(notifications, self.shared.progress_tx.clone()),
		);

		if !self.shared.transition(ServerState::ConnectionEstablished, ServerState::Running) {
			progress.abort();
			self.abort_launch(&monitor, grace).await;
			return Err(Error::ProcessExited);
		}

		Ok(Session {
			monitor,
			progress,
			_endpoint: endpoint,
		})
	}

	async fn abort_launch(&self, monitor: &MonitorHandle, grace: Duration) {
		if let Some(connection) = self.shared.connection.write().take() {
			connection.dispose();
		}
		monitor.kill();
		if tokio::time::timeout(grace, monitor.exited()).await.is_err() {
			tracing::warn!("analyzer did not exit after kill");
		}
		*self.shared.pid.lock() = None;
	}

	/// Shuts the analyzer down. Idempotent; always ends in [`ServerState::Stopped`].
	///
	/// Asks the analyzer to stop, waits up to the grace period for it to exit and kills it
	/// otherwise. Errors along the way are logged, not returned.
	pub async fn stop(&self) {
		let mut lifecycle = self.lifecycle.lock().await;
		self.shared.shutdown_requested.store(true, Ordering::Release);

		let Some(session) = lifecycle.take() else {
			self.shared.set_state(ServerState::Stopped);
			return;
		};
		self.shared.set_state(ServerState::Stopping);
		let grace = self.config.read().stop_grace();
		// The stop request and the exit wait share one grace period.
		let deadline = tokio::time::Instant::now() + grace;

		let connection = self.shared.connection.write().take();
		if let Some(connection) = connection {
			match tokio::time::timeout_at(deadline, connection.request(methods::STOP, serde_json::json!({}))).await {
				Ok(Ok(_)) => tracing::debug!("analyzer acknowledged stop"),
				Ok(Err(e)) => tracing::debug!(error = %e, "stop request failed"),
				Err(_) => tracing::debug!("stop request unanswered"),
			}
			connection.dispose();
		}

		match tokio::time::timeout_at(deadline, session.monitor.exited()).await {
			Ok(exit) => tracing::info!(%exit, "analyzer stopped"),
			Err(_) => {
				tracing::warn!(?grace, "analyzer still alive after grace period; killing");
				session.monitor.kill();
				if tokio::time::timeout(grace, session.monitor.exited()).await.is_err() {
					tracing::error!("analyzer did not exit after kill");
				}
			}
		}

		session.progress.abort();
		*self.shared.pid.lock() = None;
		self.shared.set_state(ServerState::Stopped);
	}

	/// Runs an analysis once no other intent holds the gate.
	///
	/// Cancelling `cancel` abandons the wait, including the wait for the gate.
	pub async fn run_analysis(&self, request: AnalysisRequest, cancel: CancellationToken) -> Result<AnalysisOutcome> {
		self.connection_if_running()?;
		let guard = tokio::select! {
			guard = self.gate.acquire(Intent::Analysis) => guard,
			_ = cancel.cancelled() => {
				tracing::info!("analysis cancelled before it started");
				return Ok(AnalysisOutcome::Cancelled);
			}
		};
		self.run_analysis_with(&guard, request, cancel).await
	}

	/// Runs an analysis under an intent the caller already holds.
	///
	/// On cancellation the request is abandoned; a late response is discarded and the server state
	/// is unchanged.
	pub async fn run_analysis_with(&self, guard: &IntentGuard, request: AnalysisRequest, cancel: CancellationToken) -> Result<AnalysisOutcome> {
		debug_assert!(guard.intent().is_analysis(), "analysis under {} intent", guard.intent());
		let connection = self.connection_if_running()?;
		let params = serde_json::to_value(&request)?;

		let _analyzing = AnalyzingFlag::raise(&self.shared.analyzing);
		let started = Instant::now();
		tracing::info!(
			intent = %guard.intent(),
			paths = request.included_paths.as_ref().map(|p| p.len()),
			reset_cache = request.reset_cache,
			"analysis.start"
		);

		let raw = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				tracing::info!("analysis cancelled; abandoning request");
				return Ok(AnalysisOutcome::Cancelled);
			}
			result = connection.request(methods::ANALYZE, params) => result?,
		};
		let response = AnalysisResponse::from_value(raw)?;

		let partial = {
			let mut last = self.shared.last_results.lock();
			match &request.included_paths {
				Some(paths) => {
					let before = last.as_ref().map_or(0, |prev| prev.count_incidents(Some(paths)));
					let after = response.count_incidents(Some(paths));
					match last.as_mut() {
						Some(prev) => prev.merge_partial(&response, paths),
						None => *last = Some(response.clone()),
					}
					Some(PartialSummary {
						before,
						after,
						paths: paths.clone(),
					})
				}
				None => {
					*last = Some(response.clone());
					None
				}
			}
		};

		tracing::info!(
			rulesets = response.rulesets.len(),
			incidents = response.count_incidents(None),
			elapsed_ms = started.elapsed().as_millis() as u64,
			"analysis.done"
		);
		Ok(AnalysisOutcome::Completed(AnalysisReport { response, partial }))
	}

	/// Requests a fix with a fresh chat token.
	pub async fn get_solution(&self, params: SolutionParams, effort: EffortLevel) -> Result<Solution> {
		let chat_token = uuid::Uuid::new_v4().to_string();
		self.request_solution(SolutionRequest::new(params, effort, chat_token)).await
	}

	/// Sends a prepared solution request.
	///
	/// Progress arrives on [`Self::subscribe_progress`] tagged with the request's chat token.
	pub async fn request_solution(&self, request: SolutionRequest) -> Result<Solution> {
		let connection = self.connection_if_running()?;
		tracing::info!(
			file = %request.file_path.display(),
			incidents = request.incidents.len(),
			chat_token = %request.chat_token,
			"solution.request"
		);
		let raw = connection.request(methods::GET_SOLUTION, serde_json::to_value(&request)?).await?;
		serde_json::from_value(raw).map_err(|e| Error::MalformedResponse(format!("invalid solution: {e}")))
	}

	fn connection_if_running(&self) -> Result<Connection> {
		let state = self.state();
		if state != ServerState::Running {
			return Err(Error::NotRunning(state));
		}
		self.shared.connection.read().clone().ok_or(Error::NotRunning(state))
	}
}

#[async_trait]
impl ChangeSink for AnalyzerClient {
	async fn notify_changes(&self, changes: Vec<FileChange>, _guard: &IntentGuard) -> Result<()> {
		let connection = self.connection_if_running()?;
		tracing::debug!(count = changes.len(), "notify.flush");
		let params = serde_json::json!({ "changes": changes });
		connection.notify_flushed(methods::NOTIFY_FILE_CHANGES, params).await?;
		Ok(())
	}

	async fn analyze_paths(&self, paths: Vec<PathBuf>, guard: &IntentGuard) -> Result<()> {
		let label_selector = self.config.read().label_selector.clone();
		let request = AnalysisRequest::partial(label_selector, paths);
		self.run_analysis_with(guard, request, CancellationToken::new()).await?;
		Ok(())
	}
}

struct AnalyzingFlag<'a>(&'a AtomicBool);

impl<'a> AnalyzingFlag<'a> {
	fn raise(flag: &'a AtomicBool) -> Self {
		flag.store(true, Ordering::Release);
		Self(flag)
	}
}

impl Drop for AnalyzingFlag<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

async fn forward_progress(mut notifications: NotificationReceiver, progress_tx: broadcast::Sender<ProgressEvent>) {
	while let Some(notif) = notifications.recv().await {
		if notif.method != methods::PROGRESS {
			tracing::debug!(method = %notif.method, "ignoring analyzer notification");
			continue;
		}
		match serde_json::from_value::<ProgressEvent>(notif.params) {
			Ok(event) => {
				tracing::trace!(kind = %event.kind, "analyzer.progress");
				// No subscribers is fine.
				let _ = progress_tx.send(event);
			}
			Err(e) => tracing::warn!(error = %e, "malformed progress notification"),
		}
	}
}
