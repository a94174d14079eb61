//! Per-process monitor task.
//!
//! The task owns the [`ProcessControl`] and the stderr stream and folds three event sources into
//! one loop: process exit, stderr lines and kill requests. Everyone else talks to it through a
//! [`MonitorHandle`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use vigil_worker::TaskClass;

use super::Shared;
use crate::endpoint::BoxReader;
use crate::launcher::{ProcessControl, ProcessExit};
use crate::state::ServerState;

pub(super) struct MonitorHandle {
	kill_tx: mpsc::UnboundedSender<()>,
	exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl MonitorHandle {
	pub(super) fn spawn(
		control: Box<dyn ProcessControl>,
		stderr: BoxReader,
		ready_marker: String,
		ready_tx: oneshot::Sender<()>,
		shared: Arc<Shared>,
		session: u64,
	) -> Self {
		let (kill_tx, kill_rx) = mpsc::unbounded_channel();
		let (exit_tx, exit_rx) = watch::channel(None);
		let monitor = Monitor {
			control,
			ready_marker,
			ready_tx: Some(ready_tx),
			kill_rx,
			exit_tx,
			shared,
			session,
		};
		vigil_worker::spawn(TaskClass::Supervision, monitor.run(stderr));
		Self { kill_tx, exit_rx }
	}

	/// Asks the monitor to kill the process. No-op once it has exited.
	pub(super) fn kill(&self) {
		let _ = self.kill_tx.send(());
	}

	/// Resolves once the process has exited.
	pub(super) async fn exited(&self) -> ProcessExit {
		let mut rx = self.exit_rx.clone();
		let exit = rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit);
		// Only reached without a value if the monitor task itself died.
		exit.unwrap_or(ProcessExit { code: None, killed: false })
	}
}

struct Monitor {
	control: Box<dyn ProcessControl>,
	ready_marker: String,
	ready_tx: Option<oneshot::Sender<()>>,
	kill_rx: mpsc::UnboundedReceiver<()>,
	exit_tx: watch::Sender<Option<ProcessExit>>,
	shared: Arc<Shared>,
	session: u64,
}

impl Monitor {
	async fn run(mut self, stderr: BoxReader) {
		let mut lines = BufReader::new(stderr).lines();
		let mut stderr_open = true;
		let mut kill_open = true;

		let exit = loop {
			tokio::select! {
				exit = self.control.wait() => match exit {
					Ok(exit) => break exit,
					Err(e) => {
						tracing::warn!(error = %e, "failed to wait for analyzer");
						break ProcessExit { code: None, killed: false };
					}
				},
				line = lines.next_line(), if stderr_open => match line {
					Ok(Some(line)) => self.on_stderr_line(&line),
					Ok(None) => stderr_open = false,
					Err(e) => {
						tracing::debug!(error = %e, "analyzer stderr closed");
						stderr_open = false;
					}
				},
				kill = self.kill_rx.recv(), if kill_open => {
					// A dropped handle means nobody will ever stop this process.
					if kill.is_none() {
						kill_open = false;
						tracing::debug!("monitor handle dropped; killing analyzer");
					}
					if let Err(e) = self.control.start_kill() {
						tracing::warn!(error = %e, "failed to kill analyzer");
					}
				}
			}
		};

		self.exit_tx.send_replace(Some(exit));
		drop(self.ready_tx.take());
		self.on_exit(exit);
	}

	fn on_stderr_line(&mut self, line: &str) {
		tracing::debug!(target: "vigil_analyzer::stderr", "{line}");
		if self.ready_tx.is_some() && line.contains(&self.ready_marker) {
			tracing::debug!("analyzer reported ready");
			if let Some(tx) = self.ready_tx.take() {
				let _ = tx.send(());
			}
		}
	}

	fn on_exit(&self, exit: ProcessExit) {
		let shared = &self.shared;
		if shared.session.load(Ordering::Acquire) != self.session {
			tracing::debug!(%exit, "stale analyzer exited");
			return;
		}

		*shared.pid.lock() = None;
		if let Some(connection) = shared.connection.write().take() {
			connection.dispose();
		}

		if shared.shutdown_requested.load(Ordering::Acquire) {
			tracing::info!(%exit, "analyzer exited");
			return;
		}
		let previous = *shared.state_tx.borrow();
		let stopped = shared.state_tx.send_if_modified(|state| {
			if matches!(state, ServerState::Running | ServerState::ConnectionEstablished) {
				*state = ServerState::Stopped;
				true
			} else {
				false
			}
		});
		if stopped {
			tracing::error!(%exit, from = %previous, "analyzer exited unexpectedly");
		} else {
			tracing::info!(%exit, state = %previous, "analyzer exited");
		}
	}
}
