//! Turns a stream of file-change events into batched notify and analyze calls.
//!
//! Changes land in two path-keyed queues. Each queue is drained by its own [`RetryScheduler`], and
//! every flush must take the shared [`ExclusionGate`] first, so a notify flush, an analyze flush
//! and a manual analysis never overlap. A flush that finds the gate taken re-arms its scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use globset::GlobSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use vigil_worker::{BackoffConfig, ExclusionGate, Intent, IntentGuard, RetryScheduler};

use crate::config::{AnalyzerConfig, ConfigError, build_globset};
use crate::{Error, Result};

/// One edit or save reported by a file watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
	pub path: PathBuf,
	/// Full buffer contents at the time of the change.
	pub content: String,
	/// True when the change was written to disk.
	#[serde(default)]
	pub saved: bool,
}

/// Receiver of coalesced batches. Both calls run under the intent the coalescer acquired.
#[async_trait]
pub trait ChangeSink: Send + Sync {
	async fn notify_changes(&self, changes: Vec<FileChange>, guard: &IntentGuard) -> Result<()>;

	async fn analyze_paths(&self, paths: Vec<PathBuf>, guard: &IntentGuard) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CoalescerConfig {
	pub hot_rerun: bool,
	pub exclude: Vec<String>,
	/// Exclude globs are also matched against paths relative to this root.
	pub workspace_root: Option<PathBuf>,
	pub notify_backoff: BackoffConfig,
	pub analyze_backoff: BackoffConfig,
}

impl Default for CoalescerConfig {
	fn default() -> Self {
		Self::from_analyzer_config(&AnalyzerConfig::default())
	}
}

impl CoalescerConfig {
	pub fn from_analyzer_config(config: &AnalyzerConfig) -> Self {
		Self {
			hot_rerun: config.hot_rerun,
			exclude: config.exclude.clone(),
			workspace_root: (!config.workspace_root.as_os_str().is_empty()).then(|| config.workspace_root.clone()),
			notify_backoff: config.notify_backoff.to_config(),
			analyze_backoff: config.analyze_backoff.to_config(),
		}
	}
}

#[derive(Default)]
struct Queues {
	/// Stamps every enqueue so a flush only removes entries it actually sent.
	seq: u64,
	notify: HashMap<PathBuf, (u64, FileChange)>,
	analyze: HashMap<PathBuf, u64>,
}

struct IgnoreList {
	globs: GlobSet,
	root: Option<PathBuf>,
}

impl IgnoreList {
	fn matches(&self, path: &Path) -> bool {
		if self.globs.is_empty() {
			return false;
		}
		self.globs.is_match(path)
			|| self
				.root
				.as_deref()
				.and_then(|root| path.strip_prefix(root).ok())
				.is_some_and(|relative| self.globs.is_match(relative))
	}
}

struct Inner {
	sink: Arc<dyn ChangeSink>,
	gate: ExclusionGate,
	queues: Mutex<Queues>,
	ignore: RwLock<IgnoreList>,
	hot_rerun: AtomicBool,
	notify: RetryScheduler,
	analyze: RetryScheduler,
}

/// Debounces file changes into notify and analyze batches.
///
/// Dropping the coalescer cancels pending flushes.
pub struct ChangeCoalescer {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for ChangeCoalescer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChangeCoalescer")
			.field("notify", &self.inner.notify)
			.field("analyze", &self.inner.analyze)
			.field("hot_rerun", &self.inner.hot_rerun.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl ChangeCoalescer {
	pub fn new(sink: Arc<dyn ChangeSink>, gate: ExclusionGate, config: CoalescerConfig) -> Result<Self, ConfigError> {
		let globs = build_globset(&config.exclude)?;
		Ok(Self {
			inner: Arc::new(Inner {
				sink,
				gate,
				queues: Mutex::new(Queues::default()),
				ignore: RwLock::new(IgnoreList {
					globs,
					root: config.workspace_root,
				}),
				hot_rerun: AtomicBool::new(config.hot_rerun),
				notify: RetryScheduler::new("notify", config.notify_backoff),
				analyze: RetryScheduler::new("analyze", config.analyze_backoff),
			}),
		})
	}

	/// Queues a change. Latest content per path wins.
	///
	/// The path is also staged for analysis when the change was saved, or on every change in hot
	/// rerun mode.
	pub fn notify_file_changes(&self, change: FileChange) {
		let stage_analysis = change.saved || self.inner.hot_rerun.load(Ordering::Acquire);
		{
			let mut queues = self.inner.queues.lock();
			queues.seq += 1;
			let seq = queues.seq;
			if stage_analysis {
				queues.analyze.insert(change.path.clone(), seq);
			}
			queues.notify.insert(change.path.clone(), (seq, change));
		}
		self.inner.schedule_notify();
		if stage_analysis {
			self.inner.schedule_analyze();
		}
	}

	pub fn set_hot_rerun(&self, enabled: bool) {
		self.inner.hot_rerun.store(enabled, Ordering::Release);
	}

	pub fn hot_rerun(&self) -> bool {
		self.inner.hot_rerun.load(Ordering::Acquire)
	}

	/// Replaces the exclude globs. Applies to queued entries at their next flush.
	pub fn set_ignore_patterns(&self, patterns: &[String]) -> Result<(), ConfigError> {
		let globs = build_globset(patterns)?;
		self.inner.ignore.write().globs = globs;
		Ok(())
	}

	/// Paths waiting for the next notify flush, sorted.
	pub fn pending_notify(&self) -> Vec<PathBuf> {
		let mut paths: Vec<_> = self.inner.queues.lock().notify.keys().cloned().collect();
		paths.sort();
		paths
	}

	/// Paths waiting for the next analyze flush, sorted.
	pub fn pending_analyze(&self) -> Vec<PathBuf> {
		let mut paths: Vec<_> = self.inner.queues.lock().analyze.keys().cloned().collect();
		paths.sort();
		paths
	}

	/// Cancels pending flushes and ignores later ones. Queued entries are kept. Idempotent.
	pub fn dispose(&self) {
		self.inner.notify.dispose();
		self.inner.analyze.dispose();
	}
}

impl Drop for ChangeCoalescer {
	fn drop(&mut self) {
		self.dispose();
	}
}

impl Inner {
	fn schedule_notify(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		self.notify.schedule(move || flush(weak, Inner::flush_notify));
	}

	fn schedule_analyze(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		self.analyze.schedule(move || flush(weak, Inner::flush_analyze));
	}

	async fn flush_notify(self: Arc<Self>) {
		let Some(guard) = self.gate.try_acquire(Intent::NotifyFlush) else {
			tracing::trace!(holder = ?self.gate.holder(), "notify flush deferred");
			self.schedule_notify();
			return;
		};

		let mut batch: Vec<(u64, FileChange)> = {
			let mut queues = self.queues.lock();
			let ignore = self.ignore.read();
			queues.notify.retain(|path, _| keep(&ignore, path));
			queues.notify.values().cloned().collect()
		};
		if batch.is_empty() {
			return;
		}
		batch.sort_by(|a, b| a.1.path.cmp(&b.1.path));

		let changes = batch.iter().map(|(_, change)| change.clone()).collect();
		match self.sink.notify_changes(changes, &guard).await {
			Ok(()) => {
				{
					let mut queues = self.queues.lock();
					for (seq, change) in &batch {
						if queues.notify.get(&change.path).is_some_and(|(queued, _)| queued == seq) {
							queues.notify.remove(&change.path);
						}
					}
				}
				let delay = self.notify.increase_backoff();
				tracing::debug!(count = batch.len(), next_delay = ?delay, "notify flush sent");
			}
			Err(e) => log_dispatch_failure("notify", &e),
		}
		drop(guard);

		if !self.queues.lock().notify.is_empty() {
			self.schedule_notify();
		}
	}

	async fn flush_analyze(self: Arc<Self>) {
		let Some(guard) = self.gate.try_acquire(Intent::AnalyzeFlush) else {
			tracing::trace!(holder = ?self.gate.holder(), "analyze flush deferred");
			self.schedule_analyze();
			return;
		};

		let mut batch: Vec<(PathBuf, u64)> = {
			let mut queues = self.queues.lock();
			let ignore = self.ignore.read();
			queues.analyze.retain(|path, _| keep(&ignore, path));
			queues.analyze.iter().map(|(path, seq)| (path.clone(), *seq)).collect()
		};
		if batch.is_empty() {
			return;
		}
		batch.sort();

		let paths = batch.iter().map(|(path, _)| path.clone()).collect();
		match self.sink.analyze_paths(paths, &guard).await {
			Ok(()) => {
				{
					let mut queues = self.queues.lock();
					for (path, seq) in &batch {
						if queues.analyze.get(path) == Some(seq) {
							queues.analyze.remove(path);
						}
					}
				}
				let delay = self.analyze.increase_backoff();
				tracing::debug!(count = batch.len(), next_delay = ?delay, "analyze flush done");
			}
			Err(e) => log_dispatch_failure("analyze", &e),
		}
		drop(guard);

		if !self.queues.lock().analyze.is_empty() {
			self.schedule_analyze();
		}
	}
}

async fn flush<F, Fut>(inner: Weak<Inner>, run: F)
where
	F: FnOnce(Arc<Inner>) -> Fut,
	Fut: Future<Output = ()>,
{
	if let Some(inner) = inner.upgrade() {
		run(inner).await;
	}
}

fn keep(ignore: &IgnoreList, path: &Path) -> bool {
	let ignored = ignore.matches(path);
	if ignored {
		tracing::debug!(path = %path.display(), "dropping excluded path");
	}
	!ignored
}

fn log_dispatch_failure(kind: &'static str, error: &Error) {
	match error {
		Error::NotRunning(state) => tracing::debug!(kind, %state, "flush skipped; analyzer not running"),
		other => tracing::warn!(kind, error = %other, "flush failed; will retry"),
	}
}
