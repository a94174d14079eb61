use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::TaskClass;

/// Delay bounds for a [`RetryScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
	/// Delay used for the first scheduled run.
	pub initial_delay: Duration,
	/// Upper bound the delay grows toward.
	pub max_delay: Duration,
	/// Step added by [`RetryScheduler::increase_backoff`].
	pub increment: Duration,
}

impl BackoffConfig {
	/// Creates a config. A `max_delay` below `initial_delay` is raised to it.
	pub fn new(initial_delay: Duration, max_delay: Duration, increment: Duration) -> Self {
		Self {
			initial_delay,
			max_delay: max_delay.max(initial_delay),
			increment,
		}
	}

	/// Returns the delay that follows `current`, capped at `max_delay`.
	pub fn next_delay(&self, current: Duration) -> Duration {
		current.saturating_add(self.increment).min(self.max_delay)
	}
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self::new(Duration::from_millis(500), Duration::from_secs(5), Duration::from_millis(500))
	}
}

struct BackoffState {
	current_delay: Duration,
	/// Bumped on every `schedule`; a timer only fires if it still owns the latest value.
	generation: u64,
	timer: Option<JoinHandle<()>>,
}

struct SchedulerInner {
	name: &'static str,
	config: BackoffConfig,
	state: Mutex<BackoffState>,
	running: AtomicUsize,
	disposed: AtomicBool,
}

/// Debounced, single-timer task scheduler with a monotonically growing delay.
///
/// Each [`schedule`](Self::schedule) call replaces any pending timer, so a burst of calls
/// collapses into one execution after the current delay. A timer that already fired is
/// never cancelled: re-arming while a task runs only queues the next run.
///
/// The delay only grows (through [`increase_backoff`](Self::increase_backoff)); nothing
/// resets it.
#[derive(Clone)]
pub struct RetryScheduler {
	inner: Arc<SchedulerInner>,
}

impl fmt::Debug for RetryScheduler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RetryScheduler")
			.field("name", &self.inner.name)
			.field("current_delay", &self.current_delay())
			.field("running", &self.is_running())
			.field("disposed", &self.is_disposed())
			.finish()
	}
}

impl RetryScheduler {
	/// Creates an idle scheduler.
	pub fn new(name: &'static str, config: BackoffConfig) -> Self {
		Self {
			inner: Arc::new(SchedulerInner {
				name,
				config,
				state: Mutex::new(BackoffState {
					current_delay: config.initial_delay,
					generation: 0,
					timer: None,
				}),
				running: AtomicUsize::new(0),
				disposed: AtomicBool::new(false),
			}),
		}
	}

	/// Name used in log records.
	pub fn name(&self) -> &'static str {
		self.inner.name
	}

	/// Arms the timer for the current delay, replacing any pending one.
	///
	/// Ignored after [`dispose`](Self::dispose).
	pub fn schedule<F, Fut>(&self, task: F)
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		if self.is_disposed() {
			tracing::trace!(scheduler = self.inner.name, "schedule after dispose ignored");
			return;
		}

		let mut state = self.inner.state.lock();
		state.generation = state.generation.wrapping_add(1);
		let generation = state.generation;
		let delay = state.current_delay;
		if let Some(timer) = state.timer.take() {
			timer.abort();
		}

		let inner = Arc::clone(&self.inner);
		state.timer = Some(crate::spawn(TaskClass::Scheduling, async move {
			tokio::time::sleep(delay).await;
			{
				let mut state = inner.state.lock();
				if state.generation != generation || inner.disposed.load(Ordering::Acquire) {
					return;
				}
				state.timer = None;
			}

			inner.running.fetch_add(1, Ordering::AcqRel);
			let _running = RunningGuard(&inner.running);
			tracing::trace!(scheduler = inner.name, ?delay, "scheduler.fire");
			task().await;
		}));
		tracing::trace!(scheduler = self.inner.name, ?delay, "scheduler.arm");
	}

	/// Moves the delay one increment toward the maximum and returns the new delay.
	pub fn increase_backoff(&self) -> Duration {
		let mut state = self.inner.state.lock();
		state.current_delay = self.inner.config.next_delay(state.current_delay);
		state.current_delay
	}

	/// Delay the next [`schedule`](Self::schedule) call will use.
	pub fn current_delay(&self) -> Duration {
		self.inner.state.lock().current_delay
	}

	/// Returns true while a fired task is executing.
	pub fn is_running(&self) -> bool {
		self.inner.running.load(Ordering::Acquire) > 0
	}

	/// Returns true while a timer is armed and has not fired yet.
	pub fn is_pending(&self) -> bool {
		self.inner.state.lock().timer.is_some()
	}

	/// Cancels the pending timer and ignores later schedules. Idempotent.
	pub fn dispose(&self) {
		self.inner.disposed.store(true, Ordering::Release);
		if let Some(timer) = self.inner.state.lock().timer.take() {
			timer.abort();
			tracing::trace!(scheduler = self.inner.name, "pending timer cancelled");
		}
	}

	/// Returns true after [`dispose`](Self::dispose).
	pub fn is_disposed(&self) -> bool {
		self.inner.disposed.load(Ordering::Acquire)
	}
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::AcqRel);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tokio::sync::Notify;

	use super::*;

	fn config() -> BackoffConfig {
		BackoffConfig::new(Duration::from_millis(100), Duration::from_millis(350), Duration::from_millis(100))
	}

	#[tokio::test(start_paused = true)]
	async fn repeated_schedules_collapse_into_the_last_task() {
		let scheduler = RetryScheduler::new("test", config());
		let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));

		for id in 1..=3 {
			let fired = Arc::clone(&fired);
			scheduler.schedule(move || async move { fired.lock().push(id) });
			tokio::time::sleep(Duration::from_millis(30)).await;
		}
		assert!(scheduler.is_pending());

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(*fired.lock(), vec![3]);
		assert!(!scheduler.is_pending());
	}

	#[test]
	fn backoff_grows_by_increment_and_caps() {
		let scheduler = RetryScheduler::new("test", config());
		assert_eq!(scheduler.current_delay(), Duration::from_millis(100));
		assert_eq!(scheduler.increase_backoff(), Duration::from_millis(200));
		assert_eq!(scheduler.increase_backoff(), Duration::from_millis(300));
		assert_eq!(scheduler.increase_backoff(), Duration::from_millis(350));
		assert_eq!(scheduler.increase_backoff(), Duration::from_millis(350));
	}

	#[test]
	fn max_below_initial_is_raised() {
		let cfg = BackoffConfig::new(Duration::from_secs(2), Duration::from_secs(1), Duration::from_millis(10));
		assert_eq!(cfg.max_delay, Duration::from_secs(2));
		assert_eq!(cfg.next_delay(cfg.initial_delay), Duration::from_secs(2));
	}

	#[tokio::test(start_paused = true)]
	async fn reports_running_while_task_executes() {
		let scheduler = RetryScheduler::new("test", config());
		let started = Arc::new(Notify::new());
		let release = Arc::new(Notify::new());

		scheduler.schedule({
			let started = Arc::clone(&started);
			let release = Arc::clone(&release);
			move || async move {
				started.notify_one();
				release.notified().await;
			}
		});
		assert!(!scheduler.is_running());

		started.notified().await;
		assert!(scheduler.is_running());
		assert!(!scheduler.is_pending());

		release.notify_one();
		tokio::time::sleep(Duration::from_millis(1)).await;
		assert!(!scheduler.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn rescheduling_while_running_queues_another_run() {
		let scheduler = RetryScheduler::new("test", config());
		let runs = Arc::new(AtomicUsize::new(0));
		let started = Arc::new(Notify::new());
		let release = Arc::new(Notify::new());

		scheduler.schedule({
			let runs = Arc::clone(&runs);
			let started = Arc::clone(&started);
			let release = Arc::clone(&release);
			move || async move {
				started.notify_one();
				release.notified().await;
				runs.fetch_add(1, Ordering::SeqCst);
			}
		});
		started.notified().await;

		scheduler.schedule({
			let runs = Arc::clone(&runs);
			move || async move {
				runs.fetch_add(1, Ordering::SeqCst);
			}
		});
		release.notify_one();

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(runs.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn dispose_cancels_pending_and_future_runs() {
		let scheduler = RetryScheduler::new("test", config());
		let runs = Arc::new(AtomicUsize::new(0));

		let counted = |runs: &Arc<AtomicUsize>| {
			let runs = Arc::clone(runs);
			move || async move {
				runs.fetch_add(1, Ordering::SeqCst);
			}
		};

		scheduler.schedule(counted(&runs));
		scheduler.dispose();
		scheduler.dispose();
		scheduler.schedule(counted(&runs));

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(runs.load(Ordering::SeqCst), 0);
		assert!(scheduler.is_disposed());
	}
}
