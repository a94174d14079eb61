//! Non-blocking mutual exclusion between analysis runs and change flushes.
//!
//! Exactly one [`Intent`] may be held at a time. Holders get an [`IntentGuard`] that releases the
//! gate when dropped, so a panicking or cancelled holder cannot leave the gate stuck.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Work that needs exclusive use of the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
	/// A manual or full analysis run.
	Analysis,
	/// A coalesced partial analysis of recently changed paths.
	AnalyzeFlush,
	/// Forwarding queued file contents to the analyzer.
	NotifyFlush,
}

impl Intent {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Analysis => "analysis",
			Self::AnalyzeFlush => "analyze-flush",
			Self::NotifyFlush => "notify-flush",
		}
	}

	/// Returns true for intents that run the analyzer.
	pub const fn is_analysis(self) -> bool {
		matches!(self, Self::Analysis | Self::AnalyzeFlush)
	}
}

impl fmt::Display for Intent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Single-owner mediator handing out at most one [`IntentGuard`] at a time.
///
/// Cloning shares the same gate.
#[derive(Clone)]
pub struct ExclusionGate {
	holder: Arc<watch::Sender<Option<Intent>>>,
}

impl Default for ExclusionGate {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for ExclusionGate {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExclusionGate").field("holder", &self.holder()).finish()
	}
}

impl ExclusionGate {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(None);
		Self { holder: Arc::new(tx) }
	}

	/// Takes the gate for `intent` if nobody holds it.
	pub fn try_acquire(&self, intent: Intent) -> Option<IntentGuard> {
		let mut acquired = false;
		self.holder.send_if_modified(|holder| {
			if holder.is_some() {
				return false;
			}
			*holder = Some(intent);
			acquired = true;
			true
		});

		if !acquired {
			tracing::trace!(%intent, holder = ?self.holder(), "gate busy");
			return None;
		}
		tracing::trace!(%intent, "gate acquired");
		Some(IntentGuard {
			holder: Arc::clone(&self.holder),
			intent,
		})
	}

	/// Waits until the gate is free and takes it for `intent`.
	pub async fn acquire(&self, intent: Intent) -> IntentGuard {
		loop {
			if let Some(guard) = self.try_acquire(intent) {
				return guard;
			}
			self.wait_idle().await;
		}
	}

	/// Intent currently holding the gate.
	pub fn holder(&self) -> Option<Intent> {
		*self.holder.borrow()
	}

	/// Returns true while an analysis of any kind holds the gate.
	pub fn is_analyzing(&self) -> bool {
		self.holder().is_some_and(Intent::is_analysis)
	}

	/// Watches holder changes.
	pub fn subscribe(&self) -> watch::Receiver<Option<Intent>> {
		self.holder.subscribe()
	}

	/// Resolves once the gate is free. The gate may be taken again before the caller acts.
	pub async fn wait_idle(&self) {
		let mut rx = self.holder.subscribe();
		// The sender lives in `self`, so the channel cannot close while we wait.
		let _ = rx.wait_for(Option::is_none).await;
	}
}

/// Proof of holding an [`ExclusionGate`]. Releases the gate on drop.
#[must_use = "dropping the guard releases the gate immediately"]
pub struct IntentGuard {
	holder: Arc<watch::Sender<Option<Intent>>>,
	intent: Intent,
}

impl IntentGuard {
	pub fn intent(&self) -> Intent {
		self.intent
	}
}

impl fmt::Debug for IntentGuard {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("IntentGuard").field(&self.intent).finish()
	}
}

impl Drop for IntentGuard {
	fn drop(&mut self) {
		self.holder.send_replace(None);
		tracing::trace!(intent = %self.intent, "gate released");
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn only_one_intent_at_a_time() {
		let gate = ExclusionGate::new();
		let guard = gate.try_acquire(Intent::NotifyFlush).unwrap();
		assert_eq!(gate.holder(), Some(Intent::NotifyFlush));
		assert!(!gate.is_analyzing());

		assert!(gate.try_acquire(Intent::Analysis).is_none());
		assert!(gate.clone().try_acquire(Intent::NotifyFlush).is_none());

		drop(guard);
		assert_eq!(gate.holder(), None);

		let guard = gate.try_acquire(Intent::AnalyzeFlush).unwrap();
		assert_eq!(guard.intent(), Intent::AnalyzeFlush);
		assert!(gate.is_analyzing());
	}

	#[tokio::test]
	async fn wait_idle_resolves_after_release() {
		let gate = ExclusionGate::new();
		let guard = gate.try_acquire(Intent::Analysis).unwrap();

		let waiter = tokio::spawn({
			let gate = gate.clone();
			async move { gate.wait_idle().await }
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!waiter.is_finished());

		drop(guard);
		tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn acquire_waits_for_the_holder() {
		let gate = ExclusionGate::new();
		let flush = gate.try_acquire(Intent::NotifyFlush).unwrap();

		let analysis = tokio::spawn({
			let gate = gate.clone();
			async move { gate.acquire(Intent::Analysis).await.intent() }
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(gate.holder(), Some(Intent::NotifyFlush));

		drop(flush);
		let acquired = tokio::time::timeout(Duration::from_secs(1), analysis).await.unwrap().unwrap();
		assert_eq!(acquired, Intent::Analysis);
		// The spawned task dropped its guard on return.
		assert_eq!(gate.holder(), None);
	}

	#[tokio::test]
	async fn subscribers_see_holder_changes() {
		let gate = ExclusionGate::new();
		let mut rx = gate.subscribe();

		let guard = gate.try_acquire(Intent::Analysis).unwrap();
		rx.changed().await.unwrap();
		assert_eq!(*rx.borrow_and_update(), Some(Intent::Analysis));

		drop(guard);
		rx.changed().await.unwrap();
		assert_eq!(*rx.borrow_and_update(), None);
	}

	#[test]
	fn failed_acquire_does_not_notify() {
		let gate = ExclusionGate::new();
		let _guard = gate.try_acquire(Intent::Analysis).unwrap();
		let rx = gate.subscribe();
		assert!(gate.try_acquire(Intent::NotifyFlush).is_none());
		assert!(!rx.has_changed().unwrap());
	}
}
