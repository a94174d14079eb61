/// Execution classes used to tag spawned tasks in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Child process supervision: exit watchers, stderr readers.
	Supervision,
	/// RPC pumps and stream readers.
	Transport,
	/// Debounce timers and the flushes they trigger.
	Scheduling,
	/// Everything else that may be delayed without user-visible effect.
	Background,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Supervision => "supervision",
			Self::Transport => "transport",
			Self::Scheduling => "scheduling",
			Self::Background => "background",
		}
	}
}
