use std::fmt;

use serde::Serialize;

/// Lifecycle of the supervised analyzer.
///
/// ```text
/// Initial ─configure─▶ ConfigurationReady ─start─▶ Starting ─▶ EstablishingConnection
///    │                       ▲                        │                 │
///    ▼                       │                        ▼                 ▼
/// ConfigurationNeeded ───────┘                   StartFailed    ConnectionEstablished ─▶ Running
///                                                                                         │
///                           Stopped ◀──── Stopping ◀─────────── stop / process exit ─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerState {
	Initial,
	ConfigurationNeeded,
	ConfigurationReady,
	Starting,
	EstablishingConnection,
	ConnectionEstablished,
	Running,
	Stopping,
	Stopped,
	StartFailed,
}

impl ServerState {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Initial => "initial",
			Self::ConfigurationNeeded => "configurationNeeded",
			Self::ConfigurationReady => "configurationReady",
			Self::Starting => "starting",
			Self::EstablishingConnection => "establishingConnection",
			Self::ConnectionEstablished => "connectionEstablished",
			Self::Running => "running",
			Self::Stopping => "stopping",
			Self::Stopped => "stopped",
			Self::StartFailed => "startFailed",
		}
	}

	/// States from which `start` may be called.
	pub const fn can_start(self) -> bool {
		matches!(self, Self::ConfigurationReady | Self::Stopped | Self::StartFailed)
	}

	/// Resting states a server stays in until restarted.
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Stopped | Self::StartFailed)
	}

	/// States in which a live process may exist.
	pub const fn has_process(self) -> bool {
		matches!(
			self,
			Self::Starting | Self::EstablishingConnection | Self::ConnectionEstablished | Self::Running | Self::Stopping
		)
	}
}

impl fmt::Display for ServerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
