use std::io;

use crate::config::ConfigError;
use crate::launcher::ProcessExit;
use crate::state::ServerState;

/// A convenient type alias for `Result` with `E` = [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure classes, used to decide how an error is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
	/// Bad settings; nothing was spawned.
	Configuration,
	/// The analyzer process could not be started, became unreachable or exited.
	Process,
	/// A single request failed; the server stays usable.
	Request,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("cannot {operation} while the analyzer is {state}")]
	InvalidState { operation: &'static str, state: ServerState },
	#[error("analyzer is not running (state: {0})")]
	NotRunning(ServerState),
	#[error("failed to spawn `{command}`: {reason}")]
	Spawn { command: String, reason: String },
	#[error("analyzer did not report readiness within {0:?}")]
	ReadyTimeout(std::time::Duration),
	#[error("analyzer exited before becoming ready ({0})")]
	EarlyExit(ProcessExit),
	#[error("analyzer handshake failed: {0}")]
	Handshake(String),
	#[error("analyzer process exited")]
	ProcessExited,
	#[error("analyzer start cancelled")]
	StartCancelled,
	#[error("rpc: {0}")]
	Rpc(#[from] vigil_rpc::Error),
	#[error("json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("malformed analyzer response: {0}")]
	MalformedResponse(String),
	#[error("io: {0}")]
	Io(#[from] io::Error),
}

impl Error {
	pub fn category(&self) -> ErrorCategory {
		match self {
			Self::Config(_) => ErrorCategory::Configuration,
			Self::Spawn { .. } | Self::ReadyTimeout(_) | Self::EarlyExit(_) | Self::Handshake(_) | Self::ProcessExited | Self::StartCancelled | Self::Io(_) => {
				ErrorCategory::Process
			}
			Self::Rpc(vigil_rpc::Error::ServiceStopped) => ErrorCategory::Process,
			Self::InvalidState { .. } | Self::NotRunning(_) | Self::Rpc(_) | Self::Json(_) | Self::MalformedResponse(_) => {
				ErrorCategory::Request
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn categories() {
		let config = Error::Config(ConfigError::MissingField("analyzer_path"));
		assert_eq!(config.category(), ErrorCategory::Configuration);
		assert_eq!(Error::ReadyTimeout(std::time::Duration::from_secs(1)).category(), ErrorCategory::Process);
		assert_eq!(Error::Rpc(vigil_rpc::Error::ServiceStopped).category(), ErrorCategory::Process);
		assert_eq!(Error::Rpc(vigil_rpc::Error::RequestTimeout("x".into())).category(), ErrorCategory::Request);
		assert_eq!(Error::MalformedResponse("no Rulesets".into()).category(), ErrorCategory::Request);
		assert_eq!(Error::NotRunning(ServerState::Stopped).category(), ErrorCategory::Request);
	}
}
