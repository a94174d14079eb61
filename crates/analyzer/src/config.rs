//! `[analyzer]` settings and the command line derived from them.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use vigil_worker::BackoffConfig;

pub const DEFAULT_READY_MARKER: &str = "analyzer rpc server ready";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("invalid analyzer config: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("`{0}` must be set")]
	MissingField(&'static str),
	#[error("analyzer binary not found at {}", .0.display())]
	AnalyzerNotFound(PathBuf),
	#[error("workspace root {} is not a directory", .0.display())]
	WorkspaceNotFound(PathBuf),
	#[error("`{0}` must be greater than zero")]
	InvalidDuration(&'static str),
	#[error("`{field}`: initial delay {initial_ms}ms exceeds max delay {max_ms}ms")]
	InvalidBackoff { field: &'static str, initial_ms: u64, max_ms: u64 },
	#[error("invalid exclude pattern {pattern:?}: {source}")]
	InvalidGlob {
		pattern: String,
		#[source]
		source: globset::Error,
	},
}

/// Backoff bounds in milliseconds, as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSettings {
	pub initial_ms: u64,
	pub max_ms: u64,
	pub increment_ms: u64,
}

impl BackoffSettings {
	pub const fn new(initial_ms: u64, max_ms: u64, increment_ms: u64) -> Self {
		Self {
			initial_ms,
			max_ms,
			increment_ms,
		}
	}

	pub fn to_config(self) -> BackoffConfig {
		BackoffConfig::new(
			Duration::from_millis(self.initial_ms),
			Duration::from_millis(self.max_ms),
			Duration::from_millis(self.increment_ms),
		)
	}

	fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
		if self.initial_ms == 0 {
			return Err(ConfigError::InvalidDuration(field));
		}
		if self.initial_ms > self.max_ms {
			return Err(ConfigError::InvalidBackoff {
				field,
				initial_ms: self.initial_ms,
				max_ms: self.max_ms,
			});
		}
		Ok(())
	}
}

/// Settings for one analyzer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
	/// Analyzer executable; bare names are looked up on `PATH`.
	pub analyzer_path: PathBuf,
	pub rules: Vec<PathBuf>,
	pub workspace_root: PathBuf,
	pub label_selector: String,
	pub log_file: Option<PathBuf>,
	pub log_verbosity: u8,
	/// Substring of a stderr line that signals the analyzer accepts connections.
	pub ready_marker: String,
	pub ready_timeout_ms: u64,
	pub stop_grace_ms: u64,
	pub extra_args: Vec<String>,
	pub env: BTreeMap<String, String>,
	/// Re-analyze on every edit instead of only on save.
	pub hot_rerun: bool,
	pub exclude: Vec<String>,
	pub notify_backoff: BackoffSettings,
	pub analyze_backoff: BackoffSettings,
}

impl Default for AnalyzerConfig {
	fn default() -> Self {
		Self {
			analyzer_path: PathBuf::new(),
			rules: Vec::new(),
			workspace_root: PathBuf::new(),
			label_selector: String::new(),
			log_file: None,
			log_verbosity: 1,
			ready_marker: DEFAULT_READY_MARKER.to_owned(),
			ready_timeout_ms: 30_000,
			stop_grace_ms: 5_000,
			extra_args: Vec::new(),
			env: BTreeMap::new(),
			hot_rerun: false,
			exclude: Vec::new(),
			notify_backoff: BackoffSettings::new(300, 3_000, 300),
			analyze_backoff: BackoffSettings::new(1_000, 10_000, 1_000),
		}
	}
}

impl AnalyzerConfig {
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(text)?)
	}

	pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml_str(&text)
	}

	/// Static checks run before anything is spawned.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.analyzer_path.as_os_str().is_empty() {
			return Err(ConfigError::MissingField("analyzer_path"));
		}
		// Bare command names resolve through PATH at spawn time.
		if self.analyzer_path.components().count() > 1 && !self.analyzer_path.is_file() {
			return Err(ConfigError::AnalyzerNotFound(self.analyzer_path.clone()));
		}
		if self.workspace_root.as_os_str().is_empty() {
			return Err(ConfigError::MissingField("workspace_root"));
		}
		if !self.workspace_root.is_dir() {
			return Err(ConfigError::WorkspaceNotFound(self.workspace_root.clone()));
		}
		if self.label_selector.trim().is_empty() {
			return Err(ConfigError::MissingField("label_selector"));
		}
		if self.ready_marker.is_empty() {
			return Err(ConfigError::MissingField("ready_marker"));
		}
		if self.ready_timeout_ms == 0 {
			return Err(ConfigError::InvalidDuration("ready_timeout_ms"));
		}
		if self.stop_grace_ms == 0 {
			return Err(ConfigError::InvalidDuration("stop_grace_ms"));
		}
		self.notify_backoff.validate("notify_backoff")?;
		self.analyze_backoff.validate("analyze_backoff")?;
		self.exclude_set()?;
		Ok(())
	}

	pub fn ready_timeout(&self) -> Duration {
		Duration::from_millis(self.ready_timeout_ms)
	}

	pub fn stop_grace(&self) -> Duration {
		Duration::from_millis(self.stop_grace_ms)
	}

	/// Compiles the `exclude` globs.
	pub fn exclude_set(&self) -> Result<GlobSet, ConfigError> {
		build_globset(&self.exclude)
	}

	/// Command line for an analyzer listening on `endpoint`.
	pub fn derive_args(&self, endpoint: &str) -> Vec<String> {
		let mut args = vec![
			"--pipe".to_owned(),
			endpoint.to_owned(),
			"--source-directory".to_owned(),
			self.workspace_root.display().to_string(),
		];
		for rule in &self.rules {
			args.push("--rules".to_owned());
			args.push(rule.display().to_string());
		}
		args.push("--log-verbosity".to_owned());
		args.push(self.log_verbosity.to_string());
		if let Some(log_file) = &self.log_file {
			args.push("--log-file".to_owned());
			args.push(log_file.display().to_string());
		}
		args.extend(self.extra_args.iter().cloned());
		args
	}
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet, ConfigError> {
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = Glob::new(pattern).map_err(|source| ConfigError::InvalidGlob {
			pattern: pattern.clone(),
			source,
		})?;
		builder.add(glob);
	}
	builder.build().map_err(|source| ConfigError::InvalidGlob {
		pattern: patterns.join(", "),
		source,
	})
}
