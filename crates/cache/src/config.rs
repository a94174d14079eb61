use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{JsonCache, NoopCache, ResponseCache, TraceCache};

/// `[cache]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
	pub enabled: bool,
	pub dir: PathBuf,
	pub trace_enabled: bool,
	pub trace_dir: PathBuf,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			dir: PathBuf::from(".vigil/cache"),
			trace_enabled: false,
			trace_dir: PathBuf::from(".vigil/trace"),
		}
	}
}

/// Response cache and call tracer selected by a [`CacheConfig`].
#[derive(Clone)]
pub struct CacheSet {
	pub cache: Arc<dyn ResponseCache>,
	pub tracer: Arc<dyn ResponseCache>,
}

impl std::fmt::Debug for CacheSet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheSet").finish_non_exhaustive()
	}
}

impl CacheSet {
	pub fn from_config(config: &CacheConfig) -> Self {
		let cache: Arc<dyn ResponseCache> = if config.enabled {
			Arc::new(JsonCache::new(&config.dir))
		} else {
			Arc::new(NoopCache)
		};
		let tracer: Arc<dyn ResponseCache> = if config.trace_enabled {
			Arc::new(TraceCache::new(&config.trace_dir))
		} else {
			Arc::new(NoopCache)
		};
		tracing::debug!(
			cache = ?config.enabled.then(|| config.dir.display().to_string()),
			trace = ?config.trace_enabled.then(|| config.trace_dir.display().to_string()),
			"response cache configured"
		);
		Self { cache, tracer }
	}

	/// Set where both caches discard everything.
	pub fn disabled() -> Self {
		Self::from_config(&CacheConfig::default())
	}
}
