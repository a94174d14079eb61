//! Content-addressed cache for language-model responses.
//!
//! Inputs are normalized to a list of [`ChatMessage`]s and hashed into a [`CacheKey`]; outputs are
//! stored under `<base>/<namespace>/<key>/`. Cache failures are logged and read as a miss, so a
//! broken cache directory slows callers down but never fails them.

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

mod config;
mod error;
mod input;
mod json;
mod trace;

pub use config::{CacheConfig, CacheSet};
pub use input::{CacheKey, ChatMessage, MessageLike, ModelInput, Role};
pub use json::JsonCache;
pub use trace::TraceCache;

/// Storage for model outputs keyed by their input.
#[async_trait]
pub trait ResponseCache: Send + Sync {
	/// Returns the stored output for `input`, or `None` on a miss or any storage failure.
	async fn lookup(&self, input: &ModelInput, namespace: &str) -> Option<JsonValue>;

	/// Stores `output` for `input` and returns the entry directory, or `None` if nothing was written.
	async fn update(&self, input: &ModelInput, namespace: &str, output: &JsonValue) -> Option<PathBuf>;
}

/// Cache that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl ResponseCache for NoopCache {
	async fn lookup(&self, _input: &ModelInput, _namespace: &str) -> Option<JsonValue> {
		None
	}

	async fn update(&self, _input: &ModelInput, _namespace: &str, _output: &JsonValue) -> Option<PathBuf> {
		None
	}
}

/// Looks up `input` and decodes the stored output as `T`.
///
/// An entry that no longer decodes as `T` counts as a miss.
pub async fn lookup_as<T>(cache: &dyn ResponseCache, input: &ModelInput, namespace: &str) -> Option<T>
where
	T: DeserializeOwned,
{
	let value = cache.lookup(input, namespace).await?;
	match serde_json::from_value(value) {
		Ok(decoded) => Some(decoded),
		Err(e) => {
			tracing::warn!(namespace, error = %e, "cached output has unexpected shape; ignoring");
			None
		}
	}
}

/// Returns the cached output for `input`, or runs `compute` and stores its result.
///
/// Errors from `compute` are returned unchanged and nothing is stored for them.
pub async fn get_or_compute<T, E, F, Fut>(cache: &dyn ResponseCache, input: &ModelInput, namespace: &str, compute: F) -> Result<T, E>
where
	T: Serialize + DeserializeOwned,
	F: FnOnce() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	if let Some(hit) = lookup_as(cache, input, namespace).await {
		tracing::debug!(namespace, "cache hit");
		return Ok(hit);
	}

	let output = compute().await?;
	match serde_json::to_value(&output) {
		Ok(value) => {
			cache.update(input, namespace, &value).await;
		}
		Err(e) => tracing::warn!(namespace, error = %e, "output not serializable; skipping cache update"),
	}
	Ok(output)
}

#[cfg(test)]
mod tests;
