use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CacheError, check_namespace, write_atomic};
use crate::{CacheKey, ModelInput, ResponseCache};

const INPUT_FILE: &str = "input.json";
const OUTPUT_FILE: &str = "output.json";

#[derive(Debug, Serialize, Deserialize)]
struct CachedOutput {
	cached_at: DateTime<Utc>,
	output: JsonValue,
}

/// Durable cache storing `input.json` and `output.json` per entry.
///
/// Entries are never evicted.
#[derive(Debug, Clone)]
pub struct JsonCache {
	base_dir: PathBuf,
}

impl JsonCache {
	pub fn new(base_dir: impl Into<PathBuf>) -> Self {
		Self { base_dir: base_dir.into() }
	}

	pub fn base_dir(&self) -> &Path {
		&self.base_dir
	}

	/// Directory holding the entry for `input` in `namespace`.
	pub fn entry_dir(&self, input: &ModelInput, namespace: &str) -> PathBuf {
		self.base_dir.join(namespace).join(CacheKey::for_input(input).as_str())
	}

	async fn read(&self, input: &ModelInput, namespace: &str) -> Result<JsonValue, CacheError> {
		check_namespace(namespace)?;
		let path = self.entry_dir(input, namespace).join(OUTPUT_FILE);
		let bytes = tokio::fs::read(&path).await.map_err(|e| CacheError::io(&path, e))?;
		let cached: CachedOutput = serde_json::from_slice(&bytes).map_err(|e| CacheError::json(&path, e))?;
		Ok(cached.output)
	}

	async fn write(&self, input: &ModelInput, namespace: &str, output: &JsonValue) -> Result<PathBuf, CacheError> {
		check_namespace(namespace)?;
		let dir = self.entry_dir(input, namespace);
		tokio::fs::create_dir_all(&dir).await.map_err(|e| CacheError::io(&dir, e))?;

		let input_path = dir.join(INPUT_FILE);
		let messages = serde_json::to_vec_pretty(&input.normalize()).map_err(|e| CacheError::json(&input_path, e))?;
		write_atomic(&input_path, &messages).await?;

		let output_path = dir.join(OUTPUT_FILE);
		let envelope = CachedOutput {
			cached_at: Utc::now(),
			output: output.clone(),
		};
		let bytes = serde_json::to_vec_pretty(&envelope).map_err(|e| CacheError::json(&output_path, e))?;
		write_atomic(&output_path, &bytes).await?;
		Ok(dir)
	}
}

#[async_trait]
impl ResponseCache for JsonCache {
	async fn lookup(&self, input: &ModelInput, namespace: &str) -> Option<JsonValue> {
		match self.read(input, namespace).await {
			Ok(output) => Some(output),
			Err(e) if e.is_not_found() => {
				tracing::trace!(namespace, "cache miss");
				None
			}
			Err(e) => {
				tracing::warn!(namespace, error = %e, "cache read failed; treating as miss");
				None
			}
		}
	}

	async fn update(&self, input: &ModelInput, namespace: &str, output: &JsonValue) -> Option<PathBuf> {
		match self.write(input, namespace, output).await {
			Ok(dir) => {
				tracing::debug!(namespace, dir = %dir.display(), "cache entry written");
				Some(dir)
			}
			Err(e) => {
				tracing::warn!(namespace, error = %e, "cache write failed");
				None
			}
		}
	}
}
