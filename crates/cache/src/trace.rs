use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{CacheError, check_namespace, write_atomic};
use crate::{CacheKey, ChatMessage, ModelInput, ResponseCache};

/// Write-only human-readable record of model calls.
///
/// Every update writes `input.txt` and `output.txt` under `<base>/<namespace>/<key>/`.
/// Lookups always miss.
#[derive(Debug, Clone)]
pub struct TraceCache {
	base_dir: PathBuf,
}

impl TraceCache {
	pub fn new(base_dir: impl Into<PathBuf>) -> Self {
		Self { base_dir: base_dir.into() }
	}

	pub fn base_dir(&self) -> &Path {
		&self.base_dir
	}

	async fn write(&self, input: &ModelInput, namespace: &str, output: &JsonValue) -> Result<PathBuf, CacheError> {
		check_namespace(namespace)?;
		let messages = input.normalize();
		let dir = self.base_dir.join(namespace).join(CacheKey::for_messages(&messages).as_str());
		tokio::fs::create_dir_all(&dir).await.map_err(|e| CacheError::io(&dir, e))?;

		write_atomic(&dir.join("input.txt"), render_messages(&messages).as_bytes()).await?;

		let output_path = dir.join("output.txt");
		let rendered = match output {
			JsonValue::String(text) => text.clone(),
			other => serde_json::to_string_pretty(other).map_err(|e| CacheError::json(&output_path, e))?,
		};
		write_atomic(&output_path, rendered.as_bytes()).await?;
		Ok(dir)
	}
}

fn render_messages(messages: &[ChatMessage]) -> String {
	let mut out = String::new();
	for msg in messages {
		let _ = writeln!(out, "[{}]", msg.role);
		out.push_str(&msg.content);
		out.push_str("\n\n");
	}
	out
}

#[async_trait]
impl ResponseCache for TraceCache {
	async fn lookup(&self, _input: &ModelInput, _namespace: &str) -> Option<JsonValue> {
		None
	}

	async fn update(&self, input: &ModelInput, namespace: &str, output: &JsonValue) -> Option<PathBuf> {
		match self.write(input, namespace, output).await {
			Ok(dir) => Some(dir),
			Err(e) => {
				tracing::warn!(namespace, error = %e, "trace write failed");
				None
			}
		}
	}
}
