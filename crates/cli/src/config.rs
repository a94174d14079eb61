//! `vigil.toml` loading.
//!
//! Relative paths in the file are resolved against the directory holding it, except a bare
//! `analyzer_path`, which is looked up on `PATH` at spawn time.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use vigil_analyzer::AnalyzerConfig;
use vigil_cache::CacheConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VigilConfig {
	pub analyzer: AnalyzerConfig,
	pub cache: CacheConfig,
}

impl VigilConfig {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
		let base = path.parent().unwrap_or(Path::new("."));
		Self::parse(&text, base).with_context(|| format!("invalid config {}", path.display()))
	}

	pub fn parse(text: &str, base: &Path) -> anyhow::Result<Self> {
		let mut config: Self = toml::from_str(text)?;
		config.resolve_paths(base);
		Ok(config)
	}

	fn resolve_paths(&mut self, base: &Path) {
		let analyzer = &mut self.analyzer;
		if analyzer.analyzer_path.components().count() > 1 {
			resolve(base, &mut analyzer.analyzer_path);
		}
		if !analyzer.workspace_root.as_os_str().is_empty() {
			resolve(base, &mut analyzer.workspace_root);
		}
		for rule in &mut analyzer.rules {
			resolve(base, rule);
		}
		if let Some(log_file) = &mut analyzer.log_file {
			resolve(base, log_file);
		}
		resolve(base, &mut self.cache.dir);
		resolve(base, &mut self.cache.trace_dir);
	}
}

fn resolve(base: &Path, path: &mut PathBuf) {
	if path.is_relative() {
		*path = base.join(&*path);
	}
}
