use std::io;
use std::path::{Path, PathBuf};

/// Internal cache failure. Logged at the call site and reported to callers as a miss.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CacheError {
	#[error("{path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("{path}: invalid cache entry: {source}")]
	Json {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
	#[error("invalid cache namespace {0:?}")]
	InvalidNamespace(String),
}

impl CacheError {
	pub(crate) fn io(path: &Path, source: io::Error) -> Self {
		Self::Io {
			path: path.to_path_buf(),
			source,
		}
	}

	pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
		Self::Json {
			path: path.to_path_buf(),
			source,
		}
	}

	pub(crate) fn is_not_found(&self) -> bool {
		matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
	}
}

/// Rejects namespaces that are not a single plain path component.
pub(crate) fn check_namespace(namespace: &str) -> Result<(), CacheError> {
	let valid = !namespace.is_empty()
		&& namespace != "."
		&& namespace != ".."
		&& !namespace.contains(['/', '\\'])
		&& !namespace.contains(':');
	if valid {
		Ok(())
	} else {
		Err(CacheError::InvalidNamespace(namespace.to_owned()))
	}
}

/// Writes `contents` next to `path` and renames it into place.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
	use std::sync::atomic::{AtomicU64, Ordering};

	static SEQ: AtomicU64 = AtomicU64::new(0);
	let seq = SEQ.fetch_add(1, Ordering::Relaxed);
	let mut tmp = path.as_os_str().to_owned();
	tmp.push(format!(".{}.{seq}.tmp", std::process::id()));
	let tmp = PathBuf::from(tmp);

	tokio::fs::write(&tmp, contents).await.map_err(|e| CacheError::io(&tmp, e))?;
	if let Err(e) = tokio::fs::rename(&tmp, path).await {
		let _ = tokio::fs::remove_file(&tmp).await;
		return Err(CacheError::io(path, e));
	}
	Ok(())
}
