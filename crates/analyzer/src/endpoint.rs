//! Private local transport the analyzer connects back to.
//!
//! Unix uses a domain socket in the temp dir, Windows a named pipe. Names carry a random UUID so
//! concurrent supervisors never collide.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed read half of a transport.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
/// Boxed write half of a transport.
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

pub use imp::LocalEndpoint;

fn unique_name() -> String {
	format!("vigil-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(unix)]
mod imp {
	use std::io;
	use std::path::{Path, PathBuf};

	use tokio::net::UnixListener;

	use super::{BoxReader, BoxWriter};

	/// Listening end of a freshly created domain socket. The socket file is removed on drop.
	#[derive(Debug)]
	pub struct LocalEndpoint {
		path: PathBuf,
		listener: UnixListener,
	}

	impl LocalEndpoint {
		pub fn bind() -> io::Result<Self> {
			Self::bind_in(&std::env::temp_dir())
		}

		pub fn bind_in(dir: &Path) -> io::Result<Self> {
			let path = dir.join(format!("{}.sock", super::unique_name()));
			let listener = UnixListener::bind(&path)?;
			tracing::debug!(path = %path.display(), "endpoint.bind");
			Ok(Self { path, listener })
		}

		/// Address handed to the analyzer on its command line.
		pub fn address(&self) -> String {
			self.path.display().to_string()
		}

		/// Waits for the analyzer to connect.
		pub async fn accept(&mut self) -> io::Result<(BoxReader, BoxWriter)> {
			let (stream, _) = self.listener.accept().await?;
			let (read, write) = stream.into_split();
			Ok((Box::new(read), Box::new(write)))
		}
	}

	impl Drop for LocalEndpoint {
		fn drop(&mut self) {
			if let Err(e) = std::fs::remove_file(&self.path)
				&& e.kind() != io::ErrorKind::NotFound
			{
				tracing::warn!(path = %self.path.display(), error = %e, "failed to remove socket file");
			}
		}
	}
}

#[cfg(windows)]
mod imp {
	use std::io;

	use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

	use super::{BoxReader, BoxWriter};

	/// First instance of a freshly created named pipe.
	#[derive(Debug)]
	pub struct LocalEndpoint {
		name: String,
		server: Option<NamedPipeServer>,
	}

	impl LocalEndpoint {
		pub fn bind() -> io::Result<Self> {
			let name = format!(r"\\.\pipe\{}", super::unique_name());
			let server = ServerOptions::new().first_pipe_instance(true).create(&name)?;
			tracing::debug!(%name, "endpoint.bind");
			Ok(Self { name, server: Some(server) })
		}

		/// Address handed to the analyzer on its command line.
		pub fn address(&self) -> String {
			self.name.clone()
		}

		/// Waits for the analyzer to connect. A pipe instance accepts one client.
		pub async fn accept(&mut self) -> io::Result<(BoxReader, BoxWriter)> {
			let server = self
				.server
				.take()
				.ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "pipe already accepted a client"))?;
			server.connect().await?;
			let (read, write) = tokio::io::split(server);
			Ok((Box::new(read), Box::new(write)))
		}
	}
}

/// Connects to an endpoint address, as the analyzer does.
#[cfg(unix)]
pub async fn connect(address: &str) -> io::Result<(BoxReader, BoxWriter)> {
	let stream = tokio::net::UnixStream::connect(address).await?;
	let (read, write) = stream.into_split();
	Ok((Box::new(read), Box::new(write)))
}

/// Connects to an endpoint address, as the analyzer does.
#[cfg(windows)]
pub async fn connect(address: &str) -> io::Result<(BoxReader, BoxWriter)> {
	let client = tokio::net::windows::named_pipe::ClientOptions::new().open(address)?;
	let (read, write) = tokio::io::split(client);
	Ok((Box::new(read), Box::new(write)))
}

#[cfg(all(test, unix))]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn accepts_a_client_and_cleans_up() {
		let dir = tempfile::tempdir().unwrap();
		let mut endpoint = LocalEndpoint::bind_in(dir.path()).unwrap();
		let address = endpoint.address();
		assert!(address.ends_with(".sock"));

		let client = tokio::spawn({
			let address = address.clone();
			async move {
				let (_, mut write) = connect(&address).await.unwrap();
				write.write_all(b"ping").await.unwrap();
			}
		});

		let (mut read, _write) = endpoint.accept().await.unwrap();
		let mut buf = [0u8; 4];
		read.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");
		client.await.unwrap();

		drop(endpoint);
		assert!(!std::path::Path::new(&address).exists());
	}

	#[tokio::test]
	async fn names_are_unique() {
		let dir = tempfile::tempdir().unwrap();
		let a = LocalEndpoint::bind_in(dir.path()).unwrap();
		let b = LocalEndpoint::bind_in(dir.path()).unwrap();
		assert_ne!(a.address(), b.address());
	}
}
