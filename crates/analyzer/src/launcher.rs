//! Spawning the analyzer process.
//!
//! The supervisor only sees [`AnalyzerLauncher`] and [`ProcessControl`], which lets tests install an
//! in-process analyzer instead of a real binary.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::endpoint::BoxReader;

/// Everything needed to start one analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
	pub program: PathBuf,
	pub args: Vec<String>,
	pub env: BTreeMap<String, String>,
	pub cwd: Option<PathBuf>,
	/// Address of the endpoint the analyzer must connect to. Also present in `args`.
	pub endpoint: String,
}

impl LaunchSpec {
	/// Program and arguments joined for log and error messages.
	pub fn command_line(&self) -> String {
		let mut line = self.program.display().to_string();
		for arg in &self.args {
			line.push(' ');
			line.push_str(arg);
		}
		line
	}
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
	/// Exit code, absent when the process was terminated by a signal.
	pub code: Option<i32>,
	/// True if the exit followed [`ProcessControl::start_kill`].
	pub killed: bool,
}

impl fmt::Display for ProcessExit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match (self.code, self.killed) {
			(_, true) => f.write_str("killed"),
			(Some(code), false) => write!(f, "exit code {code}"),
			(None, false) => f.write_str("terminated by signal"),
		}
	}
}

/// Handle to a running analyzer process.
#[async_trait]
pub trait ProcessControl: Send {
	/// Waits for the process to exit. Cancel safe.
	async fn wait(&mut self) -> io::Result<ProcessExit>;

	/// Requests termination without waiting for it.
	fn start_kill(&mut self) -> io::Result<()>;
}

/// A started analyzer.
pub struct LaunchedProcess {
	pub pid: Option<u32>,
	/// Diagnostic output; the ready marker appears here.
	pub stderr: BoxReader,
	pub control: Box<dyn ProcessControl>,
}

impl fmt::Debug for LaunchedProcess {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LaunchedProcess").field("pid", &self.pid).finish_non_exhaustive()
	}
}

#[async_trait]
pub trait AnalyzerLauncher: Send + Sync {
	async fn launch(&self, spec: LaunchSpec) -> io::Result<LaunchedProcess>;
}

/// Launches the analyzer as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl AnalyzerLauncher for ProcessLauncher {
	async fn launch(&self, spec: LaunchSpec) -> io::Result<LaunchedProcess> {
		let mut command = Command::new(&spec.program);
		command
			.args(&spec.args)
			.envs(&spec.env)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		if let Some(cwd) = &spec.cwd {
			command.current_dir(cwd);
		}

		let mut child = command.spawn()?;
		let stderr = child
			.stderr
			.take()
			.ok_or_else(|| io::Error::other("child stderr was not captured"))?;
		let pid = child.id();
		tracing::info!(?pid, command = %spec.command_line(), "analyzer.spawned");

		Ok(LaunchedProcess {
			pid,
			stderr: Box::new(stderr),
			control: Box::new(ChildControl { child, killed: false }),
		})
	}
}

struct ChildControl {
	child: Child,
	killed: bool,
}

#[async_trait]
impl ProcessControl for ChildControl {
	async fn wait(&mut self) -> io::Result<ProcessExit> {
		let status = self.child.wait().await?;
		Ok(ProcessExit {
			code: status.code(),
			killed: self.killed,
		})
	}

	fn start_kill(&mut self) -> io::Result<()> {
		self.killed = true;
		self.child.start_kill()
	}
}
