// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background start: re-run the current executable detached, wait until it
//! reports ready, then record its pid in the lock marker.

use crate::error::{AgentError, SupervisorError};
use crate::lock::{request_shutdown, LockMarker};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Set in the child's environment so it runs the loop instead of spawning.
pub const SUPERVISED_ENV: &str = "LOOM_MESH_SUPERVISED";
/// Path the child creates once it is running.
pub const READY_FILE_ENV: &str = "LOOM_MESH_READY_FILE";

const LOG_FILE_NAME: &str = "loom-mesh.log";
const POLL_START: Duration = Duration::from_millis(25);
const POLL_MAX: Duration = Duration::from_millis(200);
/// How long a failed start gets to exit on SIGTERM before its group is killed.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub fn is_supervised() -> bool {
	std::env::var(SUPERVISED_ENV).is_ok_and(|v| v == "1")
}

pub fn ready_file_from_env() -> Option<PathBuf> {
	std::env::var_os(READY_FILE_ENV)
		.filter(|v| !v.is_empty())
		.map(PathBuf::from)
}

/// Create the ready file with this process's pid.
pub fn signal_ready(path: &Path) -> std::io::Result<()> {
	std::fs::write(path, format!("{}\n", std::process::id()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundAgent {
	pub pid: u32,
	pub log: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
	marker: LockMarker,
	args: Vec<OsString>,
	ready_timeout: Duration,
}

impl Supervisor {
	/// `args` are passed to the re-executed binary verbatim.
	pub fn new(marker: LockMarker, args: Vec<OsString>, ready_timeout: Duration) -> Self {
		Self {
			marker,
			args,
			ready_timeout,
		}
	}

	pub fn log_path(&self) -> PathBuf {
		match self.marker.path().parent() {
			Some(dir) => dir.join(LOG_FILE_NAME),
			None => PathBuf::from(LOG_FILE_NAME),
		}
	}

	pub fn ready_path(&self) -> PathBuf {
		self.marker.path().with_extension("ready")
	}

	/// Start the agent in the background.
	#[instrument(skip(self), fields(marker = %self.marker.path().display()))]
	pub async fn spawn(&self) -> Result<BackgroundAgent, AgentError> {
		let exe = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
		let mut command = Command::new(exe);
		command.args(&self.args);
		self.launch(command).await
	}

	async fn launch(&self, mut command: Command) -> Result<BackgroundAgent, AgentError> {
		self.marker.ensure_vacant()?;

		let ready = self.ready_path();
		let _ = std::fs::remove_file(&ready);

		let log = self.log_path();
		let stdout = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&log)
			.map_err(SupervisorError::Spawn)?;
		let stderr = stdout.try_clone().map_err(SupervisorError::Spawn)?;

		command
			.env(SUPERVISED_ENV, "1")
			.env(READY_FILE_ENV, &ready)
			.stdin(Stdio::null())
			.stdout(Stdio::from(stdout))
			.stderr(Stdio::from(stderr));
		#[cfg(unix)]
		command.process_group(0);

		let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
		let pid = child.id().ok_or_else(|| {
			SupervisorError::Spawn(std::io::Error::other("child exited before reporting a pid"))
		})?;
		debug!(pid, log = %log.display(), "spawned background agent");

		if let Err(e) = self.wait_ready(&mut child, &ready, &log).await {
			stop_agent(&mut child, pid).await;
			let _ = std::fs::remove_file(&ready);
			return Err(e.into());
		}
		let _ = std::fs::remove_file(&ready);

		if let Err(e) = self.marker.acquire(pid) {
			warn!(pid, error = %e, "could not record background agent, stopping it");
			stop_agent(&mut child, pid).await;
			return Err(e.into());
		}

		info!(pid, log = %log.display(), "background agent running");
		Ok(BackgroundAgent { pid, log })
	}

	async fn wait_ready(&self, child: &mut Child, ready: &Path, log: &Path) -> Result<(), SupervisorError> {
		let deadline = Instant::now() + self.ready_timeout;
		let mut delay = POLL_START;

		loop {
			if ready.exists() {
				return Ok(());
			}

			if let Some(status) = child.try_wait().map_err(SupervisorError::Spawn)? {
				return Err(SupervisorError::ChildExited {
					status: status.to_string(),
					log: log.to_path_buf(),
				});
			}

			let now = Instant::now();
			if now >= deadline {
				warn!(timeout = ?self.ready_timeout, "background agent not ready, stopping it");
				return Err(SupervisorError::ReadyTimeout {
					timeout: self.ready_timeout,
					log: log.to_path_buf(),
				});
			}

			tokio::time::sleep(delay.min(deadline - now)).await;
			delay = (delay * 2).min(POLL_MAX);
		}
	}
}

/// Stop an agent that failed to start. A running agent gets SIGTERM so it
/// can tear down its tunnel; whatever is left in its process group after
/// `STOP_GRACE` is killed, the agent included.
async fn stop_agent(child: &mut Child, pid: u32) {
	if matches!(child.try_wait(), Ok(None)) {
		if let Err(e) = request_shutdown(pid) {
			debug!(pid, error = %e, "SIGTERM to background agent failed");
		}
		match tokio::time::timeout(STOP_GRACE, child.wait()).await {
			Ok(Ok(status)) => debug!(pid, %status, "background agent exited"),
			Ok(Err(e)) => debug!(pid, error = %e, "waiting for background agent failed"),
			Err(_) => warn!(pid, grace = ?STOP_GRACE, "background agent ignored SIGTERM"),
		}
	}

	kill_group(pid);
	let _ = child.wait().await;
}

/// SIGKILL every process in the group led by `pgid`.
fn kill_group(pgid: u32) {
	let Ok(pgid) = libc::pid_t::try_from(pgid) else {
		return;
	};
	if pgid <= 0 {
		return;
	}
	// SAFETY: a negative pid addresses the process group the child created
	// with `process_group(0)`.
	if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
		let err = std::io::Error::last_os_error();
		if err.raw_os_error() != Some(libc::ESRCH) {
			warn!(pgid, error = %err, "failed to kill background agent process group");
		}
	}
}
