// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Single-instance lock marker: a file holding the running agent's pid.

use crate::error::LockError;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PID_FILE_ENV: &str = "LOOM_MESH_PID_FILE";

const MARKER_NAME: &str = "loom-mesh.pid";

/// Where the marker lives for this user, unless `LOOM_MESH_PID_FILE` is set.
pub fn default_marker_path() -> PathBuf {
	if let Some(path) = std::env::var_os(PID_FILE_ENV).filter(|v| !v.is_empty()) {
		return PathBuf::from(path);
	}
	if is_root() {
		return PathBuf::from("/var/run").join(MARKER_NAME);
	}
	match dirs::home_dir() {
		Some(home) => home.join(format!(".{MARKER_NAME}")),
		None => std::env::temp_dir().join(MARKER_NAME),
	}
}

fn is_root() -> bool {
	// SAFETY: geteuid has no preconditions and cannot fail.
	unsafe { libc::geteuid() == 0 }
}

/// Whether a process with `pid` exists. A process owned by another user
/// counts as alive.
pub fn process_alive(pid: u32) -> bool {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return false;
	};
	if pid <= 0 {
		return false;
	}
	// SAFETY: signal 0 performs only the existence and permission check.
	if unsafe { libc::kill(pid, 0) } == 0 {
		return true;
	}
	std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Ask the agent with `pid` to shut down.
pub fn request_shutdown(pid: u32) -> std::io::Result<()> {
	let pid = libc::pid_t::try_from(pid)
		.ok()
		.filter(|p| *p > 0)
		.ok_or_else(|| std::io::Error::from(ErrorKind::InvalidInput))?;
	// SAFETY: plain signal delivery to a positive pid.
	if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
		Ok(())
	} else {
		Err(std::io::Error::last_os_error())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
	Absent,
	Live(u32),
	/// Unparsable content or a pid with no process behind it.
	Stale,
}

#[derive(Debug, Clone)]
pub struct LockMarker {
	path: PathBuf,
}

impl LockMarker {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn at_default_path() -> Self {
		Self::new(default_marker_path())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn io_error(&self, source: std::io::Error) -> LockError {
		LockError::Io {
			path: self.path.clone(),
			source,
		}
	}

	/// The pid recorded in the marker. `None` when the file is missing or
	/// does not hold a positive decimal pid.
	pub fn read_pid(&self) -> Result<Option<u32>, LockError> {
		match std::fs::read_to_string(&self.path) {
			Ok(contents) => Ok(contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(self.io_error(e)),
		}
	}

	pub fn inspect(&self) -> Result<MarkerStatus, LockError> {
		if !self.path.exists() {
			return Ok(MarkerStatus::Absent);
		}
		match self.read_pid()? {
			Some(pid) if process_alive(pid) => Ok(MarkerStatus::Live(pid)),
			_ => Ok(MarkerStatus::Stale),
		}
	}

	/// Remove a stale marker and report a live one as `AlreadyRunning`.
	pub fn ensure_vacant(&self) -> Result<(), LockError> {
		match self.inspect()? {
			MarkerStatus::Absent => Ok(()),
			MarkerStatus::Live(pid) => Err(LockError::AlreadyRunning { pid }),
			MarkerStatus::Stale => {
				info!(path = %self.path.display(), "removing stale lock marker");
				self.remove()
			}
		}
	}

	/// Record `pid` as the running instance.
	pub fn acquire(&self, pid: u32) -> Result<(), LockError> {
		self.ensure_vacant()?;

		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
		}

		let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
			Ok(file) => file,
			Err(e) if e.kind() == ErrorKind::AlreadyExists => {
				// Lost a race with another starter.
				return match self.inspect()? {
					MarkerStatus::Live(pid) => Err(LockError::AlreadyRunning { pid }),
					_ => Err(self.io_error(e)),
				};
			}
			Err(e) => return Err(self.io_error(e)),
		};
		writeln!(file, "{pid}").map_err(|e| self.io_error(e))?;

		debug!(path = %self.path.display(), pid, "lock marker written");
		Ok(())
	}

	fn remove(&self) -> Result<(), LockError> {
		match std::fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
			Err(e) => Err(self.io_error(e)),
		}
	}

	/// Best-effort removal. Failures are logged.
	pub fn release(&self) {
		match self.remove() {
			Ok(()) => debug!(path = %self.path.display(), "lock marker removed"),
			Err(e) => warn!(error = %e, "failed to remove lock marker"),
		}
	}

	/// Remove the marker only if it still names `pid`.
	pub fn release_if_owned(&self, pid: u32) {
		match self.read_pid() {
			Ok(Some(recorded)) if recorded == pid => self.release(),
			Ok(_) => debug!(path = %self.path.display(), "lock marker not owned, leaving it"),
			Err(e) => warn!(error = %e, "failed to read lock marker"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	const DEAD_PID: u32 = 0x7fff_fff0;

	fn marker(dir: &TempDir) -> LockMarker {
		LockMarker::new(dir.path().join("agent.pid"))
	}

	#[test]
	fn own_process_is_alive() {
		assert!(process_alive(std::process::id()));
	}

	#[test]
	fn nonexistent_and_invalid_pids_are_dead() {
		assert!(!process_alive(DEAD_PID));
		assert!(!process_alive(0));
		assert!(!process_alive(u32::MAX));
	}

	#[test]
	fn shutdown_request_to_missing_process_fails() {
		assert!(request_shutdown(DEAD_PID).is_err());
		assert!(request_shutdown(0).is_err());
	}

	#[test]
	fn absent_marker() {
		let dir = TempDir::new().unwrap();
		let marker = marker(&dir);
		assert_eq!(marker.inspect().unwrap(), MarkerStatus::Absent);
		assert_eq!(marker.read_pid().unwrap(), None);
	}

	#[test]
	fn acquire_writes_decimal_pid() {
		let dir = TempDir::new().unwrap();
		let marker = marker(&dir);
		marker.acquire(4242).unwrap();
		let contents = std::fs::read_to_string(marker.path()).unwrap();
		assert_eq!(contents.trim(), "4242");
	}

	#[test]
	fn live_marker_refuses_start() {
		let dir = TempDir::new().unwrap();
		let marker = marker(&dir);
		std::fs::write(marker.path(), std::process::id().to_string()).unwrap();

		let err = marker.acquire(1).unwrap_err();
		assert!(matches!(err, LockError::AlreadyRunning { pid } if pid == std::process::id()));
		assert!(marker.path().exists());
	}

	#[test]
	fn dead_pid_marker_is_replaced() {
		let dir = TempDir::new().unwrap();
		let marker = marker(&dir);
		std::fs::write(marker.path(), DEAD_PID.to_string()).unwrap();
		assert_eq!(marker.inspect().unwrap(), MarkerStatus::Stale);

		marker.acquire(std::process::id()).unwrap();
		assert_eq!(marker.read_pid().unwrap(), Some(std::process::id()));
	}

	#[test]
	fn garbage_marker_is_stale() {
		let dir = TempDir::new().unwrap();
		let marker = marker(&dir);
		std::fs::write(marker.path(), "not-a-pid\n").unwrap();
		assert_eq!(marker.inspect().unwrap(), MarkerStatus::Stale);
		marker.ensure_vacant().unwrap();
		assert!(!marker.path().exists());
	}

	#[test]
	fn release_if_owned_leaves_foreign_marker() {
		let dir = TempDir::new().unwrap();
		let marker = marker(&dir);
		marker.acquire(4242).unwrap();

		marker.release_if_owned(1);
		assert!(marker.path().exists());
		marker.release_if_owned(4242);
		assert!(!marker.path().exists());
	}

	#[test]
	fn release_of_missing_marker_is_quiet() {
		let dir = TempDir::new().unwrap();
		marker(&dir).release();
	}

	#[test]
	fn acquire_creates_parent_directories() {
		let dir = TempDir::new().unwrap();
		let marker = LockMarker::new(dir.path().join("run/nested/agent.pid"));
		marker.acquire(7).unwrap();
		assert!(marker.path().exists());
	}
}
