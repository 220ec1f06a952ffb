// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::state::AgentState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("agent already running with pid {pid}")]
	AlreadyRunning { pid: u32 },

	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("registry error: {0}")]
	Registry(#[from] RegistryError),

	#[error("tunnel device error: {0}")]
	Device(#[from] DeviceError),

	#[error("lock marker error: {0}")]
	Lock(LockError),

	#[error("supervisor error: {0}")]
	Supervisor(#[from] SupervisorError),

	#[error("invalid state transition from {from} to {to}")]
	InvalidTransition { from: AgentState, to: AgentState },

	#[error("discovery loop fault: {0}")]
	LoopFault(String),

	#[error("agent start-up panicked: {0}")]
	StartupPanic(String),

	#[error("failed to install signal handler: {0}")]
	Signal(#[source] std::io::Error),
}

impl From<LockError> for AgentError {
	fn from(err: LockError) -> Self {
		match err {
			LockError::AlreadyRunning { pid } => AgentError::AlreadyRunning { pid },
			other => AgentError::Lock(other),
		}
	}
}

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("etcd error: {0}")]
	Etcd(#[from] etcd_client::Error),

	#[error("registry request timed out after {0:?}")]
	Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum DeviceError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("UAPI request rejected with errno {0}")]
	Uapi(i32),

	#[error("malformed UAPI response: {0}")]
	Protocol(String),

	#[error("`{command}` failed: {message}")]
	Command { command: String, message: String },

	#[error("UAPI socket {path} did not appear within {timeout:?}")]
	SocketTimeout { path: PathBuf, timeout: Duration },

	#[error("tunnel device is closed")]
	Closed,
}

#[derive(Debug, Error)]
pub enum LockError {
	#[error("I/O error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("agent already running with pid {pid}")]
	AlreadyRunning { pid: u32 },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
	#[error("cannot determine current executable: {0}")]
	CurrentExe(#[source] std::io::Error),

	#[error("failed to spawn background agent: {0}")]
	Spawn(#[source] std::io::Error),

	#[error("background agent exited during startup ({status}); see {log}")]
	ChildExited { status: String, log: PathBuf },

	#[error("background agent not ready within {timeout:?}; see {log}")]
	ReadyTimeout { timeout: Duration, log: PathBuf },
}

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// I/O error reading config file
	#[error("I/O error reading {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// TOML parsing error
	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	/// No config file was given and none was found in the default locations
	#[error("no configuration file found (searched {0})")]
	NotFound(String),

	/// Missing required field
	#[error("Missing required field: {0}")]
	MissingField(String),

	/// Invalid value
	#[error("Invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },

	#[error("key error: {0}")]
	Key(#[from] loom_mesh_common::KeyFileError),
}

impl ConfigError {
	pub fn missing_field(field: impl Into<String>) -> Self {
		Self::MissingField(field.into())
	}

	pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InvalidValue {
			field: field.into(),
			message: message.into(),
		}
	}
}

pub type Result<T> = std::result::Result<T, AgentError>;
