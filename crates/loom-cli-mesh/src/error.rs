// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
	#[error("no running agent (marker {0})")]
	NotRunning(PathBuf),

	#[error("failed to signal agent {pid}: {source}")]
	Signal {
		pid: u32,
		#[source]
		source: std::io::Error,
	},

	#[error("agent {pid} still running after {timeout:?}")]
	StopTimeout { pid: u32, timeout: Duration },

	#[error("lock marker error: {0}")]
	Lock(#[from] loom_mesh_agent::LockError),

	#[error("configuration error: {0}")]
	Config(#[from] loom_mesh_agent::ConfigError),

	#[error(transparent)]
	Agent(#[from] loom_mesh_agent::AgentError),
}

pub type Result<T> = std::result::Result<T, CliError>;
