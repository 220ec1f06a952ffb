// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{CliError, Result};
use clap::Args;
use console::style;
use loom_mesh_agent::{process_alive, request_shutdown, LockMarker, MarkerStatus};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Args)]
pub struct DownArgs {
	/// Seconds to wait for the agent to exit
	#[arg(long, default_value = "10")]
	pub timeout: u64,
}

/// Signal the agent named by the marker and wait for it to exit.
#[instrument(skip(marker), fields(marker = %marker.path().display()))]
pub async fn handle_down(args: DownArgs, marker: &LockMarker) -> Result<()> {
	let pid = match marker.inspect()? {
		MarkerStatus::Live(pid) => pid,
		MarkerStatus::Absent => return Err(CliError::NotRunning(marker.path().to_path_buf())),
		MarkerStatus::Stale => {
			marker.ensure_vacant()?;
			println!("{} Removed stale lock marker", style("!").yellow().bold());
			return Err(CliError::NotRunning(marker.path().to_path_buf()));
		}
	};

	request_shutdown(pid).map_err(|source| CliError::Signal { pid, source })?;
	debug!(pid, "sent SIGTERM");

	let timeout = Duration::from_secs(args.timeout);
	let deadline = Instant::now() + timeout;
	while process_alive(pid) {
		if Instant::now() >= deadline {
			return Err(CliError::StopTimeout { pid, timeout });
		}
		tokio::time::sleep(POLL_INTERVAL).await;
	}

	// The agent removes its own marker; this covers an agent that died hard.
	marker.release_if_owned(pid);

	println!("{} Mesh agent stopped (pid {})", style("✓").green().bold(), pid);
	Ok(())
}
