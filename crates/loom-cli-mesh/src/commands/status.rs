// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use console::style;
use loom_mesh_agent::{LockMarker, MarkerStatus};
use tracing::instrument;

/// Report whether an agent is running. A stale marker is removed on the way.
#[instrument(skip(marker), fields(marker = %marker.path().display()))]
pub fn handle_status(marker: &LockMarker) -> Result<MarkerStatus> {
	let status = marker.inspect()?;

	match status {
		MarkerStatus::Live(pid) => {
			println!("{} Mesh agent is running", style("●").green().bold());
			println!("  PID:    {}", style(pid).cyan());
			println!("  Marker: {}", style(marker.path().display()).dim());
		}
		MarkerStatus::Stale => {
			marker.ensure_vacant()?;
			println!("{} Mesh agent is not running (removed stale marker)", style("●").dim());
		}
		MarkerStatus::Absent => {
			println!("{} Mesh agent is not running", style("●").dim());
		}
	}

	Ok(status)
}
