// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Args;
use console::style;
use loom_mesh_agent::supervisor::{is_supervised, ready_file_from_env};
use loom_mesh_agent::{build_discovery, AgentLifecycle, ExecutionMode, LockMarker, MeshConfig, Supervisor};
use std::path::PathBuf;
use tracing::{info, instrument};

#[derive(Debug, Clone, Args)]
pub struct UpArgs {
	/// Configuration file (default: $XDG_CONFIG_HOME/loom/mesh.toml, then /etc/loom/mesh.toml)
	#[arg(long, short, env = "LOOM_MESH_CONFIG")]
	pub config: Option<PathBuf>,

	/// Host the agent in this process instead of starting it in the background
	#[arg(long)]
	pub foreground: bool,
}

#[instrument(skip(config, marker))]
pub async fn handle_up(args: UpArgs, config: MeshConfig, marker: LockMarker) -> anyhow::Result<()> {
	let supervised = is_supervised();

	if !args.foreground && !supervised {
		let supervisor = Supervisor::new(
			marker,
			std::env::args_os().skip(1).collect(),
			config.startup_timeout(),
		);
		let agent = supervisor.spawn().await?;

		println!(
			"{} Mesh agent started in background (pid {})",
			style("✓").green().bold(),
			style(agent.pid).cyan()
		);
		println!("  Log: {}", style(agent.log.display()).dim());
		println!("\nUse 'loom-mesh down' to stop it.");
		return Ok(());
	}

	let mode = if supervised {
		ExecutionMode::Supervised {
			ready_file: ready_file_from_env(),
		}
	} else {
		ExecutionMode::Foreground
	};
	info!(?mode, iface = %config.interface.name, "starting mesh agent");

	if !supervised {
		println!(
			"{} Mesh agent running on {}. Press Ctrl+C to stop.",
			style("●").green().bold(),
			style(&config.interface.name).cyan()
		);
	}

	let lifecycle = AgentLifecycle::new(marker, mode);
	lifecycle.run(|| build_discovery(&config)).await?;

	if !supervised {
		println!("{} Mesh agent stopped", style("✓").green().bold());
	}
	Ok(())
}
