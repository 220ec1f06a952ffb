// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod commands;
pub mod error;
pub mod logging;

use clap::{Parser, Subcommand};
use commands::{DownArgs, UpArgs};
use loom_mesh_agent::config::LoggingConfig;
use loom_mesh_agent::{LockMarker, LogLevel, MeshConfig};

pub use error::CliError;

#[derive(Parser, Debug)]
#[command(name = "loom-mesh", version, about = "Loom mesh VPN agent", long_about = None)]
pub struct Cli {
	/// Force debug logging
	#[arg(long, global = true)]
	pub debug: bool,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Start the mesh agent
	Up(UpArgs),
	/// Stop the running mesh agent
	Down(DownArgs),
	/// Show whether the mesh agent is running
	Status,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
	let marker = LockMarker::at_default_path();

	match cli.command {
		Command::Up(args) => {
			let (config, path) = MeshConfig::load(args.config.as_deref())?;
			logging::init_tracing(&config.logging, cli.debug);
			tracing::debug!(config = %path.display(), marker = %marker.path().display(), "configuration loaded");
			commands::handle_up(args, config, marker).await
		}
		Command::Down(args) => {
			logging::init_tracing(&quiet_logging(), cli.debug);
			commands::handle_down(args, &marker).await?;
			Ok(())
		}
		Command::Status => {
			logging::init_tracing(&quiet_logging(), cli.debug);
			commands::handle_status(&marker)?;
			Ok(())
		}
	}
}

fn quiet_logging() -> LoggingConfig {
	LoggingConfig {
		level: LogLevel::Warn,
		..LoggingConfig::default()
	}
}
