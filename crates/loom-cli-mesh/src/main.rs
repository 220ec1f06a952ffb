// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Parser;
use console::style;
use loom_cli_mesh::{run, Cli};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	if let Err(e) = run(cli).await {
		eprintln!("{} {e:#}", style("Error:").red().bold());
		std::process::exit(1);
	}
}
