// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_mesh_agent::config::LoggingConfig;
use loom_mesh_agent::{LogFormat, LogLevel};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CRATES: [&str; 3] = ["loom_mesh_agent", "loom_mesh_common", "loom_cli_mesh"];

/// Filter for our crates at `level`; everything else stays at `warn`.
pub fn filter_directive(level: LogLevel) -> String {
	let mut directive = String::from("warn");
	for krate in CRATES {
		directive.push(',');
		directive.push_str(krate);
		directive.push('=');
		directive.push_str(level.as_str());
	}
	directive
}

/// Install the global subscriber. `--debug` wins over `RUST_LOG`, which wins
/// over the configured level.
pub fn init_tracing(logging: &LoggingConfig, debug: bool) {
	let filter = if debug {
		EnvFilter::new(filter_directive(LogLevel::Debug))
	} else {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(logging.level)))
	};

	match logging.format {
		LogFormat::Json => {
			tracing_subscriber::registry()
				.with(filter)
				.with(fmt::layer().json())
				.init();
		}
		LogFormat::Compact => {
			tracing_subscriber::registry()
				.with(filter)
				.with(fmt::layer().compact())
				.init();
		}
		LogFormat::Pretty => {
			tracing_subscriber::registry()
				.with(filter)
				.with(fmt::layer())
				.init();
		}
	}
}
