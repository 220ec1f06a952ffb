// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client for the WireGuard cross-platform userspace configuration protocol.
//!
//! A `set` transaction is `set=1\n`, a run of `key=value` lines, and a blank
//! line. The implementation answers with `errno=N` and a blank line.

use crate::error::DeviceError;
use ipnet::IpNet;
use loom_mesh_common::{PeerConfig, WgPrivateKey, WgPublicKey};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{instrument, trace};
use zeroize::Zeroizing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
	Upsert {
		public_key: WgPublicKey,
		endpoint: Option<SocketAddr>,
		allowed_ips: Vec<IpNet>,
		persistent_keepalive: Option<u16>,
	},
	Remove(WgPublicKey),
}

impl From<&PeerConfig> for PeerUpdate {
	fn from(peer: &PeerConfig) -> Self {
		PeerUpdate::Upsert {
			public_key: peer.public_key,
			endpoint: Some(peer.endpoint),
			allowed_ips: peer.allowed_ips.iter().copied().collect(),
			persistent_keepalive: peer.persistent_keepalive,
		}
	}
}

/// Interface-level lines: private key and optional listen port.
pub fn render_interface(private_key: &WgPrivateKey, listen_port: Option<u16>) -> Zeroizing<String> {
	let mut body = Zeroizing::new(format!("private_key={}\n", private_key.to_hex().as_str()));
	if let Some(port) = listen_port {
		let _ = writeln!(body, "listen_port={port}");
	}
	body
}

/// Peer lines. `replace_allowed_ips` precedes the `allowed_ip` lines because
/// the implementation applies keys in order.
pub fn render_peers(updates: &[PeerUpdate]) -> String {
	let mut body = String::new();
	for update in updates {
		match update {
			PeerUpdate::Upsert {
				public_key,
				endpoint,
				allowed_ips,
				persistent_keepalive,
			} => {
				let _ = writeln!(body, "public_key={}", public_key.to_hex());
				body.push_str("replace_allowed_ips=true\n");
				if let Some(endpoint) = endpoint {
					let _ = writeln!(body, "endpoint={endpoint}");
				}
				if let Some(interval) = persistent_keepalive {
					let _ = writeln!(body, "persistent_keepalive_interval={interval}");
				}
				for range in allowed_ips {
					let _ = writeln!(body, "allowed_ip={range}");
				}
			}
			PeerUpdate::Remove(public_key) => {
				let _ = writeln!(body, "public_key={}", public_key.to_hex());
				body.push_str("remove=true\n");
			}
		}
	}
	body
}

#[derive(Debug, Clone)]
pub struct UapiClient {
	socket_path: PathBuf,
}

impl UapiClient {
	pub fn new(socket_path: impl Into<PathBuf>) -> Self {
		Self {
			socket_path: socket_path.into(),
		}
	}

	pub fn socket_path(&self) -> &Path {
		&self.socket_path
	}

	/// Runs one `set` transaction.
	#[instrument(skip(self, body), fields(socket = %self.socket_path.display()))]
	pub async fn set(&self, body: &str) -> Result<(), DeviceError> {
		let stream = UnixStream::connect(&self.socket_path).await?;
		let (read_half, mut write_half) = stream.into_split();

		let request = Zeroizing::new(format!("set=1\n{body}\n"));
		write_half.write_all(request.as_bytes()).await?;
		write_half.flush().await?;

		let mut reader = BufReader::new(read_half);
		let mut errno = None;
		let mut line = String::new();
		loop {
			line.clear();
			if reader.read_line(&mut line).await? == 0 {
				break;
			}
			let trimmed = line.trim_end();
			if trimmed.is_empty() {
				break;
			}
			trace!(line = %trimmed, "uapi response");
			if let Some(value) = trimmed.strip_prefix("errno=") {
				errno = Some(
					value
						.parse::<i32>()
						.map_err(|_| DeviceError::Protocol(trimmed.to_string()))?,
				);
			}
		}

		match errno {
			Some(0) => Ok(()),
			Some(code) => Err(DeviceError::Uapi(code)),
			None => Err(DeviceError::Protocol("response carried no errno".to_string())),
		}
	}
}
