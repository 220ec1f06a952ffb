// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tunnel device backed by a userspace WireGuard process driven over UAPI.

use super::uapi::{render_interface, render_peers, PeerUpdate, UapiClient};
use super::TunnelDevice;
use crate::error::DeviceError;
use async_trait::async_trait;
use ipnet::IpNet;
use loom_mesh_common::{PeerSet, WgPrivateKey, WgPublicKey};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

const SOCKET_POLL_START: Duration = Duration::from_millis(25);
const SOCKET_POLL_MAX: Duration = Duration::from_millis(200);

/// A statically configured peer, such as the rendezvous hub.
#[derive(Debug, Clone)]
pub struct PinnedPeer {
	pub public_key: WgPublicKey,
	/// `host:port`; resolved once when the device is created.
	pub endpoint: String,
	pub allowed_ips: Vec<IpNet>,
	pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct UserspaceDeviceConfig {
	pub name: String,
	pub userspace_binary: PathBuf,
	pub socket_dir: PathBuf,
	pub private_key: WgPrivateKey,
	pub address: Option<IpNet>,
	pub routes: Vec<IpNet>,
	pub listen_port: Option<u16>,
	pub pinned: Vec<PinnedPeer>,
	pub ready_timeout: Duration,
}

impl UserspaceDeviceConfig {
	pub fn socket_path(&self) -> PathBuf {
		self.socket_dir.join(format!("{}.sock", self.name))
	}
}

pub struct UserspaceDevice {
	name: String,
	uapi: UapiClient,
	child: Option<Child>,
	pinned: BTreeSet<WgPublicKey>,
	configured: BTreeSet<WgPublicKey>,
	closed: bool,
}

impl UserspaceDevice {
	/// Start the userspace implementation, bring the interface up and load
	/// the private key and pinned peers.
	///
	/// Any failure after the child is spawned drops it, which kills it.
	#[instrument(skip(config), fields(iface = %config.name))]
	pub async fn create(config: UserspaceDeviceConfig) -> Result<Self, DeviceError> {
		let binary = config.userspace_binary.display().to_string();
		let child = Command::new(&config.userspace_binary)
			.arg("-f")
			.arg(&config.name)
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| DeviceError::Command {
				command: binary.clone(),
				message: e.to_string(),
			})?;
		debug!(pid = ?child.id(), binary = %binary, "spawned userspace tunnel");

		let socket_path = config.socket_path();
		let mut device = Self {
			name: config.name.clone(),
			uapi: UapiClient::new(&socket_path),
			child: Some(child),
			pinned: config.pinned.iter().map(|p| p.public_key).collect(),
			configured: BTreeSet::new(),
			closed: false,
		};

		wait_for_socket(&socket_path, config.ready_timeout, device.child.as_mut()).await?;

		if let Some(address) = config.address {
			run_ip(&["address", "add", &address.to_string(), "dev", &config.name]).await?;
		}
		run_ip(&["link", "set", "up", "dev", &config.name]).await?;
		for route in &config.routes {
			run_ip(&["route", "add", &route.to_string(), "dev", &config.name]).await?;
		}

		let mut pinned_updates = Vec::with_capacity(config.pinned.len());
		for peer in &config.pinned {
			pinned_updates.push(PeerUpdate::Upsert {
				public_key: peer.public_key,
				endpoint: Some(resolve(&peer.endpoint).await?),
				allowed_ips: peer.allowed_ips.clone(),
				persistent_keepalive: peer.persistent_keepalive,
			});
		}

		let mut body = render_interface(&config.private_key, config.listen_port);
		body.push_str(&render_peers(&pinned_updates));
		device.uapi.set(&body).await?;

		info!(
			pinned = pinned_updates.len(),
			socket = %socket_path.display(),
			"tunnel interface ready"
		);
		Ok(device)
	}

	/// Drive an already running implementation through its socket without
	/// owning a child process.
	pub fn attach(name: impl Into<String>, uapi: UapiClient, pinned: impl IntoIterator<Item = WgPublicKey>) -> Self {
		Self {
			name: name.into(),
			uapi,
			child: None,
			pinned: pinned.into_iter().collect(),
			configured: BTreeSet::new(),
			closed: false,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	fn plan(&self, peers: &PeerSet) -> (Vec<PeerUpdate>, BTreeSet<WgPublicKey>) {
		let mut updates = Vec::with_capacity(peers.len());
		let mut next = BTreeSet::new();

		for peer in peers {
			if self.pinned.contains(&peer.public_key) {
				warn!(peer = %peer.identity, "ignoring dynamic entry for pinned peer");
				continue;
			}
			next.insert(peer.public_key);
			updates.push(PeerUpdate::from(peer));
		}

		for stale in self.configured.difference(&next) {
			updates.push(PeerUpdate::Remove(*stale));
		}

		(updates, next)
	}
}

#[async_trait]
impl TunnelDevice for UserspaceDevice {
	#[instrument(skip(self, peers), fields(iface = %self.name, peers = peers.len()))]
	async fn configure(&mut self, peers: &PeerSet) -> Result<(), DeviceError> {
		if self.closed {
			return Err(DeviceError::Closed);
		}

		let (updates, next) = self.plan(peers);
		if updates.is_empty() {
			trace!("no peer changes to send");
			return Ok(());
		}

		let removed = self.configured.difference(&next).count();
		self.uapi.set(&render_peers(&updates)).await?;
		self.configured = next;

		debug!(configured = self.configured.len(), removed, "peer configuration applied");
		Ok(())
	}

	#[instrument(skip(self), fields(iface = %self.name))]
	async fn close(&mut self) -> Result<(), DeviceError> {
		if self.closed {
			return Ok(());
		}
		self.closed = true;

		if let Some(mut child) = self.child.take() {
			if let Err(e) = child.kill().await {
				warn!(error = %e, "failed to stop userspace tunnel");
				return Err(DeviceError::Io(e));
			}
		}

		info!("tunnel interface closed");
		Ok(())
	}
}

impl std::fmt::Debug for UserspaceDevice {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UserspaceDevice")
			.field("name", &self.name)
			.field("socket", &self.uapi.socket_path())
			.field("configured", &self.configured.len())
			.field("closed", &self.closed)
			.finish_non_exhaustive()
	}
}

/// Poll until `path` exists, backing off from 25ms to 200ms.
async fn wait_for_socket(path: &Path, timeout: Duration, mut child: Option<&mut Child>) -> Result<(), DeviceError> {
	let deadline = Instant::now() + timeout;
	let mut delay = SOCKET_POLL_START;

	loop {
		if tokio::fs::metadata(path).await.is_ok() {
			return Ok(());
		}

		if let Some(child) = child.as_deref_mut() {
			if let Some(status) = child.try_wait()? {
				return Err(DeviceError::Command {
					command: "userspace tunnel".to_string(),
					message: format!("exited before creating its socket ({status})"),
				});
			}
		}

		let now = Instant::now();
		if now >= deadline {
			return Err(DeviceError::SocketTimeout {
				path: path.to_path_buf(),
				timeout,
			});
		}

		tokio::time::sleep(delay.min(deadline - now)).await;
		delay = (delay * 2).min(SOCKET_POLL_MAX);
	}
}

async fn run_ip(args: &[&str]) -> Result<(), DeviceError> {
	let command = format!("ip {}", args.join(" "));
	trace!(cmd = %command, "running ip command");

	let output = Command::new("ip")
		.args(args)
		.stdin(Stdio::null())
		.output()
		.await
		.map_err(|e| DeviceError::Command {
			command: command.clone(),
			message: e.to_string(),
		})?;

	if output.status.success() {
		Ok(())
	} else {
		Err(DeviceError::Command {
			command,
			message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		})
	}
}

async fn resolve(endpoint: &str) -> Result<std::net::SocketAddr, DeviceError> {
	tokio::net::lookup_host(endpoint)
		.await?
		.next()
		.ok_or_else(|| DeviceError::Command {
			command: format!("resolve {endpoint}"),
			message: "no addresses returned".to_string(),
		})
}
