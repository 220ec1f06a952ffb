// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent configuration loaded from TOML.

use crate::device::{PinnedPeer, UserspaceDeviceConfig};
use crate::error::ConfigError;
use ipnet::IpNet;
use loom_mesh_common::{load_wg_key_env, WgKeyPair, WgPrivateKey, WgPublicKey};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const PRIVATE_KEY_ENV: &str = "LOOM_MESH_PRIVATE_KEY";

const MAX_INTERFACE_NAME: usize = 15;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeshConfig {
	#[serde(default)]
	pub interface: InterfaceConfig,
	#[serde(default)]
	pub hub: Option<HubConfig>,
	#[serde(default)]
	pub registry: RegistryConfig,
	#[serde(default)]
	pub discovery: DiscoveryConfig,
	#[serde(default)]
	pub device: DeviceConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
	#[serde(default = "default_interface_name")]
	pub name: String,
	/// Falls back to `LOOM_MESH_PRIVATE_KEY` / `LOOM_MESH_PRIVATE_KEY_FILE`.
	#[serde(default)]
	pub private_key: Option<WgPrivateKey>,
	#[serde(default)]
	pub address: Option<IpNet>,
	#[serde(default)]
	pub routes: Vec<IpNet>,
	#[serde(default)]
	pub listen_port: Option<u16>,
}

impl Default for InterfaceConfig {
	fn default() -> Self {
		Self {
			name: default_interface_name(),
			private_key: None,
			address: None,
			routes: Vec::new(),
			listen_port: None,
		}
	}
}

/// The rendezvous peer every node keeps a static tunnel to.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
	pub public_key: WgPublicKey,
	pub endpoint: String,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	#[serde(default)]
	pub persistent_keepalive: Option<u16>,
}

impl HubConfig {
	pub fn to_pinned(&self) -> PinnedPeer {
		PinnedPeer {
			public_key: self.public_key,
			endpoint: self.endpoint.clone(),
			allowed_ips: self.allowed_ips.clone(),
			persistent_keepalive: self.persistent_keepalive.filter(|k| *k > 0),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
	#[serde(default = "default_registry_endpoints")]
	pub endpoints: Vec<String>,
	#[serde(default = "default_registry_prefix")]
	pub prefix: String,
	#[serde(default = "default_five")]
	pub dial_timeout_secs: u64,
	#[serde(default = "default_five")]
	pub request_timeout_secs: u64,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			endpoints: default_registry_endpoints(),
			prefix: default_registry_prefix(),
			dial_timeout_secs: default_five(),
			request_timeout_secs: default_five(),
		}
	}
}

impl RegistryConfig {
	pub fn dial_timeout(&self) -> Duration {
		Duration::from_secs(self.dial_timeout_secs)
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
	#[serde(default = "default_interval_secs")]
	pub interval_secs: u64,
	/// Keepalive for discovered peers; 0 disables it.
	#[serde(default = "default_five_u16")]
	pub persistent_keepalive: u16,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			interval_secs: default_interval_secs(),
			persistent_keepalive: default_five_u16(),
		}
	}
}

impl DiscoveryConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}

	pub fn keepalive(&self) -> Option<u16> {
		(self.persistent_keepalive > 0).then_some(self.persistent_keepalive)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
	#[serde(default = "default_userspace_binary")]
	pub userspace_binary: PathBuf,
	#[serde(default = "default_socket_dir")]
	pub socket_dir: PathBuf,
	#[serde(default = "default_ready_timeout_secs")]
	pub ready_timeout_secs: u64,
}

impl Default for DeviceConfig {
	fn default() -> Self {
		Self {
			userspace_binary: default_userspace_binary(),
			socket_dir: default_socket_dir(),
			ready_timeout_secs: default_ready_timeout_secs(),
		}
	}
}

impl DeviceConfig {
	pub fn ready_timeout(&self) -> Duration {
		Duration::from_secs(self.ready_timeout_secs)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
	#[serde(default)]
	pub level: LogLevel,
	#[serde(default)]
	pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Error,
	Warn,
	#[default]
	Info,
	Debug,
	Trace,
}

impl LogLevel {
	pub fn as_str(self) -> &'static str {
		match self {
			LogLevel::Error => "error",
			LogLevel::Warn => "warn",
			LogLevel::Info => "info",
			LogLevel::Debug => "debug",
			LogLevel::Trace => "trace",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Pretty,
	Json,
	Compact,
}

fn default_interface_name() -> String {
	"lm0".to_string()
}

fn default_registry_endpoints() -> Vec<String> {
	vec!["http://127.0.0.1:2379".to_string()]
}

fn default_registry_prefix() -> String {
	"/loom/mesh/nodes/".to_string()
}

fn default_five() -> u64 {
	5
}

fn default_five_u16() -> u16 {
	5
}

fn default_interval_secs() -> u64 {
	10
}

fn default_userspace_binary() -> PathBuf {
	PathBuf::from("wireguard-go")
}

fn default_socket_dir() -> PathBuf {
	PathBuf::from("/var/run/wireguard")
}

fn default_ready_timeout_secs() -> u64 {
	10
}

/// Candidate config files, most specific first.
pub fn search_paths() -> Vec<PathBuf> {
	let mut paths = Vec::with_capacity(2);
	let config_home = std::env::var_os("XDG_CONFIG_HOME")
		.filter(|v| !v.is_empty())
		.map(PathBuf::from)
		.or_else(|| dirs::home_dir().map(|home| home.join(".config")));
	if let Some(config_home) = config_home {
		paths.push(config_home.join("loom/mesh.toml"));
	}
	paths.push(PathBuf::from("/etc/loom/mesh.toml"));
	paths
}

impl MeshConfig {
	/// Load from `explicit` or the first existing search path, then validate.
	pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
		let path = match explicit {
			Some(path) => path.to_path_buf(),
			None => {
				let candidates = search_paths();
				candidates
					.iter()
					.find(|p| p.is_file())
					.cloned()
					.ok_or_else(|| {
						ConfigError::NotFound(
							candidates
								.iter()
								.map(|p| p.display().to_string())
								.collect::<Vec<_>>()
								.join(", "),
						)
					})?
			}
		};

		let config = Self::from_path(&path)?;
		config.validate()?;
		debug!(path = %path.display(), "loaded mesh config");
		Ok((config, path))
	}

	pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
		let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let name_len = self.interface.name.len();
		if name_len == 0 || name_len > MAX_INTERFACE_NAME {
			return Err(ConfigError::invalid_value(
				"interface.name",
				format!("must be 1 to {MAX_INTERFACE_NAME} characters"),
			));
		}

		if self.registry.endpoints.is_empty() {
			return Err(ConfigError::missing_field("registry.endpoints"));
		}
		if !self.registry.prefix.ends_with('/') {
			return Err(ConfigError::invalid_value("registry.prefix", "must end with '/'"));
		}

		if self.discovery.interval_secs == 0 {
			return Err(ConfigError::invalid_value("discovery.interval_secs", "must be positive"));
		}
		if self.registry.request_timeout_secs == 0 || self.registry.request_timeout_secs >= self.discovery.interval_secs {
			return Err(ConfigError::invalid_value(
				"registry.request_timeout_secs",
				"must be positive and shorter than discovery.interval_secs",
			));
		}

		if let Some(hub) = &self.hub {
			if hub.endpoint.is_empty() {
				return Err(ConfigError::missing_field("hub.endpoint"));
			}
		}

		Ok(())
	}

	/// The local key pair from config, or from the environment.
	pub fn keypair(&self) -> Result<WgKeyPair, ConfigError> {
		self.keypair_from_env(PRIVATE_KEY_ENV)
	}

	fn keypair_from_env(&self, var: &str) -> Result<WgKeyPair, ConfigError> {
		if let Some(private) = &self.interface.private_key {
			return Ok(WgKeyPair::from_private_key(private.clone()));
		}
		load_wg_key_env(var)?.ok_or_else(|| ConfigError::missing_field("interface.private_key"))
	}

	/// How long a background start may take: registry dial, device socket,
	/// plus slack for interface setup.
	pub fn startup_timeout(&self) -> Duration {
		self.registry.dial_timeout() + self.device.ready_timeout() + Duration::from_secs(5)
	}

	pub fn pinned_peers(&self) -> Vec<PinnedPeer> {
		self.hub.iter().map(HubConfig::to_pinned).collect()
	}

	pub fn device_config(&self, keypair: &WgKeyPair) -> UserspaceDeviceConfig {
		UserspaceDeviceConfig {
			name: self.interface.name.clone(),
			userspace_binary: self.device.userspace_binary.clone(),
			socket_dir: self.device.socket_dir.clone(),
			private_key: keypair.private_key().clone(),
			address: self.interface.address,
			routes: self.interface.routes.clone(),
			listen_port: self.interface.listen_port,
			pinned: self.pinned_peers(),
			ready_timeout: self.device.ready_timeout(),
		}
	}
}
