// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tunnel device seam and its userspace WireGuard implementation.

pub mod uapi;
pub mod userspace;

use crate::error::DeviceError;
use async_trait::async_trait;
use loom_mesh_common::PeerSet;

pub use uapi::{PeerUpdate, UapiClient};
pub use userspace::{PinnedPeer, UserspaceDevice, UserspaceDeviceConfig};

/// A tunnel device that accepts peer configuration.
///
/// Implementations are not required to tolerate concurrent calls; callers
/// serialise every mutating call behind one lock.
#[async_trait]
pub trait TunnelDevice: Send {
	/// Make `peers` the dynamic peer set. Each peer's allowed ranges are
	/// replaced wholesale.
	async fn configure(&mut self, peers: &PeerSet) -> Result<(), DeviceError>;

	async fn close(&mut self) -> Result<(), DeviceError>;
}
