// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::MeshConfig;
use crate::decoder::PeerRecordDecoder;
use crate::device::UserspaceDevice;
use crate::discovery::DiscoveryLoop;
use crate::error::Result;
use crate::reconcile::ReconciliationEngine;
use crate::registry::EtcdRegistry;
use loom_mesh_common::PeerIdentity;
use std::sync::Arc;
use tracing::{info, instrument};

/// Build the production discovery loop: etcd registry, userspace tunnel
/// device, and a decoder that skips this node and the hub.
#[instrument(skip(config), fields(iface = %config.interface.name))]
pub async fn build_discovery(config: &MeshConfig) -> Result<DiscoveryLoop<UserspaceDevice>> {
	let keypair = config.keypair()?;
	let local = PeerIdentity::from_public_key(keypair.public_key());
	info!(public_key = %keypair.public_key(), "loaded node key");

	let registry = EtcdRegistry::connect(&config.registry.endpoints, config.registry.dial_timeout()).await?;

	let pinned = config
		.hub
		.iter()
		.map(|hub| PeerIdentity::from_public_key(&hub.public_key));
	let decoder = PeerRecordDecoder::new(config.registry.prefix.clone(), local)
		.with_pinned(pinned)
		.with_resolve_timeout(config.registry.request_timeout());

	let device = UserspaceDevice::create(config.device_config(&keypair)).await?;
	let engine = ReconciliationEngine::new(decoder, device, config.discovery.keepalive());

	Ok(DiscoveryLoop::new(
		engine,
		Arc::new(registry),
		config.discovery.interval(),
		config.registry.request_timeout(),
	))
}
