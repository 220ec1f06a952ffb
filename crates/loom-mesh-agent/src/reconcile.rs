// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! One discovery/diff/apply cycle and the state it carries between cycles.

use crate::comparator::peer_sets_equal;
use crate::decoder::PeerRecordDecoder;
use crate::device::TunnelDevice;
use crate::error::DeviceError;
use crate::registry::RegistryEntry;
use loom_mesh_common::PeerSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
	/// Candidate matched the accepted set; the device was not called.
	Unchanged,
	/// The device accepted the candidate, which is now the accepted set.
	Applied(PeerSet),
}

/// Push `candidate` to `device` unless it equals `previous`.
///
/// On error the caller's accepted set must stay as it was.
pub async fn reconcile<D>(device: &mut D, candidate: PeerSet, previous: &PeerSet) -> Result<ApplyOutcome, DeviceError>
where
	D: TunnelDevice + ?Sized,
{
	if peer_sets_equal(&candidate, previous) {
		return Ok(ApplyOutcome::Unchanged);
	}

	device.configure(&candidate).await?;
	Ok(ApplyOutcome::Applied(candidate))
}

struct DeviceState<D> {
	device: D,
	accepted: PeerSet,
}

/// Owns the tunnel device and the last set it accepted, behind one lock.
///
/// Clones share the same device.
pub struct ReconciliationEngine<D> {
	decoder: PeerRecordDecoder,
	keepalive: Option<u16>,
	state: Arc<Mutex<DeviceState<D>>>,
}

impl<D> Clone for ReconciliationEngine<D> {
	fn clone(&self) -> Self {
		Self {
			decoder: self.decoder.clone(),
			keepalive: self.keepalive,
			state: Arc::clone(&self.state),
		}
	}
}

impl<D: TunnelDevice> ReconciliationEngine<D> {
	pub fn new(decoder: PeerRecordDecoder, device: D, keepalive: Option<u16>) -> Self {
		Self {
			decoder,
			keepalive,
			state: Arc::new(Mutex::new(DeviceState {
				device,
				accepted: PeerSet::new(),
			})),
		}
	}

	pub fn prefix(&self) -> &str {
		self.decoder.prefix()
	}

	/// Decode a registry snapshot and apply it if it differs from what the
	/// device last accepted.
	#[instrument(skip(self, entries), fields(entries = entries.len()))]
	pub async fn run_tick(&self, entries: &[RegistryEntry]) -> Result<ApplyOutcome, DeviceError> {
		let candidate = self.candidate(entries).await;
		self.apply(candidate).await
	}

	/// Decode and resolve a registry snapshot into a candidate set. Runs
	/// without the device lock, so it can be abandoned at any await point.
	pub async fn candidate(&self, entries: &[RegistryEntry]) -> PeerSet {
		let records = self.decoder.decode(entries);
		let accepted = self.accepted().await;
		let candidate = self.decoder.to_peer_set(records, self.keepalive, &accepted).await;
		debug!(candidate = candidate.len(), "decoded candidate peer set");
		candidate
	}

	/// Push `candidate` to the device under the lock unless it matches the
	/// accepted set. The accepted set only changes on success.
	pub async fn apply(&self, candidate: PeerSet) -> Result<ApplyOutcome, DeviceError> {
		let mut state = self.state.lock().await;
		let DeviceState { device, accepted } = &mut *state;
		match reconcile(device, candidate, accepted).await {
			Ok(ApplyOutcome::Applied(set)) => {
				info!(peers = set.len(), "applied peer set to tunnel device");
				*accepted = set.clone();
				Ok(ApplyOutcome::Applied(set))
			}
			Ok(ApplyOutcome::Unchanged) => {
				debug!(peers = accepted.len(), "peer set unchanged");
				Ok(ApplyOutcome::Unchanged)
			}
			Err(e) => {
				warn!(error = %e, "failed to apply peer set, keeping previous");
				Err(e)
			}
		}
	}

	/// Snapshot of the set the device last accepted.
	pub async fn accepted(&self) -> PeerSet {
		self.state.lock().await.accepted.clone()
	}

	/// Release the device. Waits for any in-flight apply to finish.
	pub async fn close(&self) -> Result<(), DeviceError> {
		let mut state = self.state.lock().await;
		state.device.close().await
	}
}
