// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::device::TunnelDevice;
use crate::error::{AgentError, DeviceError, RegistryError};
use crate::reconcile::{ApplyOutcome, ReconciliationEngine};
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of a single discovery tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
	Unchanged { peers: usize },
	Applied { peers: usize },
	/// Registry unreachable or slow; retried next tick.
	FetchFailed(String),
	/// Device rejected the candidate; retried next tick.
	ApplyFailed(String),
	/// The device can no longer be used. Ends the loop.
	Fatal(String),
	Cancelled,
}

/// Drives the reconciliation engine on a fixed period until cancelled.
pub struct DiscoveryLoop<D> {
	engine: ReconciliationEngine<D>,
	registry: Arc<dyn Registry>,
	interval: Duration,
	request_timeout: Duration,
}

impl<D: TunnelDevice> DiscoveryLoop<D> {
	pub fn new(
		engine: ReconciliationEngine<D>,
		registry: Arc<dyn Registry>,
		interval: Duration,
		request_timeout: Duration,
	) -> Self {
		Self {
			engine,
			registry,
			interval,
			request_timeout,
		}
	}

	pub fn engine(&self) -> &ReconciliationEngine<D> {
		&self.engine
	}

	/// Run ticks back to back on the interval. The first tick fires
	/// immediately. Returns `Ok` on cancellation and `LoopFault` when a tick
	/// reports a fatal outcome.
	#[instrument(skip(self, token), fields(interval = ?self.interval))]
	pub async fn run(self, token: CancellationToken) -> Result<(), AgentError> {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		info!("discovery loop started");

		loop {
			tokio::select! {
				biased;

				_ = token.cancelled() => {
					info!("discovery loop cancelled");
					return Ok(());
				}

				_ = ticker.tick() => {}
			}

			match self.tick(&token).await {
				TickOutcome::Unchanged { peers } => debug!(peers, "tick: unchanged"),
				TickOutcome::Applied { peers } => debug!(peers, "tick: applied"),
				TickOutcome::FetchFailed(reason) => warn!(%reason, "registry fetch failed, skipping tick"),
				TickOutcome::ApplyFailed(reason) => warn!(%reason, "apply failed, will retry"),
				TickOutcome::Fatal(reason) => {
					error!(%reason, "discovery loop fault");
					return Err(AgentError::LoopFault(reason));
				}
				TickOutcome::Cancelled => {
					info!("discovery loop cancelled mid-tick");
					return Ok(());
				}
			}
		}
	}

	/// One fetch/decode/compare/apply pass. The fetch is bounded by the
	/// request timeout. Fetch and endpoint resolution are abandoned on
	/// cancellation; an apply in progress always runs to completion.
	pub async fn tick(&self, token: &CancellationToken) -> TickOutcome {
		let prefix = self.engine.prefix();
		let fetch = tokio::time::timeout(self.request_timeout, self.registry.list_under(prefix));

		let entries = tokio::select! {
			biased;

			_ = token.cancelled() => return TickOutcome::Cancelled,

			result = fetch => match result {
				Ok(Ok(entries)) => entries,
				Ok(Err(e)) => return TickOutcome::FetchFailed(e.to_string()),
				Err(_) => return TickOutcome::FetchFailed(RegistryError::Timeout(self.request_timeout).to_string()),
			},
		};
		debug!(entries = entries.len(), "fetched registry snapshot");

		let candidate = tokio::select! {
			biased;

			_ = token.cancelled() => return TickOutcome::Cancelled,

			set = self.engine.candidate(&entries) => set,
		};

		match self.engine.apply(candidate).await {
			Ok(ApplyOutcome::Unchanged) => TickOutcome::Unchanged {
				peers: self.engine.accepted().await.len(),
			},
			Ok(ApplyOutcome::Applied(set)) => TickOutcome::Applied { peers: set.len() },
			Err(DeviceError::Closed) => TickOutcome::Fatal(DeviceError::Closed.to_string()),
			Err(e) => TickOutcome::ApplyFailed(e.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::decoder::PeerRecordDecoder;
	use crate::registry::RegistryEntry;
	use crate::resolver::EndpointResolver;
	use async_trait::async_trait;
	use loom_mesh_common::{PeerIdentity, PeerSet, WgPublicKey};
	use std::net::SocketAddr;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	struct StaticRegistry {
		entries: Vec<RegistryEntry>,
		calls: Arc<AtomicUsize>,
		fail: Arc<AtomicBool>,
		hang: bool,
	}

	#[async_trait]
	impl Registry for StaticRegistry {
		async fn list_under(&self, _prefix: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.hang {
				std::future::pending::<()>().await;
			}
			if self.fail.load(Ordering::SeqCst) {
				return Err(RegistryError::Timeout(Duration::from_secs(0)));
			}
			Ok(self.entries.clone())
		}
	}

	#[derive(Default)]
	struct RecordingDevice {
		configures: Arc<AtomicUsize>,
		closed: bool,
	}

	#[async_trait]
	impl TunnelDevice for RecordingDevice {
		async fn configure(&mut self, _peers: &PeerSet) -> Result<(), DeviceError> {
			if self.closed {
				return Err(DeviceError::Closed);
			}
			self.configures.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		async fn close(&mut self) -> Result<(), DeviceError> {
			self.closed = true;
			Ok(())
		}
	}

	struct StuckResolver;

	#[async_trait]
	impl EndpointResolver for StuckResolver {
		async fn resolve(&self, _endpoint: &str) -> std::io::Result<SocketAddr> {
			std::future::pending().await
		}
	}

	fn snapshot() -> Vec<RegistryEntry> {
		let id = WgPublicKey::from_bytes([7; 32]).to_base64();
		vec![
			RegistryEntry::new(format!("/mesh/{id}/address"), "10.42.0.7"),
			RegistryEntry::new(format!("/mesh/{id}/endpoint"), "192.0.2.7:51820"),
		]
	}

	fn registry(hang: bool) -> (Arc<StaticRegistry>, Arc<AtomicUsize>, Arc<AtomicBool>) {
		let calls = Arc::new(AtomicUsize::new(0));
		let fail = Arc::new(AtomicBool::new(false));
		let registry = Arc::new(StaticRegistry {
			entries: snapshot(),
			calls: calls.clone(),
			fail: fail.clone(),
			hang,
		});
		(registry, calls, fail)
	}

	fn engine(device: RecordingDevice) -> ReconciliationEngine<RecordingDevice> {
		let local = PeerIdentity::from_public_key(&WgPublicKey::from_bytes([1; 32]));
		ReconciliationEngine::new(PeerRecordDecoder::new("/mesh/", local), device, Some(5))
	}

	#[tokio::test(start_paused = true)]
	async fn ticks_on_interval_and_applies_once() {
		let device = RecordingDevice::default();
		let configures = device.configures.clone();
		let (registry, calls, _) = registry(false);
		let discovery = DiscoveryLoop::new(engine(device), registry, Duration::from_secs(10), Duration::from_secs(5));

		let token = CancellationToken::new();
		let handle = tokio::spawn(discovery.run(token.clone()));

		tokio::time::sleep(Duration::from_secs(25)).await;
		token.cancel();
		handle.await.unwrap().unwrap();

		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert_eq!(configures.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn fetch_failure_skips_without_touching_device() {
		let device = RecordingDevice::default();
		let configures = device.configures.clone();
		let (registry, _, fail) = registry(false);
		fail.store(true, Ordering::SeqCst);
		let discovery = DiscoveryLoop::new(engine(device), registry, Duration::from_secs(10), Duration::from_secs(5));

		let outcome = discovery.tick(&CancellationToken::new()).await;
		assert!(matches!(outcome, TickOutcome::FetchFailed(_)));
		assert_eq!(configures.load(Ordering::SeqCst), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn slow_registry_hits_request_timeout() {
		let (registry, _, _) = registry(true);
		let discovery = DiscoveryLoop::new(
			engine(RecordingDevice::default()),
			registry,
			Duration::from_secs(10),
			Duration::from_secs(5),
		);

		let outcome = discovery.tick(&CancellationToken::new()).await;
		assert!(matches!(outcome, TickOutcome::FetchFailed(ref reason) if reason.contains("timed out")));
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_interrupts_pending_fetch() {
		let (registry, calls, _) = registry(true);
		let discovery = DiscoveryLoop::new(
			engine(RecordingDevice::default()),
			registry,
			Duration::from_secs(10),
			Duration::from_secs(60),
		);

		let token = CancellationToken::new();
		let handle = tokio::spawn(discovery.run(token.clone()));
		tokio::time::sleep(Duration::from_secs(1)).await;
		token.cancel();
		handle.await.unwrap().unwrap();

		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_interrupts_endpoint_resolution() {
		let device = RecordingDevice::default();
		let configures = device.configures.clone();
		let (registry, calls, _) = registry(false);
		let local = PeerIdentity::from_public_key(&WgPublicKey::from_bytes([1; 32]));
		let decoder = PeerRecordDecoder::new("/mesh/", local)
			.with_resolver(Arc::new(StuckResolver))
			.with_resolve_timeout(Duration::from_secs(3600));
		let engine = ReconciliationEngine::new(decoder, device, Some(5));
		let discovery = DiscoveryLoop::new(engine, registry, Duration::from_secs(10), Duration::from_secs(5));

		let token = CancellationToken::new();
		let handle = tokio::spawn(discovery.run(token.clone()));
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		token.cancel();
		let cancelled_at = tokio::time::Instant::now();
		handle.await.unwrap().unwrap();

		assert!(cancelled_at.elapsed() < Duration::from_secs(1));
		assert_eq!(configures.load(Ordering::SeqCst), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn closed_device_ends_loop_with_fault() {
		let (registry, _, _) = registry(false);
		let engine = engine(RecordingDevice::default());
		engine.close().await.unwrap();
		let discovery = DiscoveryLoop::new(engine, registry, Duration::from_secs(10), Duration::from_secs(5));

		let err = discovery.run(CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, AgentError::LoopFault(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn already_cancelled_makes_no_registry_calls() {
		let (registry, calls, _) = registry(false);
		let discovery = DiscoveryLoop::new(
			engine(RecordingDevice::default()),
			registry,
			Duration::from_secs(10),
			Duration::from_secs(5),
		);

		let token = CancellationToken::new();
		token.cancel();
		discovery.run(token).await.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}
}
