// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-level lifecycle: single-instance guard, signal-driven shutdown and
//! containment of discovery loop faults.

use crate::device::TunnelDevice;
use crate::discovery::DiscoveryLoop;
use crate::error::{AgentError, Result};
use crate::lock::LockMarker;
use crate::state::{AgentState, StateMachine};
use crate::supervisor::signal_ready;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// How the hosting process was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
	/// The caller's process hosts the loop and owns the lock marker.
	Foreground,
	/// Started by the supervisor, which records the marker once `ready_file`
	/// appears.
	Supervised { ready_file: Option<PathBuf> },
}

pub struct AgentLifecycle {
	state: StateMachine,
	marker: LockMarker,
	mode: ExecutionMode,
	token: CancellationToken,
	handle_signals: bool,
}

impl AgentLifecycle {
	pub fn new(marker: LockMarker, mode: ExecutionMode) -> Self {
		Self {
			state: StateMachine::new(),
			marker,
			mode,
			token: CancellationToken::new(),
			handle_signals: true,
		}
	}

	/// Disable SIGINT/SIGTERM handling; shutdown then comes only from the
	/// cancellation token.
	pub fn without_signal_handlers(mut self) -> Self {
		self.handle_signals = false;
		self
	}

	pub fn state(&self) -> AgentState {
		self.state.current()
	}

	pub fn subscribe(&self) -> watch::Receiver<AgentState> {
		self.state.subscribe()
	}

	/// Cancelling this token shuts the agent down.
	pub fn cancellation_token(&self) -> CancellationToken {
		self.token.clone()
	}

	/// Refuse to start if another live agent holds the marker.
	fn claim_instance(&self) -> Result<()> {
		match self.mode {
			ExecutionMode::Foreground => self.marker.acquire(std::process::id())?,
			ExecutionMode::Supervised { .. } => self.marker.ensure_vacant()?,
		}
		Ok(())
	}

	/// Run the agent until shutdown.
	///
	/// `start` builds the discovery loop (keys, registry, device). Its errors
	/// are fatal-at-startup. A panic in `start` or a fault inside the running
	/// loop ends in `Failed` with the marker removed.
	#[instrument(skip(self, start), fields(mode = ?self.mode))]
	pub async fn run<D, F, Fut>(&self, start: F) -> Result<()>
	where
		D: TunnelDevice + 'static,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<DiscoveryLoop<D>>>,
	{
		self.claim_instance()?;
		self.state.transition(AgentState::Starting)?;

		let signals = if self.handle_signals {
			match spawn_signal_watcher(self.token.clone()) {
				Ok(handle) => Some(handle),
				Err(e) => return Err(self.fail(e)),
			}
		} else {
			None
		};

		let result = self.run_started(start).await;
		if let Some(signals) = signals {
			signals.abort();
		}
		result
	}

	async fn run_started<D, F, Fut>(&self, start: F) -> Result<()>
	where
		D: TunnelDevice + 'static,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<DiscoveryLoop<D>>>,
	{
		let discovery = match AssertUnwindSafe(async move { start().await }).catch_unwind().await {
			Ok(Ok(discovery)) => discovery,
			Ok(Err(e)) => return Err(self.fail(e)),
			Err(panic) => return Err(self.fail(AgentError::StartupPanic(panic_message(panic.as_ref())))),
		};
		let engine = discovery.engine().clone();

		self.state.transition(AgentState::Running)?;
		if let ExecutionMode::Supervised {
			ready_file: Some(path),
		} = &self.mode
		{
			if let Err(e) = signal_ready(path) {
				error!(path = %path.display(), error = %e, "failed to signal readiness");
				close_quietly(engine.close().await);
				return Err(self.fail(AgentError::LoopFault(format!("cannot write ready file: {e}"))));
			}
		}

		let mut task: JoinHandle<Result<()>> = tokio::spawn(discovery.run(self.token.clone()));

		let joined = tokio::select! {
			_ = self.token.cancelled() => {
				info!("shutdown requested");
				(&mut task).await
			}
			joined = &mut task => joined,
		};

		match joined {
			Ok(Ok(())) => {
				self.state.transition(AgentState::ShuttingDown)?;
				close_quietly(engine.close().await);
				self.release_marker();
				self.state.transition(AgentState::Stopped)?;
				info!("agent stopped");
				Ok(())
			}
			Ok(Err(e)) => {
				close_quietly(engine.close().await);
				Err(self.fail(e))
			}
			Err(join_error) => {
				close_quietly(engine.close().await);
				Err(self.fail(AgentError::LoopFault(format!("discovery task aborted: {join_error}"))))
			}
		}
	}

	/// Enter `Failed`, remove the marker and hand the cause back.
	fn fail(&self, cause: AgentError) -> AgentError {
		error!(error = %cause, "agent failed");
		self.token.cancel();
		if let Err(e) = self.state.transition(AgentState::Failed) {
			warn!(error = %e, "could not record failed state");
		}
		self.release_marker();
		cause
	}

	fn release_marker(&self) {
		self.marker.release_if_owned(std::process::id());
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		message.to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

fn close_quietly(result: std::result::Result<(), crate::error::DeviceError>) {
	if let Err(e) = result {
		warn!(error = %e, "failed to close tunnel device");
	}
}

/// Cancel `token` on the first SIGINT or SIGTERM.
fn spawn_signal_watcher(token: CancellationToken) -> Result<JoinHandle<()>> {
	use tokio::signal::unix::{signal, SignalKind};

	let mut terminate = signal(SignalKind::terminate()).map_err(AgentError::Signal)?;
	let mut interrupt = signal(SignalKind::interrupt()).map_err(AgentError::Signal)?;

	Ok(tokio::spawn(async move {
		tokio::select! {
			_ = terminate.recv() => info!("received SIGTERM"),
			_ = interrupt.recv() => info!("received SIGINT"),
			_ = token.cancelled() => return,
		}
		token.cancel();
	}))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::decoder::PeerRecordDecoder;
	use crate::error::{DeviceError, RegistryError};
	use crate::reconcile::ReconciliationEngine;
	use crate::registry::{Registry, RegistryEntry};
	use async_trait::async_trait;
	use loom_mesh_common::{PeerIdentity, PeerSet, WgPublicKey};
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::sync::Arc;
	use std::time::Duration;
	use tempfile::TempDir;

	struct EmptyRegistry {
		panic: bool,
	}

	#[async_trait]
	impl Registry for EmptyRegistry {
		async fn list_under(&self, _prefix: &str) -> std::result::Result<Vec<RegistryEntry>, RegistryError> {
			if self.panic {
				panic!("registry exploded");
			}
			Ok(Vec::new())
		}
	}

	#[derive(Default)]
	struct FlagDevice {
		closed: Arc<AtomicBool>,
	}

	#[async_trait]
	impl TunnelDevice for FlagDevice {
		async fn configure(&mut self, _peers: &PeerSet) -> std::result::Result<(), DeviceError> {
			Ok(())
		}

		async fn close(&mut self) -> std::result::Result<(), DeviceError> {
			self.closed.store(true, Ordering::SeqCst);
			Ok(())
		}
	}

	fn discovery(device: FlagDevice, panic: bool) -> DiscoveryLoop<FlagDevice> {
		let local = PeerIdentity::from_public_key(&WgPublicKey::from_bytes([1; 32]));
		let engine = ReconciliationEngine::new(PeerRecordDecoder::new("/mesh/", local), device, Some(5));
		DiscoveryLoop::new(
			engine,
			Arc::new(EmptyRegistry { panic }),
			Duration::from_secs(10),
			Duration::from_secs(5),
		)
	}

	fn lifecycle(dir: &TempDir, mode: ExecutionMode) -> AgentLifecycle {
		AgentLifecycle::new(LockMarker::new(dir.path().join("agent.pid")), mode).without_signal_handlers()
	}

	fn cancel_after(token: CancellationToken, after: Duration) {
		tokio::spawn(async move {
			tokio::time::sleep(after).await;
			token.cancel();
		});
	}

	#[tokio::test(start_paused = true)]
	async fn foreground_run_stops_cleanly_on_cancel() {
		let dir = TempDir::new().unwrap();
		let agent = lifecycle(&dir, ExecutionMode::Foreground);
		let device = FlagDevice::default();
		let closed = device.closed.clone();
		let marker_path = dir.path().join("agent.pid");

		let mut states = agent.subscribe();
		cancel_after(agent.cancellation_token(), Duration::from_secs(15));

		let observed_marker = marker_path.clone();
		agent
			.run(|| async move {
				assert!(observed_marker.exists());
				Ok(discovery(device, false))
			})
			.await
			.unwrap();

		assert_eq!(agent.state(), AgentState::Stopped);
		assert!(closed.load(Ordering::SeqCst));
		assert!(!marker_path.exists());
		assert!(states.has_changed().unwrap());
		assert_eq!(*states.borrow_and_update(), AgentState::Stopped);
	}

	#[tokio::test(start_paused = true)]
	async fn live_marker_refuses_start() {
		let dir = TempDir::new().unwrap();
		std::fs::write(dir.path().join("agent.pid"), std::process::id().to_string()).unwrap();
		let agent = lifecycle(&dir, ExecutionMode::Foreground);

		let started = Arc::new(AtomicBool::new(false));
		let flag = started.clone();
		let err = agent
			.run(|| async move {
				flag.store(true, Ordering::SeqCst);
				Ok(discovery(FlagDevice::default(), false))
			})
			.await
			.unwrap_err();

		assert!(matches!(err, AgentError::AlreadyRunning { pid } if pid == std::process::id()));
		assert!(!started.load(Ordering::SeqCst));
		assert_eq!(agent.state(), AgentState::Idle);
		assert!(dir.path().join("agent.pid").exists());
	}

	#[tokio::test(start_paused = true)]
	async fn stale_marker_is_replaced() {
		let dir = TempDir::new().unwrap();
		let marker_path = dir.path().join("agent.pid");
		std::fs::write(&marker_path, "2147483632").unwrap();
		let agent = lifecycle(&dir, ExecutionMode::Foreground);
		cancel_after(agent.cancellation_token(), Duration::from_secs(1));

		let observed = marker_path.clone();
		agent
			.run(|| async move {
				let recorded = std::fs::read_to_string(&observed).unwrap();
				assert_eq!(recorded.trim(), std::process::id().to_string());
				Ok(discovery(FlagDevice::default(), false))
			})
			.await
			.unwrap();
		assert_eq!(agent.state(), AgentState::Stopped);
	}

	#[tokio::test(start_paused = true)]
	async fn startup_failure_is_failed_and_clears_marker() {
		let dir = TempDir::new().unwrap();
		let agent = lifecycle(&dir, ExecutionMode::Foreground);

		let err = agent
			.run(|| async { Err::<DiscoveryLoop<FlagDevice>, _>(AgentError::Device(DeviceError::Closed)) })
			.await
			.unwrap_err();

		assert!(matches!(err, AgentError::Device(DeviceError::Closed)));
		assert_eq!(agent.state(), AgentState::Failed);
		assert!(!dir.path().join("agent.pid").exists());
	}

	#[tokio::test(start_paused = true)]
	async fn panicking_startup_is_failed_and_clears_marker() {
		let dir = TempDir::new().unwrap();
		let agent = lifecycle(&dir, ExecutionMode::Foreground);
		let marker_path = dir.path().join("agent.pid");

		let observed = marker_path.clone();
		let err = agent
			.run(|| async move {
				if observed.exists() {
					panic!("device setup exploded");
				}
				Ok(discovery(FlagDevice::default(), false))
			})
			.await
			.unwrap_err();

		assert!(matches!(err, AgentError::StartupPanic(ref message) if message == "device setup exploded"));
		assert_eq!(agent.state(), AgentState::Failed);
		assert!(!marker_path.exists());
	}

	#[tokio::test(start_paused = true)]
	async fn panicking_loop_is_contained() {
		let dir = TempDir::new().unwrap();
		let agent = lifecycle(&dir, ExecutionMode::Foreground);
		let device = FlagDevice::default();
		let closed = device.closed.clone();

		let err = agent.run(|| async move { Ok(discovery(device, true)) }).await.unwrap_err();

		assert!(matches!(err, AgentError::LoopFault(_)));
		assert_eq!(agent.state(), AgentState::Failed);
		assert!(closed.load(Ordering::SeqCst));
		assert!(!dir.path().join("agent.pid").exists());
	}

	#[tokio::test(start_paused = true)]
	async fn supervised_run_signals_ready_and_leaves_foreign_marker() {
		let dir = TempDir::new().unwrap();
		let ready = dir.path().join("agent.ready");
		let agent = lifecycle(
			&dir,
			ExecutionMode::Supervised {
				ready_file: Some(ready.clone()),
			},
		);

		let mut states = agent.subscribe();
		let token = agent.cancellation_token();
		let ready_seen = ready.clone();
		let marker_path = dir.path().join("agent.pid");
		let foreign_marker = marker_path.clone();
		let watcher = tokio::spawn(async move {
			states.wait_for(|s| *s == AgentState::Running).await.unwrap();
			assert!(ready_seen.exists());
			// Another process took over the marker meanwhile.
			std::fs::write(&foreign_marker, "2147483632").unwrap();
			token.cancel();
		});

		agent
			.run(|| async { Ok(discovery(FlagDevice::default(), false)) })
			.await
			.unwrap();
		watcher.await.unwrap();

		assert_eq!(agent.state(), AgentState::Stopped);
		assert!(marker_path.exists());
	}
}
