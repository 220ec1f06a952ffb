// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mesh control-plane agent.
//!
//! Peers publish themselves in a registry; each node polls it, decodes the
//! records into a peer set and pushes that set to its tunnel device whenever
//! it differs from what the device last accepted.

pub mod bootstrap;
pub mod comparator;
pub mod config;
pub mod decoder;
pub mod device;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod supervisor;

pub use bootstrap::build_discovery;
pub use comparator::peer_sets_equal;
pub use config::{LogFormat, LogLevel, MeshConfig};
pub use decoder::PeerRecordDecoder;
pub use device::{TunnelDevice, UserspaceDevice};
pub use discovery::{DiscoveryLoop, TickOutcome};
pub use error::{AgentError, ConfigError, DeviceError, LockError, RegistryError, Result, SupervisorError};
pub use lifecycle::{AgentLifecycle, ExecutionMode};
pub use lock::{default_marker_path, process_alive, request_shutdown, LockMarker, MarkerStatus};
pub use reconcile::{reconcile, ApplyOutcome, ReconciliationEngine};
pub use registry::{EtcdRegistry, Registry, RegistryEntry};
pub use resolver::{DnsResolver, EndpointResolver};
pub use state::{AgentState, StateMachine};
pub use supervisor::{BackgroundAgent, Supervisor};
