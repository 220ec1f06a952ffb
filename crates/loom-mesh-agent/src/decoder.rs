// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turns flat registry entries into typed peer records.
//!
//! Peers publish one key per field:
//!
//! ```text
//! <prefix><identity>/address    10.42.0.7
//! <prefix><identity>/endpoint   198.51.100.4:51820
//! <prefix><identity>/last_seen  2025-01-01T00:00:00Z
//! ```
//!
//! The field is always the final path segment. Everything between the prefix
//! and that segment is the identity, which may itself contain `/` because the
//! standard base64 alphabet does.

use crate::registry::RegistryEntry;
use crate::resolver::{DnsResolver, EndpointResolver};
use chrono::{DateTime, Utc};
use loom_mesh_common::{PeerConfig, PeerConversionError, PeerIdentity, PeerRecord, PeerSet};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const FIELD_ADDRESS: &str = "address";
/// Older nodes publish their tunnel address under `ip`.
const FIELD_ADDRESS_LEGACY: &str = "ip";
const FIELD_ENDPOINT: &str = "endpoint";
const FIELD_LAST_SEEN: &str = "last_seen";
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct PartialRecord {
	address: Option<String>,
	endpoint: Option<String>,
	last_seen: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PeerRecordDecoder {
	prefix: String,
	local: PeerIdentity,
	pinned: BTreeSet<PeerIdentity>,
	resolver: Arc<dyn EndpointResolver>,
	resolve_timeout: Duration,
}

impl PeerRecordDecoder {
	pub fn new(prefix: impl Into<String>, local: PeerIdentity) -> Self {
		Self {
			prefix: prefix.into(),
			local,
			pinned: BTreeSet::new(),
			resolver: Arc::new(DnsResolver),
			resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
		}
	}

	/// Identities configured statically on the device; discovery leaves them alone.
	pub fn with_pinned(mut self, pinned: impl IntoIterator<Item = PeerIdentity>) -> Self {
		self.pinned.extend(pinned);
		self
	}

	pub fn with_resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
		self.resolver = resolver;
		self
	}

	/// Upper bound on each endpoint lookup.
	pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
		self.resolve_timeout = timeout;
		self
	}

	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	fn is_excluded(&self, identity: &[u8]) -> bool {
		identity == self.local.as_bytes() || self.pinned.iter().any(|p| p.as_bytes() == identity)
	}

	/// Complete records for every remote peer in `entries`, ordered by identity.
	pub fn decode(&self, entries: &[RegistryEntry]) -> Vec<PeerRecord> {
		let mut partial: BTreeMap<&str, PartialRecord> = BTreeMap::new();

		for entry in entries {
			let Some(rest) = entry.key.strip_prefix(self.prefix.as_str()) else {
				trace!(key = %entry.key, "key outside registry prefix");
				continue;
			};
			let Some((identity, field)) = rest.rsplit_once('/') else {
				trace!(key = %entry.key, "key has no field segment");
				continue;
			};
			if identity.is_empty() || field.is_empty() {
				trace!(key = %entry.key, "key has an empty segment");
				continue;
			}
			if self.is_excluded(identity.as_bytes()) {
				continue;
			}

			let record = partial.entry(identity).or_default();
			let value = entry.value.trim();
			match field {
				FIELD_ADDRESS | FIELD_ADDRESS_LEGACY if !value.is_empty() => {
					record.address = Some(value.to_string());
				}
				FIELD_ENDPOINT if !value.is_empty() => {
					record.endpoint = Some(value.to_string());
				}
				FIELD_LAST_SEEN => {
					record.last_seen = DateTime::parse_from_rfc3339(value)
						.map(|t| t.with_timezone(&Utc))
						.unwrap_or_default();
				}
				_ => {}
			}
		}

		partial
			.into_iter()
			.filter_map(|(identity, record)| match (record.address, record.endpoint) {
				(Some(address), Some(transport_endpoint)) => Some(PeerRecord {
					identity: PeerIdentity::from(identity),
					address,
					transport_endpoint,
					last_seen: record.last_seen,
				}),
				_ => {
					trace!(%identity, "peer registration incomplete");
					None
				}
			})
			.collect()
	}

	/// Converts records into device configuration.
	///
	/// A record that fails to convert does not affect the others. If the
	/// identity is in `accepted`, its accepted configuration is carried over
	/// so the device keeps the peer; otherwise the record is left out.
	pub async fn to_peer_set(&self, records: Vec<PeerRecord>, keepalive: Option<u16>, accepted: &PeerSet) -> PeerSet {
		let mut set = PeerSet::new();
		for record in records {
			match self.convert(&record, keepalive).await {
				Ok(peer) => {
					set.insert(peer);
				}
				Err(e) => match accepted.get(&record.identity) {
					Some(previous) => {
						warn!(identity = %record.identity, error = %e, "keeping previously accepted peer");
						set.insert(previous.clone());
					}
					None => {
						warn!(identity = %record.identity, error = %e, "skipping peer");
					}
				},
			}
		}
		debug!(peers = set.len(), "built candidate peer set");
		set
	}

	async fn convert(&self, record: &PeerRecord, keepalive: Option<u16>) -> Result<PeerConfig, PeerConversionError> {
		let public_key = record.identity.to_public_key()?;
		let allowed_range = record.allowed_range()?;

		let unresolvable = |message: String| PeerConversionError::UnresolvableEndpoint {
			endpoint: record.transport_endpoint.clone(),
			message,
		};
		let lookup = self.resolver.resolve(&record.transport_endpoint);
		let endpoint = match tokio::time::timeout(self.resolve_timeout, lookup).await {
			Ok(Ok(addr)) => addr,
			Ok(Err(e)) => return Err(unresolvable(e.to_string())),
			Err(_) => return Err(unresolvable(format!("timed out after {:?}", self.resolve_timeout))),
		};

		Ok(PeerConfig {
			identity: record.identity.clone(),
			public_key,
			published_endpoint: record.transport_endpoint.clone(),
			endpoint,
			allowed_ips: BTreeSet::from([allowed_range]),
			persistent_keepalive: keepalive,
		})
	}
}

impl fmt::Debug for PeerRecordDecoder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PeerRecordDecoder")
			.field("prefix", &self.prefix)
			.field("local", &self.local)
			.field("pinned", &self.pinned)
			.field("resolve_timeout", &self.resolve_timeout)
			.finish_non_exhaustive()
	}
}
