// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Identity of a mesh peer as published in the registry.
///
/// This is the literal encoded public key string, compared byte for byte. It
/// is deliberately not normalised: `abc=` and `abc` are different identities.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(Vec<u8>);

impl PeerIdentity {
	pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
		Self(bytes.into())
	}

	/// Identity under which a local key is published.
	pub fn from_public_key(key: &WgPublicKey) -> Self {
		Self(key.to_base64().into_bytes())
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn to_public_key(&self) -> Result<WgPublicKey, PeerConversionError> {
		let encoded =
			std::str::from_utf8(&self.0).map_err(|_| PeerConversionError::NonUtf8Identity)?;
		WgPublicKey::from_base64(encoded).map_err(PeerConversionError::InvalidKey)
	}
}

impl From<&str> for PeerIdentity {
	fn from(s: &str) -> Self {
		Self(s.as_bytes().to_vec())
	}
}

impl fmt::Display for PeerIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&String::from_utf8_lossy(&self.0))
	}
}

impl fmt::Debug for PeerIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PeerIdentity({})", String::from_utf8_lossy(&self.0))
	}
}

#[derive(Debug, Error)]
pub enum PeerConversionError {
	#[error("identity is not valid UTF-8")]
	NonUtf8Identity,

	#[error("identity is not a valid public key: {0}")]
	InvalidKey(#[source] crate::keys::KeyError),

	#[error("invalid address {address:?}: {message}")]
	InvalidAddress { address: String, message: String },

	#[error("endpoint {endpoint:?} did not resolve: {message}")]
	UnresolvableEndpoint { endpoint: String, message: String },
}

/// A complete peer registration decoded from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
	pub identity: PeerIdentity,
	pub address: String,
	pub transport_endpoint: String,
	pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
	/// A bare address becomes a host route (`/32` or `/128`); an address that
	/// already carries a prefix length is used as published.
	pub fn allowed_range(&self) -> Result<IpNet, PeerConversionError> {
		let address = self.address.trim();
		let invalid = |message: String| PeerConversionError::InvalidAddress {
			address: self.address.clone(),
			message,
		};

		if address.contains('/') {
			address.parse::<IpNet>().map_err(|e| invalid(e.to_string()))
		} else {
			address
				.parse::<IpAddr>()
				.map(IpNet::from)
				.map_err(|e| invalid(e.to_string()))
		}
	}
}

/// Peer configuration in the shape the tunnel device consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
	pub identity: PeerIdentity,
	pub public_key: WgPublicKey,
	/// Endpoint exactly as the peer published it, before resolution.
	pub published_endpoint: String,
	pub endpoint: SocketAddr,
	pub allowed_ips: BTreeSet<IpNet>,
	pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
	/// The endpoint as published. Host names stay unresolved, so a name
	/// behind round-robin DNS keeps one representation across lookups.
	pub fn endpoint_repr(&self) -> &str {
		&self.published_endpoint
	}
}

/// Peers keyed by identity. Inserting an identity twice replaces the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
	peers: BTreeMap<PeerIdentity, PeerConfig>,
}

impl PeerSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, peer: PeerConfig) -> Option<PeerConfig> {
		self.peers.insert(peer.identity.clone(), peer)
	}

	pub fn get(&self, identity: &PeerIdentity) -> Option<&PeerConfig> {
		self.peers.get(identity)
	}

	pub fn contains(&self, identity: &PeerIdentity) -> bool {
		self.peers.contains_key(identity)
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}

	pub fn identities(&self) -> impl Iterator<Item = &PeerIdentity> {
		self.peers.keys()
	}

	pub fn iter(&self) -> impl Iterator<Item = &PeerConfig> {
		self.peers.values()
	}
}

impl FromIterator<PeerConfig> for PeerSet {
	fn from_iter<I: IntoIterator<Item = PeerConfig>>(iter: I) -> Self {
		let mut set = PeerSet::new();
		for peer in iter {
			set.insert(peer);
		}
		set
	}
}

impl<'a> IntoIterator for &'a PeerSet {
	type Item = &'a PeerConfig;
	type IntoIter = std::collections::btree_map::Values<'a, PeerIdentity, PeerConfig>;

	fn into_iter(self) -> Self::IntoIter {
		self.peers.values()
	}
}
