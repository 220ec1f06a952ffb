// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_mesh_common::PeerSet;

/// Two peer sets are equal when they hold the same identities and each
/// identity maps to the same published endpoint. Enumeration order plays no
/// part, and neither does what a host name resolved to.
pub fn peer_sets_equal(a: &PeerSet, b: &PeerSet) -> bool {
	if a.len() != b.len() {
		return false;
	}

	a.iter().all(|peer| {
		b.get(&peer.identity)
			.is_some_and(|other| other.endpoint_repr() == peer.endpoint_repr())
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_mesh_common::{PeerConfig, PeerIdentity, WgPublicKey};
	use proptest::prelude::*;
	use std::collections::BTreeSet;

	fn peer(seed: u8, endpoint: &str) -> PeerConfig {
		let public_key = WgPublicKey::from_bytes([seed; 32]);
		PeerConfig {
			identity: PeerIdentity::from_public_key(&public_key),
			public_key,
			published_endpoint: endpoint.to_string(),
			endpoint: endpoint.parse().unwrap(),
			allowed_ips: BTreeSet::new(),
			persistent_keepalive: Some(5),
		}
	}

	#[test]
	fn empty_sets_are_equal() {
		assert!(peer_sets_equal(&PeerSet::new(), &PeerSet::new()));
	}

	#[test]
	fn same_single_peer() {
		let a: PeerSet = [peer(1, "192.168.1.1:51820")].into_iter().collect();
		let b: PeerSet = [peer(1, "192.168.1.1:51820")].into_iter().collect();
		assert!(peer_sets_equal(&a, &b));
	}

	#[test]
	fn different_identities() {
		let a: PeerSet = [peer(1, "192.168.1.1:51820")].into_iter().collect();
		let b: PeerSet = [peer(2, "192.168.1.1:51820")].into_iter().collect();
		assert!(!peer_sets_equal(&a, &b));
	}

	#[test]
	fn different_endpoints() {
		let a: PeerSet = [peer(1, "192.168.1.1:51820")].into_iter().collect();
		let b: PeerSet = [peer(1, "192.168.1.2:51820")].into_iter().collect();
		assert!(!peer_sets_equal(&a, &b));
	}

	#[test]
	fn host_name_resolving_elsewhere_is_equal() {
		let mut first = peer(1, "192.168.1.1:51820");
		first.published_endpoint = "peer-a.mesh.example:51820".to_string();
		let mut rotated = first.clone();
		rotated.endpoint = "192.168.1.9:51820".parse().unwrap();

		let a: PeerSet = [first].into_iter().collect();
		let b: PeerSet = [rotated].into_iter().collect();
		assert!(peer_sets_equal(&a, &b));
	}

	#[test]
	fn different_sizes() {
		let a: PeerSet = [peer(1, "192.168.1.1:51820")].into_iter().collect();
		let b: PeerSet = [peer(1, "192.168.1.1:51820"), peer(2, "192.168.1.2:51820")]
			.into_iter()
			.collect();
		assert!(!peer_sets_equal(&a, &b));
		assert!(!peer_sets_equal(&b, &a));
	}

	#[test]
	fn permuted_insertion_is_equal() {
		let a: PeerSet = [peer(1, "192.168.1.1:51820"), peer(2, "192.168.1.2:51820")]
			.into_iter()
			.collect();
		let b: PeerSet = [peer(2, "192.168.1.2:51820"), peer(1, "192.168.1.1:51820")]
			.into_iter()
			.collect();
		assert!(peer_sets_equal(&a, &b));
	}

	fn arb_peers() -> impl Strategy<Value = Vec<PeerConfig>> {
		prop::collection::vec((0u8..8, 1u16..4), 0..8).prop_map(|items| {
			items
				.into_iter()
				.map(|(seed, port)| peer(seed, &format!("192.0.2.1:{port}")))
				.collect()
		})
	}

	proptest! {
		#[test]
		fn reflexive(peers in arb_peers()) {
			let set: PeerSet = peers.into_iter().collect();
			prop_assert!(peer_sets_equal(&set, &set));
		}

		#[test]
		fn symmetric(a in arb_peers(), b in arb_peers()) {
			let a: PeerSet = a.into_iter().collect();
			let b: PeerSet = b.into_iter().collect();
			prop_assert_eq!(peer_sets_equal(&a, &b), peer_sets_equal(&b, &a));
		}

		#[test]
		fn order_independent(peers in arb_peers()) {
			// Dedupe first so both orders keep the same entry per identity.
			let set: PeerSet = peers.into_iter().collect();
			let forward: Vec<_> = set.iter().cloned().collect();
			let reversed: PeerSet = forward.iter().rev().cloned().collect();
			prop_assert!(peer_sets_equal(&set, &reversed));
		}
	}
}
