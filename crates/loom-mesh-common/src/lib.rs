// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod keys;
pub mod keys_file;
pub mod peer;

pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use keys_file::{load_wg_key_env, load_wg_key_from_file, KeyFileError};
pub use peer::{PeerConfig, PeerConversionError, PeerIdentity, PeerRecord, PeerSet};
