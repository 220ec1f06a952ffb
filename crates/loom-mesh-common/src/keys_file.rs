// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPrivateKey};
use std::path::Path;
use thiserror::Error;
use tracing::instrument;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to read key file: {0}")]
	Read(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] crate::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_wg_key_from_file(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = Zeroizing::new(std::fs::read_to_string(path.as_ref())?);
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

/// Looks up `var_name`, then `{var_name}_FILE` pointing at a key file.
#[instrument(skip(var_name), fields(var = %var_name))]
pub fn load_wg_key_env(var_name: &str) -> Result<Option<WgKeyPair>> {
	if let Ok(value) = std::env::var(var_name) {
		let value = Zeroizing::new(value);
		let private = WgPrivateKey::from_base64(value.trim())?;
		return Ok(Some(WgKeyPair::from_private_key(private)));
	}

	let file_var = format!("{}_FILE", var_name);
	if let Ok(path) = std::env::var(&file_var) {
		return load_wg_key_from_file(path).map(Some);
	}

	Ok(None)
}
